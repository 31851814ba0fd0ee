use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Result};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio;
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use perf_event::events::Hardware;
use perf_event::{Builder, Counter};
use rsprocmaps::Pathname;
use spawn_ptrace::CommandPtraceSpawn;

use crate::errors::TraceError;
use crate::region::{MemSource, Region, RegionList, RegionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Running,
    Terminated,
}

/// Read-only memory capability for a traced process. Carries nothing but
/// the pid, so it can be handed to the region cache while the rest of the
/// target state is mutably borrowed elsewhere.
#[derive(Clone, Copy)]
pub struct TargetMem {
    pid: Pid,
}

impl MemSource for TargetMem {
    fn read_mem(&self, addr: u64, dest: &mut [u8]) -> Result<usize> {
        let remote = uio::RemoteIoVec {
            base: addr as usize,
            len: dest.len(),
        };

        loop {
            match uio::process_vm_readv(
                self.pid,
                &[uio::IoVec::from_mut_slice(dest)],
                &[remote],
            ) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(TraceError::DebugControl {
                        op: "process_vm_readv",
                        pid: self.pid.as_raw(),
                        source,
                    }
                    .into())
                }
            }
        }
    }
}

/// An actively traced process: the ptrace handle, its classified region
/// list, and the optional hardware cycle counter bound to it.
pub struct Target {
    pid: Pid,
    lifecycle: Lifecycle,
    spawned: bool,
    pending: Option<Signal>,
    regions: RegionList,
    name: String,
    maps_warned: bool,
    cycles: Option<Counter>,
    last_cycles: u64,
}

impl Target {
    /// Spawns `path` under ptrace; the child is stopped before its first
    /// instruction when this returns.
    pub fn execvp(path: &str, args: &[String]) -> Result<Self> {
        let child = Command::new(path)
            .args(args)
            .spawn_ptrace()
            .map_err(|source| TraceError::Os {
                msg: format!("failed to execute \"{}\"", path),
                source,
            })?;

        let pid = Pid::from_raw(child.id() as i32);
        log::debug!("spawned {} for tracing as child {}", path, pid);

        Target::new(pid, true, command_name(path))
    }

    /// Attaches to a running process and waits for it to stop.
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid).map_err(|source| TraceError::DebugControl {
            op: "ptrace attach",
            pid: pid.as_raw(),
            source,
        })?;

        loop {
            match wait::waitpid(pid, None) {
                Ok(WaitStatus::Stopped(_, _)) => break,
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    bail!("pid {} exited before it could be traced", pid)
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(TraceError::DebugControl {
                        op: "waitpid",
                        pid: pid.as_raw(),
                        source,
                    }
                    .into())
                }
            }
        }

        Target::new(pid, false, process_name(pid))
    }

    fn new(pid: Pid, spawned: bool, name: String) -> Result<Self> {
        // TRACEEXEC stops the tracee when it loads a new image so the
        // region cache can be invalidated; EXITKILL ties a spawned child's
        // lifetime to ours.
        let mut options = ptrace::Options::PTRACE_O_TRACEEXEC;
        if spawned {
            options |= ptrace::Options::PTRACE_O_EXITKILL;
        }
        ptrace::setoptions(pid, options).map_err(|source| TraceError::DebugControl {
            op: "ptrace setoptions",
            pid: pid.as_raw(),
            source,
        })?;

        let mut target = Target {
            pid,
            lifecycle: Lifecycle::Stopped,
            spawned,
            pending: None,
            regions: RegionList::new(),
            name,
            maps_warned: false,
            cycles: None,
            last_cycles: 0,
        };

        target.refresh_regions()?;

        target.cycles = cycle_counter(pid);
        if let Some(counter) = target.cycles.as_mut() {
            if let Ok(value) = counter.read() {
                target.last_cycles = value;
            }
        }

        Ok(target)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The memory-read capability for this target.
    pub fn mem(&self) -> TargetMem {
        TargetMem { pid: self.pid }
    }

    /// Advances the tracee by one instruction, delivering any signal
    /// recorded by the last `wait`.
    pub fn step(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Terminated {
            bail!("cannot step pid {}: target has terminated", self.pid);
        }

        if let Some(signal) = self.pending {
            log::debug!("sending {:?} to {}", signal, self.pid);
        }

        ptrace::step(self.pid, self.pending).map_err(|source| TraceError::DebugControl {
            op: "ptrace step",
            pid: self.pid.as_raw(),
            source,
        })?;
        self.pending = None;
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Blocks until the next stop event. Returns false once, when the
    /// tracee has terminated. Signals that stopped the tracee (other than
    /// the SIGTRAPs our own tracing generates) are remembered for delivery
    /// on the next step. An execve notification rebuilds the region list
    /// from scratch before returning.
    pub fn wait(&mut self) -> Result<bool> {
        if self.lifecycle == Lifecycle::Terminated {
            return Ok(false);
        }

        loop {
            let status = match wait::waitpid(self.pid, None) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(TraceError::DebugControl {
                        op: "waitpid",
                        pid: self.pid.as_raw(),
                        source,
                    }
                    .into())
                }
            };

            match status {
                WaitStatus::Stopped(_, signal) => {
                    self.lifecycle = Lifecycle::Stopped;
                    self.pending = if signal == Signal::SIGTRAP {
                        None
                    } else {
                        Some(signal)
                    };
                    return Ok(true);
                }
                WaitStatus::PtraceEvent(_, _, event) => {
                    if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
                        // A new image invalidates everything we cached
                        // about the address space; incremental refresh is
                        // not enough.
                        log::debug!("pid {} exec'd a new image", self.pid);
                        self.regions.clear();
                        self.refresh_regions()?;
                    }
                    self.lifecycle = Lifecycle::Stopped;
                    self.pending = None;
                    return Ok(true);
                }
                WaitStatus::Exited(_, status) => {
                    log::warn!("pid {} exited with status {}", self.pid, status);
                    self.lifecycle = Lifecycle::Terminated;
                    return Ok(false);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    log::warn!("pid {} exited on {:?}", self.pid, signal);
                    self.lifecycle = Lifecycle::Terminated;
                    return Ok(false);
                }
                _ => continue,
            }
        }
    }

    /// Program counter of the stopped tracee.
    pub fn get_pc(&self) -> Result<u64> {
        let regs = ptrace::getregs(self.pid).map_err(|source| TraceError::DebugControl {
            op: "ptrace getregs",
            pid: self.pid.as_raw(),
            source,
        })?;
        Ok(regs.rip)
    }

    /// Cycles elapsed since the previous call, or 0 when no hardware
    /// counter is available.
    pub fn get_cycles(&mut self) -> u32 {
        let counter = match self.cycles.as_mut() {
            Some(counter) => counter,
            None => return 0,
        };

        match counter.read() {
            Ok(now) => {
                let delta = now.saturating_sub(self.last_cycles);
                self.last_cycles = now;
                delta.min(u64::from(u32::MAX)) as u32
            }
            Err(err) => {
                log::warn!(
                    "cycle counter read failed ({}); instruction timing disabled",
                    err
                );
                self.cycles = None;
                0
            }
        }
    }

    /// The region containing `addr`. A miss refreshes the region list from
    /// the memory map and retries once; a second miss means our picture of
    /// the address space is wrong and the trace cannot continue.
    pub fn get_region(&mut self, addr: u64) -> Result<&mut Region> {
        if self.regions.find(addr).is_none() {
            log::debug!("refreshing region list; addr = 0x{:08x}", addr);
            self.refresh_regions()?;
        }

        match self.regions.lookup(addr) {
            Some(region) => Ok(region),
            None => Err(TraceError::NoRegion { addr }.into()),
        }
    }

    /// Releases the target. A spawned child is killed; an attached process
    /// resumes running as it was before we arrived. No-op once the target
    /// has terminated.
    pub fn detach(&mut self) {
        if self.lifecycle == Lifecycle::Terminated {
            return;
        }

        if self.spawned {
            if let Err(err) = ptrace::kill(self.pid) {
                log::warn!("failed to kill pid {}: {}", self.pid, err);
            } else {
                let _ = wait::waitpid(self.pid, None);
            }
        } else if let Err(err) = ptrace::detach(self.pid, self.pending) {
            log::warn!("failed to detach from {}: {}", self.pid, err);
        }

        self.pending = None;
        self.lifecycle = Lifecycle::Terminated;
    }

    fn refresh_regions(&mut self) -> Result<()> {
        let maps = match rsprocmaps::from_pid(self.pid.as_raw()) {
            Ok(maps) => maps,
            Err(err) => {
                self.degrade_maps(&err.to_string());
                return Ok(());
            }
        };

        let mut program_seen = false;
        for map in maps {
            let map = match map {
                Ok(map) => map,
                Err(err) => {
                    self.degrade_maps(&err.to_string());
                    return Ok(());
                }
            };

            // Only executable mappings can hold the program counter.
            if !map.permissions.executable {
                continue;
            }

            let readonly = !map.permissions.writable;
            let rtype = classify_mapping(&map.pathname, readonly, &mut program_seen);
            self.regions
                .update(map.address_range.begin, map.address_range.end, rtype, readonly);
        }

        if self.regions.is_empty() {
            self.degrade_maps("no usable mappings");
        }

        Ok(())
    }

    fn degrade_maps(&mut self, why: &str) {
        if !self.maps_warned {
            log::warn!(
                "memory map unavailable ({}); region differentiation disabled",
                why
            );
            self.maps_warned = true;
        }
        self.regions
            .update(0, u64::MAX, RegionType::Unknown, false);
    }
}

/// Classifies one executable mapping. The first file-backed executable
/// mapping is taken to be the program text; later file-backed r-x mappings
/// are shared library text.
fn classify_mapping(pathname: &Pathname, readonly: bool, program_seen: &mut bool) -> RegionType {
    match pathname {
        Pathname::Path(_) => {
            if !*program_seen {
                *program_seen = true;
                RegionType::TextProgram
            } else if readonly {
                RegionType::TextLibrary
            } else {
                RegionType::NontextUnknown
            }
        }
        Pathname::Stack => RegionType::Stack,
        _ => RegionType::NontextUnknown,
    }
}

fn cycle_counter(pid: Pid) -> Option<Counter> {
    let mut counter = match Builder::new()
        .observe_pid(pid.as_raw())
        .kind(Hardware::CPU_CYCLES)
        .build()
    {
        Ok(counter) => counter,
        Err(err) => {
            log::warn!(
                "cycle counter unavailable ({}); instruction timing disabled",
                err
            );
            return None;
        }
    };

    if let Err(err) = counter.enable() {
        log::warn!(
            "cycle counter unavailable ({}); instruction timing disabled",
            err
        );
        return None;
    }

    Some(counter)
}

fn command_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn process_name(pid: Pid) -> String {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|name| name.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| pid.to_string())
}
