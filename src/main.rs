use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{App, Arg, ArgGroup};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::alarm;

mod bits;
mod errors;
mod optree;
mod radix;
mod region;
mod target;

use errors::TraceError;
use optree::OpTree;
use target::Target;

const DEFAULT_CHECKPOINT: u32 = 15 * 60;
const DEFAULT_OPFILE: &str = "/usr/local/share/instrace/oplist-x86.xml";

/// The only state shared with signal context. Handlers write these; the
/// trace loop reads them (and clears the checkpoint flag) once per
/// iteration.
static TERMINATE: AtomicBool = AtomicBool::new(false);
static CHECKPOINT: AtomicBool = AtomicBool::new(false);
static CHECKPOINT_INTERVAL: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_terminate(_signum: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
}

extern "C" fn on_checkpoint(signum: libc::c_int) {
    CHECKPOINT.store(true, Ordering::Relaxed);
    if signum == libc::SIGALRM {
        let interval = CHECKPOINT_INTERVAL.load(Ordering::Relaxed);
        if interval > 0 {
            // alarm(2) is async-signal-safe; re-arm for the next period.
            unsafe {
                libc::alarm(interval);
            }
        }
    }
}

extern "C" fn on_sigchld(_signum: libc::c_int) {
    // An explicit no-op handler, not SIG_IGN: with the default-ignore
    // disposition waitpid would never observe the tracee's stops.
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("verbose")
                .help("Enable verbose diagnostics")
                .short("v")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("print-zero")
                .help("Report counters that were never hit")
                .short("z")
                .long("print-zero"),
        )
        .arg(
            Arg::with_name("checkpoint")
                .help("Seconds between report checkpoints (0 disables)")
                .short("c")
                .long("checkpoint")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("opcode-file")
                .help("Bitpattern definition file (may be repeated)")
                .short("f")
                .long("opcode-file")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("output")
                .help("Report output path")
                .short("o")
                .long("output")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tracee-pid")
                .help("Attach to the given PID for tracing")
                .short("p")
                .long("attach")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("command")
                .help("The program to trace")
                .index(1),
        )
        .arg(
            Arg::with_name("args")
                .help("The command-line arguments to execute the tracee with")
                .raw(true),
        )
        .group(
            ArgGroup::with_name("target")
                .required(true)
                .args(&["tracee-pid", "command"]),
        )
}

fn install_signal_handlers() -> Result<()> {
    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let checkpoint = SigAction::new(
        SigHandler::Handler(on_checkpoint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let chld = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // Dump the collected data before terminating on any of these.
    for signal in &[Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        unsafe { sigaction(*signal, &terminate) }
            .map_err(|err| anyhow!("sigaction {:?}: {}", signal, err))?;
    }

    // Dump collected data on demand: SIGALRM drives periodic
    // checkpointing, SIGUSR1 lets external programs request a snapshot.
    for signal in &[Signal::SIGALRM, Signal::SIGUSR1] {
        unsafe { sigaction(*signal, &checkpoint) }
            .map_err(|err| anyhow!("sigaction {:?}: {}", signal, err))?;
    }

    unsafe { sigaction(Signal::SIGCHLD, &chld) }
        .map_err(|err| anyhow!("sigaction SIGCHLD: {}", err))?;

    Ok(())
}

fn trace(target: &mut Target, optree: &mut OpTree) -> Result<u64> {
    let mut instructions: u64 = 0;

    while !TERMINATE.load(Ordering::Relaxed) {
        let pc = target.get_pc()?;
        let cycles = target.get_cycles();
        let mem = target.mem();
        let region = target.get_region(pc)?;

        optree.update(&mem, region, pc, cycles)?;
        instructions += 1;

        // Periodically record the counters so an interrupted trace still
        // leaves something behind.
        if CHECKPOINT.swap(false, Ordering::Relaxed) {
            log::info!("checkpoint");
            optree.output()?;
        }

        if TERMINATE.load(Ordering::Relaxed) {
            break;
        }

        target.step()?;
        if !target.wait()? {
            break;
        }
    }

    Ok(instructions)
}

fn epilogue(instructions: u64, elapsed: Duration) {
    let millis = elapsed.as_millis() as u64;
    let ips = if millis > 0 {
        rounddiv(instructions * 1_000_000, millis)
    } else {
        0
    };
    log::debug!(
        "{} instructions traced in {}.{:03} seconds ({}.{:03}/sec)",
        instructions,
        millis / 1000,
        millis % 1000,
        ips / 1000,
        ips % 1000
    );
}

fn rounddiv(a: u64, b: u64) -> u64 {
    (a + b / 2) / b
}

fn run() -> Result<()> {
    let matches = match app().get_matches_safe() {
        Ok(matches) => matches,
        Err(err) => match err.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => {
                println!("{}", err.message);
                return Ok(());
            }
            _ => return Err(TraceError::Usage(err.message).into()),
        },
    };

    let verbose = matches.is_present("verbose");
    env_logger::Builder::new()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let checkpoint_interval = match matches.value_of("checkpoint") {
        Some(value) => value.parse::<u32>().map_err(|_| {
            TraceError::Usage(format!("invalid count for -c: \"{}\"", value))
        })?,
        None => DEFAULT_CHECKPOINT,
    };

    let mut optree = OpTree::new(matches.is_present("print-zero"));
    match matches.values_of("opcode-file") {
        Some(files) => {
            for file in files {
                optree.load(file)?;
            }
        }
        None => optree.load(DEFAULT_OPFILE)?,
    }
    optree.ensure_catchall()?;

    let attached = matches.is_present("tracee-pid");
    let mut target = if let Some(value) = matches.value_of("tracee-pid") {
        let pid = value
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| {
                TraceError::Usage(format!("expected process id, got \"{}\"", value))
            })?;
        Target::attach(pid)?
    } else {
        let command = matches
            .value_of("command")
            .ok_or_else(|| TraceError::Usage("command not specified".to_string()))?;
        let args: Vec<String> = matches
            .values_of("args")
            .map(|values| values.map(String::from).collect())
            .unwrap_or_else(Vec::new);
        Target::execvp(command, &args)?
    };

    let outfile = matches
        .value_of("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.trace", target.name())));
    optree.output_open(&outfile)?;
    log::info!("recording results to {}", outfile.display());

    install_signal_handlers()?;
    CHECKPOINT_INTERVAL.store(checkpoint_interval, Ordering::Relaxed);
    if checkpoint_interval == 0 {
        log::info!("checkpoints disabled");
    } else {
        let _ = alarm::set(checkpoint_interval);
        log::info!("checkpoints every {} seconds", checkpoint_interval);
    }

    log::debug!("=== trace started ===");
    let start = Instant::now();

    let instructions = trace(&mut target, &mut optree)?;

    log::debug!("=== trace stopped ===");
    epilogue(instructions, start.elapsed());

    optree.output()?;

    // If we attached to an already running process, detach so it keeps
    // running like it did before we arrived. A spawned child is our
    // responsibility and dies with us instead.
    if TERMINATE.load(Ordering::Relaxed) && attached {
        target.detach();
    }

    Ok(())
}

fn main() {
    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            e.downcast_ref::<TraceError>()
                .map(TraceError::exit_code)
                .unwrap_or(errors::EX_SOFTWARE)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounddiv_rounds_to_nearest() {
        assert_eq!(rounddiv(10, 4), 3);
        assert_eq!(rounddiv(9, 4), 2);
        assert_eq!(rounddiv(0, 7), 0);
        assert_eq!(rounddiv(1_000_000, 3), 333_333);
    }

    #[test]
    fn test_app_requires_a_target() {
        assert!(app().get_matches_from_safe(vec!["instrace"]).is_err());
        assert!(app()
            .get_matches_from_safe(vec!["instrace", "/bin/true"])
            .is_ok());
        assert!(app()
            .get_matches_from_safe(vec!["instrace", "-p", "123"])
            .is_ok());
    }

    #[test]
    fn test_app_rejects_pid_plus_command() {
        assert!(app()
            .get_matches_from_safe(vec!["instrace", "-p", "123", "/bin/true"])
            .is_err());
    }

    #[test]
    fn test_app_accepts_repeated_opcode_files() {
        let matches = app()
            .get_matches_from_safe(vec![
                "instrace", "-f", "a.xml", "-f", "b.xml", "/bin/true",
            ])
            .unwrap();
        let files: Vec<&str> = matches.values_of("opcode-file").unwrap().collect();
        assert_eq!(files, vec!["a.xml", "b.xml"]);
    }
}
