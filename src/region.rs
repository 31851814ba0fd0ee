use anyhow::Result;

/// Minimum and maximum number of bytes to cache per region of the target
/// process's address space.
pub const REGION_BUFFER_MINSIZE: usize = 32;
pub const REGION_BUFFER_MAXSIZE: usize = 1024 * 1024;

/// Read-only view of a traced process's memory. `Region::read` pulls bytes
/// through this on cache miss; handing the capability in per call keeps the
/// region layer free of any back reference to the process handle.
pub trait MemSource {
    /// Reads `dest.len()` bytes at `addr`, returning the number of bytes
    /// actually read.
    fn read_mem(&self, addr: u64, dest: &mut [u8]) -> Result<usize>;
}

/// Classification of an address-space region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Unknown = 0,
    TextUnknown = 1,
    TextProgram = 2,
    TextLibrary = 3,
    NontextUnknown = 4,
    Data = 5,
    Stack = 6,
}

pub const REGION_TYPES: [RegionType; RegionType::COUNT] = [
    RegionType::Unknown,
    RegionType::TextUnknown,
    RegionType::TextProgram,
    RegionType::TextLibrary,
    RegionType::NontextUnknown,
    RegionType::Data,
    RegionType::Stack,
];

impl RegionType {
    pub const COUNT: usize = 7;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_text(self) -> bool {
        (self as usize) < RegionType::NontextUnknown as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            RegionType::Unknown => "unknown",
            RegionType::TextUnknown => "text",
            RegionType::TextProgram => "text:program",
            RegionType::TextLibrary => "text:library",
            RegionType::NontextUnknown => "non-text",
            RegionType::Data => "data",
            RegionType::Stack => "stack",
        }
    }
}

/// A contiguous range of the target's virtual memory with uniform type and
/// permissions. Read-only regions carry a cache buffer so the common case
/// of stepping through code costs one cross-process read per buffer fill
/// rather than one per instruction.
pub struct Region {
    start: u64,
    end: u64,
    rtype: RegionType,
    readonly: bool,

    buffer: Option<Vec<u8>>,
    bufaddr: u64,
    buflen: usize,
}

impl Region {
    fn new(start: u64, end: u64, rtype: RegionType, readonly: bool) -> Self {
        let mut region = Region {
            start,
            end,
            rtype,
            readonly,
            buffer: None,
            bufaddr: 0,
            buflen: 0,
        };

        if !readonly {
            return region;
        }

        // Writable regions cannot be cached (self-modifying code), so only
        // read-only regions get a buffer. Text segments are where execution
        // concentrates, so they get the large one.
        let mut bufsize = if rtype.is_text() {
            REGION_BUFFER_MAXSIZE
        } else {
            REGION_BUFFER_MINSIZE
        };
        if bufsize as u64 > end - start {
            bufsize = (end - start) as usize;
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(bufsize).is_ok() {
            buf.resize(bufsize, 0);
            region.buffer = Some(buf);
        } else {
            log::warn!(
                "cannot allocate {} byte cache for region 0x{:08x}-0x{:08x} (non-fatal)",
                bufsize,
                start,
                end
            );
            region.readonly = false;
        }

        region
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn rtype(&self) -> RegionType {
        self.rtype
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Reads target memory through the region cache. The requested range
    /// must lie inside the region.
    pub fn read(&mut self, src: &dyn MemSource, addr: u64, dest: &mut [u8]) -> Result<usize> {
        let len = dest.len();
        assert!(len > 0);
        assert!(addr >= self.start && addr + len as u64 <= self.end);

        let buffer = match self.buffer.as_mut() {
            Some(buffer) if self.readonly => buffer,
            _ => return src.read_mem(addr, dest),
        };

        if addr >= self.bufaddr {
            let offset = (addr - self.bufaddr) as usize;
            if offset + len <= self.buflen {
                dest.copy_from_slice(&buffer[offset..offset + len]);
                return Ok(len);
            }
        }

        // Refill, positioning the window so that small forward loops around
        // `addr` stay resident.
        let cap = buffer.len() as u64;
        let mut window = self.start;
        if window + cap <= addr {
            window = self.end - cap;
        }
        if window > addr {
            window = (addr + len as u64)
                .saturating_sub(cap / 2)
                .max(self.start);
        }

        let want = (self.end - window).min(cap) as usize;
        let got = src.read_mem(window, &mut buffer[..want])?;
        self.bufaddr = window;
        self.buflen = got;

        let offset = (addr - window) as usize;
        let avail = got.saturating_sub(offset).min(len);
        dest[..avail].copy_from_slice(&buffer[offset..offset + avail]);
        Ok(avail)
    }
}

/// Ordered region list with move-to-front semantics: traced code has strong
/// locality, so the region found last is overwhelmingly likely to be the
/// next one asked for.
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    pub fn new() -> Self {
        RegionList {
            regions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Locates the region containing `addr` without perturbing the list.
    pub fn find(&self, addr: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Locates the region containing `addr` and moves it to the head of
    /// the list.
    pub fn lookup(&mut self, addr: u64) -> Option<&mut Region> {
        let pos = self.regions.iter().position(|r| r.contains(addr))?;
        if pos != 0 {
            let region = self.regions.remove(pos);
            self.regions.insert(0, region);
        }
        self.regions.first_mut()
    }

    /// Updates the list to include a region with the given properties.
    /// An existing region that the new one extends (same start, same type
    /// and permissions) is grown in place; any other region containing the
    /// new start address is evicted.
    pub fn update(&mut self, start: u64, end: u64, rtype: RegionType, readonly: bool) {
        assert!(end > start);

        while let Some(pos) = self.regions.iter().position(|r| r.contains(start)) {
            let existing = &mut self.regions[pos];
            if existing.start == start
                && existing.end <= end
                && existing.rtype == rtype
                && existing.readonly == readonly
            {
                existing.end = end;
                return;
            }
            self.regions.remove(pos);
        }

        self.regions.insert(0, Region::new(start, end, rtype, readonly));
    }
}
