use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::ops::Range;
use std::path::Path;

use bitflags::bitflags;

use crate::{
    error::{Result, ShareMapError},
    sys::SystemInfo,
};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MemoryRegion
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A region of virtual memory, defined by the first address that it includes and the first
/// address past its end.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl MemoryRegion {
    /// Returns the first address included in the memory region.
    #[inline(always)]
    pub fn start_address(&self) -> u64 {
        self.start
    }

    /// Returns the first address past the end of the memory region.
    #[inline(always)]
    pub fn end_address(&self) -> u64 {
        self.end
    }

    /// Returns the size of the memory region, in bytes.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns the half-open range of virtual page indices that the region spans, for the page
    /// size of `sysinfo`.
    #[inline]
    pub fn pages(&self, sysinfo: &SystemInfo) -> Range<u64> {
        self.start / sysinfo.page_size()..self.end / sysinfo.page_size()
    }
}

impl std::convert::TryFrom<(u64, u64)> for MemoryRegion {
    type Error = ShareMapError;

    fn try_from((start, end): (u64, u64)) -> Result<Self> {
        if start > end {
            return Err(ShareMapError::ParseMemoryRegion(format!("{:x}-{:x}", start, end)));
        }
        Ok(MemoryRegion { start, end })
    }
}

impl std::str::FromStr for MemoryRegion {
    type Err = ShareMapError;

    fn from_str(s: &str) -> Result<Self> {
        use std::convert::TryFrom;

        let parse = |addr: &str| {
            u64::from_str_radix(addr, 16).map_err(|_| ShareMapError::ParseMemoryRegion(s.into()))
        };
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| ShareMapError::ParseMemoryRegion(s.into()))?;
        MemoryRegion::try_from((parse(start)?, parse(end)?))
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:016x}-0x{:016x} ({:5}K)",
            self.start,
            self.end,
            self.size() / 1024,
        )
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PagePermissions
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// The permissions that a page may have.
    #[derive(Default)]
    pub struct PagePermissions: u8 {
        /// Permission to be read.
        const READ    = 1 << 0;
        /// Permission to be written.
        const WRITE   = 1 << 1;
        /// Permission to be executed.
        const EXECUTE = 1 << 2;
        /// A page can be `shared` or `private` (i.e., copy-on-write).
        const SHARED  = 1 << 3;
    }
}

impl PagePermissions {
    /// `r-xp`: the text segment of a shared object.
    pub const READ_EXEC_PRIVATE: Self = Self {
        bits: Self::READ.bits | Self::EXECUTE.bits,
    };
    /// `r--p`: a read-only data segment of a shared object.
    pub const READ_ONLY_PRIVATE: Self = Self::READ;
}

impl std::str::FromStr for PagePermissions {
    type Err = ShareMapError;

    fn from_str(s: &str) -> Result<Self> {
        let b = s.as_bytes();
        if b.len() != 4 {
            return Err(ShareMapError::ParsePagePermissions(s.into()));
        }
        let mut ret: PagePermissions = Default::default();
        for &(c, set, flag) in [
            (b[0], b'r', Self::READ),
            (b[1], b'w', Self::WRITE),
            (b[2], b'x', Self::EXECUTE),
        ]
        .iter()
        {
            match c {
                b'-' => {}
                c if c == set => ret |= flag,
                _ => return Err(ShareMapError::ParsePagePermissions(s.into())),
            }
        }
        match b[3] {
            b's' => ret |= Self::SHARED,
            b'p' => {}
            _ => return Err(ShareMapError::ParsePagePermissions(s.into())),
        }
        Ok(ret)
    }
}

impl fmt::Display for PagePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ret = "---p".to_owned();
        if self.contains(Self::READ) {
            ret.replace_range(0..1, "r");
        }
        if self.contains(Self::WRITE) {
            ret.replace_range(1..2, "w");
        }
        if self.contains(Self::EXECUTE) {
            ret.replace_range(2..3, "x");
        }
        if self.contains(Self::SHARED) {
            ret.replace_range(3..4, "s");
        }
        write!(f, "{}", ret)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// DeviceNumbers
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Major and minor numbers of a file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumbers {
    major: u16, // major: u12
    minor: u32, // minor: u20
}

impl DeviceNumbers {
    /// Retrieve the major number.
    #[inline(always)]
    pub fn major(&self) -> u16 {
        self.major
    }

    /// Retrieve the minor number.
    #[inline(always)]
    pub fn minor(&self) -> u32 {
        self.minor
    }
}

impl std::convert::TryFrom<(u32, u32)> for DeviceNumbers {
    type Error = ShareMapError;

    fn try_from((major, minor): (u32, u32)) -> Result<Self> {
        if major >= 1 << 12 || minor >= 1 << 20 {
            return Err(ShareMapError::ParseDeviceNumbers(format!(
                "{:x}:{:x}",
                major, minor
            )));
        }
        Ok(DeviceNumbers {
            major: major as u16,
            minor,
        })
    }
}

impl std::str::FromStr for DeviceNumbers {
    type Err = ShareMapError;

    fn from_str(s: &str) -> Result<Self> {
        use std::convert::TryFrom;

        let parse = |num: &str| {
            u32::from_str_radix(num, 16).map_err(|_| ShareMapError::ParseDeviceNumbers(s.into()))
        };
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| ShareMapError::ParseDeviceNumbers(s.into()))?;
        DeviceNumbers::try_from((parse(major)?, parse(minor)?))
    }
}

impl fmt::Display for DeviceNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.major, self.minor)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MapsEntry
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// An entry read from `/proc/<PID>/maps` for a process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    /// The virtual memory region that the mapping concerns.
    pub(crate) region: MemoryRegion,
    /// The possible ways that pages in the memory region are allowed to be accessed.
    perms: PagePermissions,
    /// The offset in the file backing the mapping (if any) where the mapping begins.
    offset: u64,
    /// The major and minor numbers of the file backing the mapping, if any.
    dev: DeviceNumbers,
    /// The inode of the file backing the mapping, if any.
    inode: u64,
    /// The name of the file backing the mapping (if any), or a pseudo-path, as described in
    /// [`procfs(5)`].
    ///
    /// [`procfs(5)`]: https://man7.org/linux/man-pages/man5/proc.5.html
    pathname: Option<String>,
}

impl MapsEntry {
    /// Retrieve the virtual memory region of the mapping.
    #[inline(always)]
    pub fn memory_region(&self) -> MemoryRegion {
        self.region
    }

    /// Retrieve the permissions for the pages of the particular mapping, which dictate the
    /// possible ways that the pages of the mapping are allowed to be accessed.
    #[inline(always)]
    pub fn permissions(&self) -> PagePermissions {
        self.perms
    }

    /// Retrieve the offset in the file backing the mapping (if any) where the mapping begins.
    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Retrieve the major and minor numbers of the file backing the mapping, if any.
    #[inline(always)]
    pub fn device_numbers(&self) -> DeviceNumbers {
        self.dev
    }

    /// Retrieve the inode of the file backing the mapping, if any.
    #[inline(always)]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Retrieve the name of the file backing the mapping (if any), or a pseudo-path, as described
    /// in [`procfs(5)`].
    ///
    /// [`procfs(5)`]: https://man7.org/linux/man-pages/man5/proc.5.html
    pub fn path(&self) -> Option<&str> {
        self.pathname.as_deref()
    }
}

/// Splits the next whitespace-delimited column off the front of `rest`.
fn next_column<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let s = rest.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or_else(|| s.len());
    let (column, tail) = s.split_at(end);
    *rest = tail;
    Some(column)
}

impl std::str::FromStr for MapsEntry {
    type Err = ShareMapError;

    fn from_str(s: &str) -> Result<Self> {
        let mut rest = s;
        let mut column =
            || next_column(&mut rest).ok_or_else(|| ShareMapError::ParseMapsEntry(s.into()));
        let region = column()?.parse::<MemoryRegion>()?;
        let perms = column()?.parse::<PagePermissions>()?;
        let offset = u64::from_str_radix(column()?, 16)?;
        let dev = column()?.parse::<DeviceNumbers>()?;
        let inode = column()?.parse::<u64>()?;

        // Whatever follows the inode is the path, which may itself contain whitespace.
        let path = rest.trim_start().trim_end_matches('\n');
        Ok(MapsEntry {
            region,
            perms,
            offset,
            dev,
            inode,
            pathname: if path.is_empty() {
                None
            } else {
                Some(path.to_owned())
            },
        })
    }
}

impl fmt::Display for MapsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:08x} {} {} {}",
            self.region,
            self.perms,
            self.offset,
            self.dev,
            self.inode,
            self.path().unwrap_or(""),
        )
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ShareFilter
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Decides which mappings are candidates for page sharing across processes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShareFilter {
    /// Also consider `r--p` mappings (read-only data of shared objects), besides `r-xp` ones.
    pub include_read_only_data: bool,
}

impl ShareFilter {
    /// The substring that marks a backing file as a shared object.
    pub const SHARED_OBJECT_MARKER: &'static str = ".so";

    pub fn new(include_read_only_data: bool) -> Self {
        ShareFilter {
            include_read_only_data,
        }
    }

    /// Returns `true` if the given mapping is backed by a shared object file (non-zero inode,
    /// `.so` in its path) and its permissions are `r-xp`, or `r--p` when read-only data is
    /// included.
    pub fn is_shareable(&self, entry: &MapsEntry) -> bool {
        let perms_ok = entry.perms == PagePermissions::READ_EXEC_PRIVATE
            || (self.include_read_only_data && entry.perms == PagePermissions::READ_ONLY_PRIVATE);
        perms_ok
            && entry.inode != 0
            && entry
                .path()
                .map_or(false, |p| p.contains(Self::SHARED_OBJECT_MARKER))
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MapsReader
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A shareable mapping, along with the half-open range of virtual page indices that it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareableRange {
    /// The parsed line of `/proc/<PID>/maps`.
    pub entry: MapsEntry,
    /// Virtual page indices, suitable for [`PageMap::entry`](crate::PageMap::entry).
    pub pages: Range<u64>,
}

/// Streams the [`ShareableRange`]s of a process, parsing `/proc/<PID>/maps` one line at a time.
///
/// The iterator is lazy, finite and cannot be restarted; it yields an error for the first line
/// that cannot be read or parsed.
#[derive(Debug)]
pub struct MapsReader<R> {
    pid: u64,
    path: String,
    lines: Lines<R>,
    filter: ShareFilter,
    sysinfo: SystemInfo,
}

impl MapsReader<BufReader<File>> {
    /// Open `<proc_root>/<PID>/maps`.
    pub fn open(
        proc_root: &Path,
        pid: u64,
        filter: ShareFilter,
        sysinfo: SystemInfo,
    ) -> Result<Self> {
        let path = proc_root.join(pid.to_string()).join("maps");
        let file = File::open(&path).map_err(|e| ShareMapError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self::from_reader(
            pid,
            path.display().to_string(),
            BufReader::with_capacity(1 << 14, file),
            filter,
            sysinfo,
        ))
    }
}

impl<R: BufRead> MapsReader<R> {
    /// Wrap an already opened maps table; `path` is only used for error reporting.
    pub fn from_reader(
        pid: u64,
        path: String,
        reader: R,
        filter: ShareFilter,
        sysinfo: SystemInfo,
    ) -> Self {
        MapsReader {
            pid,
            path,
            lines: reader.lines(),
            filter,
            sysinfo,
        }
    }

    /// Returns the `PID` of the process whose maps are being read.
    pub fn pid(&self) -> u64 {
        self.pid
    }
}

impl<R: BufRead> Iterator for MapsReader<R> {
    type Item = Result<ShareableRange>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(ShareMapError::Read {
                        path: self.path.clone(),
                        source: e,
                    }))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let entry: MapsEntry = match line.parse() {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if !self.filter.is_shareable(&entry) {
                continue;
            }
            let pages = entry.region.pages(&self.sysinfo);
            return Some(Ok(ShareableRange { entry, pages }));
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
