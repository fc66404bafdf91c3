use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, ShareMapError};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageMapEntry
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// An entry read from `/proc/<PID>/pagemap` for a single virtual page of a process.
///
/// Documentation and details about the various bits of the API can be found in Linux, at
/// [`doc/Documentation/vm/pagemap.txt`](https://www.kernel.org/doc/Documentation/vm/pagemap.txt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry(u64);

impl std::convert::From<u64> for PageMapEntry {
    fn from(pgmap: u64) -> Self {
        PageMapEntry(pgmap)
    }
}

/// Constants are defined in Linux, at `fs/proc/task_mmu.c`.
impl PageMapEntry {
    /// Size in bytes of each record in `/proc/<PID>/pagemap`.
    pub const SIZE: u64 = 8;

    pub const PM_PFRAME_BITS: u64 = 55;
    pub const PM_PFRAME_MASK: u64 = (1 << Self::PM_PFRAME_BITS) - 1;
    pub const PM_SWAP: u64 = 62;
    pub const PM_PRESENT: u64 = 63;

    /// The raw `u64` value as read from [`procfs(5)`].
    ///
    /// [`procfs(5)`]: https://man7.org/linux/man-pages/man5/proc.5.html
    #[inline(always)]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the [`Self::PM_PRESENT`] bit is set; `false` otherwise.
    #[inline(always)]
    pub fn present(&self) -> bool {
        self.0 >> Self::PM_PRESENT & 1 == 1
    }

    /// Returns `true` if the [`Self::PM_SWAP`] bit is set; `false` otherwise.
    #[inline(always)]
    pub fn swapped(&self) -> bool {
        self.0 >> Self::PM_SWAP & 1 == 1
    }

    /// Returns the page frame number (decoding bits 0-54) if the [`Self::PM_PRESENT`] bit is set;
    /// otherwise returns `None`.
    ///
    /// Without `CAP_SYS_ADMIN` the kernel reports a zero frame number for present pages.
    #[inline]
    pub fn pfn(&self) -> Option<u64> {
        if self.present() {
            Some(self.0 & Self::PM_PFRAME_MASK)
        } else {
            None
        }
    }
}

impl fmt::Display for PageMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pfn() {
            Some(pfn) => write!(f, "PageMapEntry{{ present: true; pfn: 0x{:x} }}", pfn),
            None => write!(
                f,
                "PageMapEntry{{ present: false; swapped: {} }}",
                self.swapped()
            ),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageMap
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle used to read `/proc/<PID>/pagemap` for a specific process, one virtual page at a
/// time.
#[derive(Debug)]
pub struct PageMap<F = File> {
    pid: u64,
    path: String,
    pmf: F,
}

impl PageMap<File> {
    /// Open `<proc_root>/<PID>/pagemap`.
    pub fn open(proc_root: &Path, pid: u64) -> Result<Self> {
        let path = proc_root.join(pid.to_string()).join("pagemap");
        let pmf = File::open(&path).map_err(|e| ShareMapError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(PageMap {
            pid,
            path: path.display().to_string(),
            pmf,
        })
    }
}

impl<F: Read + Seek> PageMap<F> {
    /// Wrap an already opened page table; `path` is only used for error reporting.
    pub fn from_reader(pid: u64, path: String, pmf: F) -> Self {
        PageMap { pid, path, pmf }
    }

    /// Returns the `PID` of the process that this `PageMap` concerns.
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Read the entry for the virtual page with the given index.
    ///
    /// # Errors
    ///
    /// The method may return [`ShareMapError::Seek`] or [`ShareMapError::Read`] if seeking into
    /// or reading from the page table fails. A short read yields [`ShareMapError::Exited`]: the
    /// kernel reports end of file for the page table of a process that has exited.
    pub fn entry(&mut self, vpn: u64) -> Result<PageMapEntry> {
        let mut buf = [0; PageMapEntry::SIZE as usize];
        self.pmf
            .seek(SeekFrom::Start(vpn * PageMapEntry::SIZE))
            .map_err(|e| ShareMapError::Seek {
                path: self.path.clone(),
                source: e,
            })?;
        self.pmf
            .read_exact(&mut buf)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => ShareMapError::Exited {
                    pid: self.pid,
                    path: self.path.clone(),
                },
                _ => ShareMapError::Read {
                    path: self.path.clone(),
                    source: e,
                },
            })?;
        Ok(u64::from_ne_bytes(buf).into())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_all_zero() {
        let e = PageMapEntry::from(0u64);
        assert!(!e.present());
        assert!(!e.swapped());
        assert_eq!(e.pfn(), None);
    }

    #[test]
    fn test_present_bit_only() {
        let e = PageMapEntry::from(1u64 << 63);
        assert!(e.present());
        assert_eq!(e.pfn(), Some(0));
    }

    #[test]
    fn test_max_pfn() {
        let e = PageMapEntry::from(u64::MAX);
        assert_eq!(e.pfn(), Some(PageMapEntry::PM_PFRAME_MASK));
        assert_eq!(PageMapEntry::PM_PFRAME_MASK, 0x007f_ffff_ffff_ffff);
    }

    #[test]
    fn test_flag_bits_do_not_leak_into_pfn() {
        // soft-dirty (55), exclusive (56) and file (61) bits set along with present.
        let raw: u64 = 1 << 63 | 1 << 61 | 1 << 56 | 1 << 55 | 0x1234;
        assert_eq!(PageMapEntry::from(raw).pfn(), Some(0x1234));
    }

    #[test]
    fn test_swapped_is_not_present() {
        let e = PageMapEntry::from(1u64 << 62 | 0x1f);
        assert!(e.swapped());
        assert_eq!(e.pfn(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            PageMapEntry::from(1u64 << 63 | 0xbeef).to_string(),
            "PageMapEntry{ present: true; pfn: 0xbeef }"
        );
        assert_eq!(
            PageMapEntry::from(1u64 << 62).to_string(),
            "PageMapEntry{ present: false; swapped: true }"
        );
    }

    #[test]
    fn test_entry_reads_record_at_offset() -> anyhow::Result<()> {
        let mut raw = Vec::new();
        for vpn in 0..4u64 {
            raw.extend_from_slice(&(1 << 63 | (vpn + 100)).to_ne_bytes());
        }
        let mut pm = PageMap::from_reader(1, "pagemap".into(), Cursor::new(raw));
        assert_eq!(pm.entry(2)?.pfn(), Some(102));
        assert_eq!(pm.entry(0)?.pfn(), Some(100));
        Ok(())
    }

    #[test]
    fn test_short_read_means_exited() {
        let mut pm = PageMap::from_reader(1, "pagemap".into(), Cursor::new(vec![0u8; 12]));
        assert!(pm.entry(0).is_ok());
        assert!(matches!(pm.entry(1), Err(ShareMapError::Exited { pid: 1, .. })));
        assert!(matches!(pm.entry(2), Err(ShareMapError::Exited { .. })));
    }

    proptest! {
        #[test]
        fn pfn_is_low_55_bits_when_present(raw in any::<u64>()) {
            let e = PageMapEntry::from(raw);
            if raw >> 63 == 1 {
                prop_assert_eq!(e.pfn(), Some(raw & ((1 << 55) - 1)));
            } else {
                prop_assert_eq!(e.pfn(), None);
            }
        }
    }
}
