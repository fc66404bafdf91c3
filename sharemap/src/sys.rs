use std::fs;
use std::io;
use std::path::Path;

use caps::{CapSet, Capability};

use crate::error::{Result, ShareMapError};

/// System constants that stay fixed for the duration of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    page_size: u64,
    max_frames: u64,
}

impl SystemInfo {
    /// Build a `SystemInfo` from explicit values, both of which must be non-zero.
    pub fn new(page_size: u64, max_frames: u64) -> Result<Self> {
        if page_size == 0 {
            return Err(ShareMapError::PageSize("page size is zero".into()));
        }
        if max_frames == 0 {
            return Err(ShareMapError::FrameCount("frame count bound is zero".into()));
        }
        Ok(SystemInfo {
            page_size,
            max_frames,
        })
    }

    /// Query the running kernel.
    ///
    /// The frame count bound is twice the number of physical pages, since the highest PFN on a
    /// host is usually larger than `_SC_PHYS_PAGES` because of holes in the physical address
    /// space.
    pub fn query() -> Result<Self> {
        let phys_pages = phys_pages()?;
        let max_frames = phys_pages
            .checked_mul(2)
            .ok_or_else(|| ShareMapError::FrameCount(format!("{} pages overflow", phys_pages)))?;
        Self::new(page_size()?, max_frames)
    }

    /// The size of a page, in bytes.
    #[inline(always)]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// An upper bound on the page frame numbers that the kernel reports.
    #[inline(always)]
    pub fn max_frames(&self) -> u64 {
        self.max_frames
    }

    /// The amount of memory covered by the frame count bound, in bytes.
    pub fn memory_size(&self) -> u64 {
        self.page_size.saturating_mul(self.max_frames)
    }
}

fn sysconf(name: libc::c_int) -> std::result::Result<u64, String> {
    match unsafe { libc::sysconf(name) } {
        -1 => Err(io::Error::last_os_error().to_string()),
        0 => Err("sysconf returned 0".into()),
        n if n < 0 => Err(format!("sysconf returned {}", n)),
        n => Ok(n as u64),
    }
}

/// The system page size, in bytes.
pub fn page_size() -> Result<u64> {
    sysconf(libc::_SC_PAGESIZE).map_err(ShareMapError::PageSize)
}

fn phys_pages() -> Result<u64> {
    sysconf(libc::_SC_PHYS_PAGES).map_err(ShareMapError::FrameCount)
}

/// List the PIDs of all processes currently running, in directory order, by reading the numeric
/// entries of `proc_root`.
pub fn pids(proc_root: &Path) -> Result<Vec<u64>> {
    let open_err = |e| ShareMapError::Open {
        path: proc_root.display().to_string(),
        source: e,
    };
    let mut ret = Vec::new();
    for entry in fs::read_dir(proc_root).map_err(open_err)? {
        let entry = entry.map_err(|e| ShareMapError::Read {
            path: proc_root.display().to_string(),
            source: e,
        })?;
        let name = entry.file_name();
        let pid = match name.to_str() {
            Some(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse::<u64>(),
            _ => continue,
        };
        match pid {
            Ok(pid) if pid > 0 => ret.push(pid),
            _ => continue,
        }
    }
    Ok(ret)
}

/// Fail unless the effective capability set includes `CAP_SYS_ADMIN`, which is required to read
/// `/proc/kpagecount` and the page frame numbers of `/proc/<PID>/pagemap`.
pub fn require_privileges() -> Result<()> {
    if caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN)? {
        Ok(())
    } else {
        Err(ShareMapError::Privilege)
    }
}
