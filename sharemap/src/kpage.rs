use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, ShareMapError};

/// Size in bytes of each record in `/proc/kpagecount`.
const RECORD_SIZE: u64 = 8;

/// A handle used to read `/proc/kpagecount`: the number of times each physical page frame is
/// mapped, system-wide.
#[derive(Debug)]
pub struct KPageCount<F = File> {
    path: String,
    kcf: F,
}

impl KPageCount<File> {
    /// Open `<proc_root>/kpagecount`. Opening it requires `CAP_SYS_ADMIN`.
    pub fn open(proc_root: &Path) -> Result<Self> {
        let path = proc_root.join("kpagecount");
        let kcf = File::open(&path).map_err(|e| ShareMapError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(KPageCount {
            path: path.display().to_string(),
            kcf,
        })
    }
}

impl<F: Read + Seek> KPageCount<F> {
    /// Wrap an already opened frame-count table; `path` is only used for error reporting.
    pub fn from_reader(path: String, kcf: F) -> Self {
        KPageCount { path, kcf }
    }

    /// Read the number of times that the page with the given `PFN` is mapped.
    ///
    /// # Errors
    ///
    /// The method may return [`ShareMapError::Read`] or [`ShareMapError::Seek`] if either
    /// reading from or seeking into `/proc/kpagecount` fails.
    pub fn count(&mut self, pfn: u64) -> Result<u64> {
        let mut buf = [0; RECORD_SIZE as usize];
        self.kcf
            .seek(SeekFrom::Start(pfn * RECORD_SIZE))
            .map_err(|e| ShareMapError::Seek {
                path: self.path.clone(),
                source: e,
            })?;
        self.kcf
            .read_exact(&mut buf)
            .map_err(|e| ShareMapError::Read {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(u64::from_ne_bytes(buf))
    }
}
