use std::io;

use thiserror::Error;

/// A custom `Result` type for this crate, combining a return value with a [`ShareMapError`]. It
/// is used all over the crate and also returned by many functions and methods of its external
/// API.
pub type Result<T> = std::result::Result<T, ShareMapError>;

/// An error type returned by calls to the API exposed by this crate.
///
/// Every variant is fatal for a scan, except the ones for which [`ShareMapError::is_vanished`]
/// holds when the scan skips exited processes. A page that is merely not present is not an
/// error, and is reported through [`Resolution::NotPresent`] instead.
///
/// [`Resolution::NotPresent`]: enum.Resolution.html#variant.NotPresent
#[derive(Debug, Error)]
pub enum ShareMapError {
    /// Error opening a file.
    #[error("could not open '{path}': {source}")]
    Open {
        /// The path of the file that was attempted to be opened.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error reading from a file.
    #[error("could not read '{path}': {source}")]
    Read {
        /// The path of the file that was attempted to be read.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error seeking in a file.
    #[error("could not seek in '{path}': {source}")]
    Seek {
        /// The path of the file that was attempted to be seeked.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error retrieving `capabilities(7)`. Wrapper for [`CapsError`].
    ///
    /// [`CapsError`]: https://docs.rs/caps/0.5/caps/errors/struct.CapsError.html
    #[error(transparent)]
    Caps(#[from] caps::errors::CapsError),

    /// The effective capability set lacks `CAP_SYS_ADMIN`, so `/proc/kpagecount` and the page
    /// frame numbers in `/proc/<PID>/pagemap` are not accessible.
    #[error("CAP_SYS_ADMIN is required (try running as root)")]
    Privilege,

    /// `/proc/<PID>/pagemap` ended before a page that `/proc/<PID>/maps` had listed, which is
    /// what reading it yields once the process has exited.
    #[error("process {pid} exited while '{path}' was being read")]
    Exited {
        /// The process that went away.
        pid: u64,
        /// The path of the file that came up short.
        path: String,
    },

    /// `sysconf(_SC_PAGESIZE)` failed or returned a non-positive value.
    #[error("failed to obtain the page size: {0}")]
    PageSize(String),

    /// `sysconf(_SC_PHYS_PAGES)` failed or returned a non-positive value.
    #[error("failed to obtain the physical page count: {0}")]
    FrameCount(String),

    /// The frame table cannot be allocated on this platform for the given number of frames.
    #[error("frame table of {0} frames does not fit in the address space")]
    FrameTableTooLarge(u64),

    /// A page frame number read from `/proc/<PID>/pagemap` is not below the frame count bound.
    #[error("PFN 0x{pfn:x} of process {pid} is too large (bound is 0x{max:x} frames)")]
    FrameOutOfRange {
        /// The process whose page table yielded the frame number.
        pid: u64,
        /// The offending page frame number.
        pfn: u64,
        /// The configured maximum frame count.
        max: u64,
    },

    /// Error parsing [`MemoryRegion`].
    ///
    /// [`MemoryRegion`]: struct.MemoryRegion.html
    #[error("could not parse MemoryRegion from '{0}'")]
    ParseMemoryRegion(String),

    /// Error parsing [`PagePermissions`].
    ///
    /// [`PagePermissions`]: struct.PagePermissions.html
    #[error("could not parse valid PagePermissions from '{0}'")]
    ParsePagePermissions(String),

    /// Error parsing [`DeviceNumbers`].
    ///
    /// [`DeviceNumbers`]: struct.DeviceNumbers.html
    #[error("could not parse valid DeviceNumbers from '{0}'")]
    ParseDeviceNumbers(String),

    /// Error parsing a whole line of `/proc/<PID>/maps` into a [`MapsEntry`].
    ///
    /// [`MapsEntry`]: struct.MapsEntry.html
    #[error("could not parse MapsEntry from '{0}'")]
    ParseMapsEntry(String),

    /// Generic integer parsing error.
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

impl ShareMapError {
    /// Returns `true` if the error means that the process being inspected has exited: either
    /// [`ShareMapError::Exited`], or an [`ShareMapError::Open`] error caused by a missing file,
    /// which is what opening `/proc/<PID>/*` yields once the process is gone.
    pub fn is_vanished(&self) -> bool {
        match self {
            ShareMapError::Exited { .. } => true,
            ShareMapError::Open { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
