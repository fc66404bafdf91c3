//! Estimate how much memory is saved by the sharing of shared object pages among processes.
//!
//! For each process, the `r-xp` (and optionally `r--p`) mappings of `.so` files are read from
//! `/proc/<PID>/maps`; each of their pages is translated to a page frame through
//! `/proc/<PID>/pagemap`, and the number of times that frame is mapped is read from
//! `/proc/kpagecount`, once per frame for the whole system. A frame mapped `N` times saves `N - 1`
//! pages.
//!
//! See [`doc/Documentation/vm/pagemap.txt`](https://www.kernel.org/doc/Documentation/vm/pagemap.txt)
//! for details about the kernel interfaces.
#![doc(html_root_url = "https://docs.rs/sharemap/0.1.0")]
#![warn(rust_2018_idioms)]
#![deny(
    //missing_docs,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
)]

mod error;
mod frames;
mod kpage;
mod maps;
mod pagemap;
mod resolve;
mod scan;
mod sys;

pub use error::{Result, ShareMapError};
pub use frames::FrameTable;
pub use kpage::KPageCount;
pub use maps::{
    DeviceNumbers, MapsEntry, MapsReader, MemoryRegion, PagePermissions, ShareFilter,
    ShareableRange,
};
pub use crate::pagemap::{PageMap, PageMapEntry};
pub use resolve::{resolve, Resolution};
pub use scan::{scan, ExitedPolicy, Savings, ScanConfig, ScanStats, Scanner};
pub use sys::{page_size, pids, require_privileges, SystemInfo};
