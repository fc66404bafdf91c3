//! Prints the shareable mappings of a process and how each of their pages resolves, read from
//! `/proc/<PID>/maps`, `/proc/<PID>/pagemap` and `/proc/kpagecount`.
//!
//! Mind the peculiarities regarding permissions and `CAP_SYS_ADMIN`, also documented here:
//! https://www.kernel.org/doc/Documentation/vm/pagemap.txt

use std::path::Path;

use sharemap::{
    FrameTable, KPageCount, MapsReader, PageMap, Resolution, ShareFilter, ShareMapError,
    SystemInfo,
};

/// Retrieve a PID from the command line, in a quick and dirty way.
fn parse_args() -> u64 {
    std::env::args()
        .nth(1)
        .expect("Usage: cargo run --example shareable <PID>")
        .parse()
        .expect("<PID> must be a valid integer of a running process")
}

fn main() -> Result<(), ShareMapError> {
    let pid = parse_args();
    let proc_root = Path::new("/proc");

    sharemap::require_privileges()?;
    let sysinfo = SystemInfo::query()?;
    let mut table = FrameTable::new(sysinfo.max_frames())?;
    let mut kpagecount = KPageCount::open(proc_root)?;
    let mut pagemap = PageMap::open(proc_root, pid)?;

    for range in MapsReader::open(proc_root, pid, ShareFilter::new(true), sysinfo)? {
        let range = range?;
        eprintln!("-> {}", range.entry);
        for vpn in range.pages {
            match sharemap::resolve(&mut pagemap, vpn, &mut table, &mut kpagecount)? {
                Resolution::NotPresent => eprintln!("\t- 0x{:x}: {}", vpn, pagemap.entry(vpn)?),
                Resolution::AlreadyResolved { pfn } => {
                    eprintln!("\t- 0x{:x}: pfn 0x{:x} (seen)", vpn, pfn)
                }
                Resolution::Resolved { pfn, count } => {
                    eprintln!("\t- 0x{:x}: pfn 0x{:x} mapped {} times", vpn, pfn, count)
                }
            }
        }
    }
    eprintln!("\n-> saved {} pages", table.saved_pages());

    Ok(())
}
