use std::fmt;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::{
    error::Result,
    frames::FrameTable,
    kpage::KPageCount,
    maps::{MapsReader, ShareFilter},
    pagemap::PageMap,
    resolve::{resolve, Resolution},
    sys::{self, SystemInfo},
};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ScanConfig
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// What to do when a process exits between being listed and being inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitedPolicy {
    /// Fail the whole scan.
    Abort,
    /// Log a warning and go on with the next process.
    Skip,
}

impl Default for ExitedPolicy {
    fn default() -> Self {
        ExitedPolicy::Abort
    }
}

/// Everything a scan needs to know, apart from the [`SystemInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Where procfs is mounted.
    pub proc_root: PathBuf,
    /// Also count `r--p` mappings of shared objects.
    pub include_read_only_data: bool,
    /// Scan this process only, instead of every running one.
    pub pid: Option<u64>,
    /// What to do with processes that exit before or while being scanned.
    pub exited: ExitedPolicy,
}

impl ScanConfig {
    pub const DEFAULT_PROC_ROOT: &'static str = "/proc";
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            proc_root: PathBuf::from(Self::DEFAULT_PROC_ROOT),
            include_read_only_data: false,
            pid: None,
            exited: ExitedPolicy::default(),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ScanStats & Savings
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Counters gathered while scanning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Processes whose shareable mappings were all walked.
    pub processes_scanned: u64,
    /// Processes that exited before or while being scanned, under [`ExitedPolicy::Skip`].
    pub processes_skipped: u64,
    /// Shareable mappings visited.
    pub ranges: u64,
    /// Virtual pages looked up in a pagemap.
    pub pages: u64,
    /// Pages that are not resident.
    pub pages_not_present: u64,
    /// Distinct frames whose non-zero count was read from kpagecount. A frame reported as mapped
    /// zero times stays unobserved, so it is read again on every hit but never counted here.
    pub frames_resolved: u64,
    /// Pages backed by a frame that had been resolved already.
    pub pages_already_resolved: u64,
}

impl ScanStats {
    fn tally(&mut self, resolution: Resolution) {
        self.pages += 1;
        match resolution {
            Resolution::NotPresent => self.pages_not_present += 1,
            Resolution::AlreadyResolved { .. } => self.pages_already_resolved += 1,
            Resolution::Resolved { count: 0, .. } => {}
            Resolution::Resolved { .. } => self.frames_resolved += 1,
        }
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processes ({} skipped), {} ranges, {} pages ({} not present, {} already seen), \
             {} frames",
            self.processes_scanned,
            self.processes_skipped,
            self.ranges,
            self.pages,
            self.pages_not_present,
            self.pages_already_resolved,
            self.frames_resolved,
        )
    }
}

/// The result of a whole scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savings {
    /// Pages that would be needed on top of the current ones if no frame were shared.
    pub saved_pages: u64,
    /// The page size the scan ran with, in bytes.
    pub page_size: u64,
    /// What the scan went through to get there.
    pub stats: ScanStats,
}

impl Savings {
    /// The saved memory, in bytes.
    pub fn saved_bytes(&self) -> u64 {
        self.saved_pages * self.page_size
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Scanner
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Drives the scan: walks the shareable mappings of each process, resolves their pages into a
/// single [`FrameTable`] shared by all processes, and reduces it into [`Savings`].
#[derive(Debug)]
pub struct Scanner<K = File> {
    config: ScanConfig,
    sysinfo: SystemInfo,
    filter: ShareFilter,
    table: FrameTable,
    kpagecount: KPageCount<K>,
    stats: ScanStats,
}

impl Scanner<File> {
    /// Allocate the frame table and open `<proc_root>/kpagecount`.
    pub fn new(config: ScanConfig, sysinfo: SystemInfo) -> Result<Self> {
        let kpagecount = KPageCount::open(&config.proc_root)?;
        Self::with_kpagecount(config, sysinfo, kpagecount)
    }
}

impl<K: Read + Seek> Scanner<K> {
    pub fn with_kpagecount(
        config: ScanConfig,
        sysinfo: SystemInfo,
        kpagecount: KPageCount<K>,
    ) -> Result<Self> {
        Ok(Scanner {
            filter: ShareFilter::new(config.include_read_only_data),
            table: FrameTable::new(sysinfo.max_frames())?,
            config,
            sysinfo,
            kpagecount,
            stats: ScanStats::default(),
        })
    }

    /// The processes to scan: the configured one, or every process currently running.
    pub fn pids(&self) -> Result<Vec<u64>> {
        match self.config.pid {
            Some(pid) => Ok(vec![pid]),
            None => sys::pids(&self.config.proc_root),
        }
    }

    /// Resolve every present page of every shareable mapping of process `pid`.
    ///
    /// Under [`ExitedPolicy::Skip`] a process that turns out to have exited, whether before its
    /// files are opened or halfway through its page table, is counted as skipped instead of
    /// failing the scan. Frames it had already contributed stay recorded.
    pub fn scan_process(&mut self, pid: u64) -> Result<()> {
        let before = self.stats;
        match self.walk_process(pid) {
            Ok(()) => {}
            Err(e) if e.is_vanished() && self.config.exited == ExitedPolicy::Skip => {
                warn!("skipping process {}: {}", pid, e);
                self.stats.processes_skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.stats.processes_scanned += 1;
        debug!(
            "process {}: {} shareable ranges, {} pages, {} new frames",
            pid,
            self.stats.ranges - before.ranges,
            self.stats.pages - before.pages,
            self.stats.frames_resolved - before.frames_resolved,
        );
        Ok(())
    }

    fn walk_process(&mut self, pid: u64) -> Result<()> {
        let maps = MapsReader::open(&self.config.proc_root, pid, self.filter, self.sysinfo)?;
        let mut pagemap = PageMap::open(&self.config.proc_root, pid)?;
        for range in maps {
            let range = range?;
            self.stats.ranges += 1;
            for vpn in range.pages {
                let resolution = resolve(&mut pagemap, vpn, &mut self.table, &mut self.kpagecount)?;
                self.stats.tally(resolution);
            }
        }
        Ok(())
    }

    /// Reduce the frame table into the final result.
    pub fn finish(self) -> Savings {
        Savings {
            saved_pages: self.table.saved_pages(),
            page_size: self.sysinfo.page_size(),
            stats: self.stats,
        }
    }

    /// Scan every process returned by [`Scanner::pids`] and reduce the result.
    pub fn run(mut self) -> Result<Savings> {
        info!("Page size: {}", self.sysinfo.page_size());
        info!("Memory size: {}", self.sysinfo.memory_size());
        let pids = self.pids()?;
        if self.config.pid.is_none() {
            let list: Vec<String> = pids.iter().map(u64::to_string).collect();
            info!("Pids: {} (total {})", list.join(" "), pids.len());
        }
        for pid in pids {
            self.scan_process(pid)?;
        }
        let savings = self.finish();
        info!("Scanned {}", savings.stats);
        Ok(savings)
    }
}

/// Run a whole scan against the procfs at `config.proc_root`.
pub fn scan(config: ScanConfig, sysinfo: SystemInfo) -> Result<Savings> {
    Scanner::new(config, sysinfo)?.run()
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;

    use super::*;
    use crate::error::ShareMapError;
    use crate::resolve::tests::present;

    const PAGE: u64 = 4096;

    /// Lay out `<root>/<pid>/{maps,pagemap}` with `records` at the start of the pagemap.
    fn process(root: &Path, pid: u64, maps: &str, records: &[u64]) -> anyhow::Result<()> {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("maps"), maps)?;
        let raw: Vec<u8> = records.iter().flat_map(|r| r.to_ne_bytes()).collect();
        std::fs::write(dir.join("pagemap"), raw)?;
        Ok(())
    }

    fn kpagecount(counts: &[u64]) -> KPageCount<Cursor<Vec<u8>>> {
        let raw = counts.iter().flat_map(|c| c.to_ne_bytes()).collect();
        KPageCount::from_reader("kpagecount".into(), Cursor::new(raw))
    }

    fn config(root: &Path) -> ScanConfig {
        ScanConfig {
            proc_root: root.to_path_buf(),
            ..Default::default()
        }
    }

    const LIB: &str = "00000000-00004000 r-xp 00000000 08:03 77 /usr/lib/libfoo.so.1\n\
                       00004000-00005000 r--p 00004000 08:03 77 /usr/lib/libfoo.so.1\n\
                       00005000-00006000 rw-p 00005000 08:03 77 /usr/lib/libfoo.so.1\n";

    #[test]
    fn test_read_only_data_mode() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let records = [present(0), present(1), 0, present(2), present(3), present(4)];
        process(root.path(), 10, LIB, &records)?;
        let counts = [2, 3, 1, 5, 4, 9];

        let sysinfo = SystemInfo::new(PAGE, 8)?;
        let mut code = Scanner::with_kpagecount(config(root.path()), sysinfo, kpagecount(&counts))?;
        code.scan_process(10)?;
        let code = code.finish();
        // Text spans pages 0..4, and page 2 is not present.
        assert_eq!(code.saved_pages, 1 + 2 + 0);
        assert_eq!(code.stats.pages, 4);
        assert_eq!(code.stats.pages_not_present, 1);

        let with_data = ScanConfig {
            include_read_only_data: true,
            ..config(root.path())
        };
        let mut data = Scanner::with_kpagecount(with_data, sysinfo, kpagecount(&counts))?;
        data.scan_process(10)?;
        let data = data.finish();
        assert_eq!(data.saved_pages, 1 + 2 + 0 + 4);
        assert_eq!(data.stats.ranges, 2);
        Ok(())
    }

    #[test]
    fn test_configured_pid() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let cfg = ScanConfig {
            pid: Some(1234),
            ..config(root.path())
        };
        let scanner = Scanner::with_kpagecount(cfg, SystemInfo::new(PAGE, 1)?, kpagecount(&[]))?;
        assert_eq!(scanner.pids()?, vec![1234]);
        Ok(())
    }

    #[test]
    fn test_exited_process() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let sysinfo = SystemInfo::new(PAGE, 8)?;

        let mut strict = Scanner::with_kpagecount(config(root.path()), sysinfo, kpagecount(&[]))?;
        assert!(matches!(
            strict.scan_process(99),
            Err(ShareMapError::Open { .. })
        ));

        let lenient = ScanConfig {
            exited: ExitedPolicy::Skip,
            ..config(root.path())
        };
        let mut lenient = Scanner::with_kpagecount(lenient, sysinfo, kpagecount(&[]))?;
        lenient.scan_process(99)?;
        let savings = lenient.finish();
        assert_eq!(savings.stats.processes_skipped, 1);
        assert_eq!(savings.stats.processes_scanned, 0);
        assert_eq!(savings.saved_pages, 0);
        Ok(())
    }

    #[test]
    fn test_malformed_maps_is_fatal_even_when_skipping() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        process(root.path(), 5, "garbage\n", &[])?;
        let cfg = ScanConfig {
            exited: ExitedPolicy::Skip,
            ..config(root.path())
        };
        let sysinfo = SystemInfo::new(PAGE, 8)?;
        let mut scanner = Scanner::with_kpagecount(cfg, sysinfo, kpagecount(&[]))?;
        assert!(scanner.scan_process(5).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_count_frames_are_not_counted() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let maps = "00000000-00003000 r-xp 00000000 08:03 77 /usr/lib/libfoo.so.1\n";
        process(root.path(), 3, maps, &[present(1), present(1), present(2)])?;

        let sysinfo = SystemInfo::new(PAGE, 4)?;
        let mut scanner =
            Scanner::with_kpagecount(config(root.path()), sysinfo, kpagecount(&[0, 0, 3]))?;
        scanner.scan_process(3)?;
        let savings = scanner.finish();
        assert_eq!(savings.stats.pages, 3);
        assert_eq!(savings.stats.frames_resolved, 1);
        assert_eq!(savings.stats.pages_already_resolved, 0);
        assert_eq!(savings.saved_pages, 2);
        Ok(())
    }

    #[test]
    fn test_saved_bytes() {
        let savings = Savings {
            saved_pages: 3,
            page_size: PAGE,
            stats: ScanStats::default(),
        };
        assert_eq!(savings.saved_bytes(), 3 * PAGE);
    }
}
