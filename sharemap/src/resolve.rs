use std::io::{Read, Seek};

use log::trace;

use crate::{
    error::{Result, ShareMapError},
    frames::FrameTable,
    kpage::KPageCount,
    pagemap::PageMap,
};

/// The outcome of resolving a single virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The page is not resident (never faulted in, or swapped out).
    NotPresent,
    /// The page is backed by a frame whose count had already been recorded.
    AlreadyResolved { pfn: u64 },
    /// The frame's count was read from `/proc/kpagecount` and recorded.
    Resolved { pfn: u64, count: u64 },
}

/// Resolve the virtual page `vpn` of the process behind `pagemap` to its page frame, and record
/// the frame's mapping count into `table` unless it is already there.
///
/// Every frame is looked up in `kpagecount` at most once for the lifetime of `table`, no matter
/// how many pages of how many processes map it.
///
/// # Errors
///
/// Seek and read failures on either file are fatal, and so is a frame number that does not fit
/// in `table` ([`ShareMapError::FrameOutOfRange`]).
pub fn resolve<P, K>(
    pagemap: &mut PageMap<P>,
    vpn: u64,
    table: &mut FrameTable,
    kpagecount: &mut KPageCount<K>,
) -> Result<Resolution>
where
    P: Read + Seek,
    K: Read + Seek,
{
    let pfn = match pagemap.entry(vpn)?.pfn() {
        Some(pfn) => pfn,
        None => return Ok(Resolution::NotPresent),
    };
    if pfn >= table.max_frames() {
        return Err(ShareMapError::FrameOutOfRange {
            pid: pagemap.pid(),
            pfn,
            max: table.max_frames(),
        });
    }
    if table.is_resolved(pfn) {
        return Ok(Resolution::AlreadyResolved { pfn });
    }

    let count = kpagecount.count(pfn)?;
    trace!("pid {} vpn 0x{:x} -> pfn 0x{:x} count {}", pagemap.pid(), vpn, pfn, count);
    table.record(pfn, count);
    Ok(Resolution::Resolved { pfn, count })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;
    use std::io::{self, Cursor, SeekFrom};
    use std::rc::Rc;

    use super::*;

    /// Wraps a reader, counting how many reads hit each 8-byte record.
    pub(crate) struct CountingReader {
        inner: Cursor<Vec<u8>>,
        pub(crate) reads: Rc<Vec<Cell<u32>>>,
    }

    impl CountingReader {
        pub(crate) fn new(records: &[u64]) -> Self {
            let raw = records.iter().flat_map(|r| r.to_ne_bytes()).collect();
            CountingReader {
                inner: Cursor::new(raw),
                reads: Rc::new(records.iter().map(|_| Cell::new(0)).collect()),
            }
        }
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let idx = (self.inner.position() / 8) as usize;
            if let Some(c) = self.reads.get(idx) {
                c.set(c.get() + 1);
            }
            self.inner.read(buf)
        }
    }

    impl Seek for CountingReader {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    pub(crate) fn present(pfn: u64) -> u64 {
        1 << 63 | pfn
    }

    fn pagemap(pid: u64, records: &[u64]) -> PageMap<Cursor<Vec<u8>>> {
        let raw = records.iter().flat_map(|r| r.to_ne_bytes()).collect();
        PageMap::from_reader(pid, format!("{}/pagemap", pid), Cursor::new(raw))
    }

    #[test]
    fn test_not_present_does_not_touch_kpagecount() -> anyhow::Result<()> {
        let mut pm = pagemap(1, &[0, 1 << 62 | 3]);
        let kcf = CountingReader::new(&[5, 5, 5, 5]);
        let reads = Rc::clone(&kcf.reads);
        let mut kpc = KPageCount::from_reader("kpagecount".into(), kcf);
        let mut table = FrameTable::new(4)?;

        assert_eq!(resolve(&mut pm, 0, &mut table, &mut kpc)?, Resolution::NotPresent);
        assert_eq!(resolve(&mut pm, 1, &mut table, &mut kpc)?, Resolution::NotPresent);
        assert!(reads.iter().all(|c| c.get() == 0));
        assert_eq!(table.resolved_frames(), 0);
        Ok(())
    }

    #[test]
    fn test_frame_is_read_once_across_processes() -> anyhow::Result<()> {
        let mut a = pagemap(1, &[present(2), present(3), present(2)]);
        let mut b = pagemap(2, &[present(3), present(2)]);
        let kcf = CountingReader::new(&[0, 0, 4, 2]);
        let reads = Rc::clone(&kcf.reads);
        let mut kpc = KPageCount::from_reader("kpagecount".into(), kcf);
        let mut table = FrameTable::new(4)?;

        assert_eq!(
            resolve(&mut a, 0, &mut table, &mut kpc)?,
            Resolution::Resolved { pfn: 2, count: 4 }
        );
        assert_eq!(
            resolve(&mut a, 1, &mut table, &mut kpc)?,
            Resolution::Resolved { pfn: 3, count: 2 }
        );
        assert_eq!(
            resolve(&mut a, 2, &mut table, &mut kpc)?,
            Resolution::AlreadyResolved { pfn: 2 }
        );
        for vpn in 0..2 {
            assert!(matches!(
                resolve(&mut b, vpn, &mut table, &mut kpc)?,
                Resolution::AlreadyResolved { .. }
            ));
        }

        assert_eq!(reads[2].get(), 1);
        assert_eq!(reads[3].get(), 1);
        assert_eq!(table.saved_pages(), 3 + 1);
        Ok(())
    }

    #[test]
    fn test_pfn_at_bound_is_fatal() -> anyhow::Result<()> {
        let mut pm = pagemap(9, &[present(3), present(4)]);
        let mut kpc = KPageCount::from_reader("kpagecount".into(), CountingReader::new(&[1; 8]));
        let mut table = FrameTable::new(4)?;

        assert!(resolve(&mut pm, 0, &mut table, &mut kpc).is_ok());
        match resolve(&mut pm, 1, &mut table, &mut kpc) {
            Err(ShareMapError::FrameOutOfRange { pid, pfn, max }) => {
                assert_eq!((pid, pfn, max), (9, 4, 4));
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_short_kpagecount_is_fatal() -> anyhow::Result<()> {
        let mut pm = pagemap(1, &[present(3)]);
        let mut kpc = KPageCount::from_reader("kpagecount".into(), CountingReader::new(&[1, 1]));
        let mut table = FrameTable::new(4)?;

        assert!(matches!(
            resolve(&mut pm, 0, &mut table, &mut kpc),
            Err(ShareMapError::Read { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_page_past_pagemap_end_is_fatal() -> anyhow::Result<()> {
        let mut pm = pagemap(1, &[present(0)]);
        let mut kpc = KPageCount::from_reader("kpagecount".into(), CountingReader::new(&[1]));
        let mut table = FrameTable::new(1)?;

        assert!(resolve(&mut pm, 1, &mut table, &mut kpc).is_err());
        Ok(())
    }
}
