use std::convert::TryFrom;

use crate::error::{Result, ShareMapError};

/// The mapping count observed for every physical page frame, indexed by page frame number.
///
/// A zero count means that the frame has not been observed yet. A frame that the kernel reports
/// as mapped zero times is therefore indistinguishable from an unobserved one, and may be read
/// again; it contributes nothing to the savings either way.
#[derive(Debug, Clone)]
pub struct FrameTable {
    counts: Vec<u64>,
}

impl FrameTable {
    /// Allocate a zeroed table able to hold `max_frames` frames.
    pub fn new(max_frames: u64) -> Result<Self> {
        if max_frames == 0 {
            return Err(ShareMapError::FrameCount("frame count bound is zero".into()));
        }
        let len =
            usize::try_from(max_frames).map_err(|_| ShareMapError::FrameTableTooLarge(max_frames))?;
        Ok(FrameTable {
            counts: vec![0; len],
        })
    }

    /// The number of frames the table can hold; every valid PFN is strictly below it.
    #[inline]
    pub fn max_frames(&self) -> u64 {
        self.counts.len() as u64
    }

    /// The recorded mapping count for `pfn`, or `None` if it has not been observed (or is out of
    /// range).
    #[inline]
    pub fn get(&self, pfn: u64) -> Option<u64> {
        match self.counts.get(usize::try_from(pfn).ok()?) {
            Some(&count) if count > 0 => Some(count),
            _ => None,
        }
    }

    /// Returns `true` if a non-zero mapping count has already been recorded for `pfn`.
    #[inline]
    pub fn is_resolved(&self, pfn: u64) -> bool {
        self.get(pfn).is_some()
    }

    /// Record the mapping count for `pfn`. The caller must have checked `pfn < max_frames()`.
    #[inline]
    pub(crate) fn record(&mut self, pfn: u64, count: u64) {
        self.counts[pfn as usize] = count;
    }

    /// The number of frames with a non-zero recorded count.
    pub fn resolved_frames(&self) -> u64 {
        self.counts.iter().filter(|&&c| c > 0).count() as u64
    }

    /// Sum `count - 1` over every observed frame: the number of pages that would be needed on top
    /// of the existing ones if no frame were shared.
    pub fn saved_pages(&self) -> u64 {
        self.counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| c - 1)
            .sum()
    }
}
