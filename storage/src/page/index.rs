// storage/src/page/index.rs

use super::PAGE_SIZE;
use crate::PageNo;
use parking_lot::Mutex;

/// Number of free-space intervals a page is divided into.
pub const INTERVALS: usize = 40;

/// Width of one free-space bucket in bytes.
pub const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_no: PageNo,
    pub free_size: usize,
}

/// Free-space directory.
///
/// Pages are filed into `INTERVALS + 1` buckets by free bytes. A page taken
/// out by [`PageIndex::select`] is gone from the directory until its user
/// files it again with [`PageIndex::add`].
pub struct PageIndex {
    buckets: Mutex<Vec<Vec<PageInfo>>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); INTERVALS + 1]),
        }
    }

    pub fn add(&self, page_no: PageNo, free_size: usize) {
        let bucket = (free_size / THRESHOLD).min(INTERVALS);
        self.buckets.lock()[bucket].push(PageInfo { page_no, free_size });
    }

    /// Removes and returns a page with at least `size` free bytes.
    pub fn select(&self, size: usize) -> Option<PageInfo> {
        // Start one bucket up so every entry there has room; records bigger
        // than a page can only ever be found in the last bucket.
        let start = (size / THRESHOLD + 1).min(INTERVALS);

        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut().skip(start) {
            if let Some(pos) = bucket.iter().position(|info| info.free_size >= size) {
                return Some(bucket.remove(pos));
            }
        }
        None
    }

    /// Number of pages currently filed.
    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
