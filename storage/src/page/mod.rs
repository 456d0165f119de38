// storage/src/page/mod.rs

mod cache;
mod index;

pub use cache::{PageCache, PageHandle, PageStore};
pub use index::{PageIndex, PageInfo, INTERVALS, THRESHOLD};

use crate::{uid_of, PageNo, Result, StorageError};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;

/// Size of one page slot in the file. Larger pages span whole multiples of it.
pub const PAGE_SIZE: usize = 16 * 1024;

/// `[declaredSize:4][writeOffset:4]`
pub const HEADER_SIZE: usize = 8;

const SIZE_FIELD: usize = 0;
const OFFSET_FIELD: usize = 4;

struct PageState {
    data: Vec<u8>,
    dirty: bool,
}

impl PageState {
    fn offset(&self) -> usize {
        (&self.data[OFFSET_FIELD..OFFSET_FIELD + 4]).get_u32() as usize
    }

    fn set_offset(&mut self, offset: usize) {
        (&mut self.data[OFFSET_FIELD..OFFSET_FIELD + 4]).put_u32(offset as u32);
    }
}

/// An in-memory page buffer.
///
/// Records are appended at the write offset; the page lock only guards the
/// buffer and its header, not the logical contents of records.
pub struct Page {
    page_no: PageNo,
    state: Mutex<PageState>,
}

impl Page {
    /// A fresh, zero-filled page of `size` bytes (a multiple of [`PAGE_SIZE`]).
    /// New pages start dirty so the first writeback registers them on disk.
    pub fn new(page_no: PageNo, size: usize) -> Self {
        let mut data = vec![0u8; size];
        (&mut data[SIZE_FIELD..SIZE_FIELD + 4]).put_u32(size as u32);
        (&mut data[OFFSET_FIELD..OFFSET_FIELD + 4]).put_u32(HEADER_SIZE as u32);

        Self {
            page_no,
            state: Mutex::new(PageState { data, dirty: true }),
        }
    }

    /// Wraps bytes read from disk, checking the header against the buffer.
    pub fn load(page_no: PageNo, data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::CorruptPage {
                page_no,
                reason: format!("{} bytes is shorter than the page header", data.len()),
            });
        }
        let mut header = &data[..HEADER_SIZE];
        let size = header.get_u32() as usize;
        let offset = header.get_u32() as usize;

        if size != data.len() {
            return Err(StorageError::CorruptPage {
                page_no,
                reason: format!("declared size {} but buffer holds {}", size, data.len()),
            });
        }
        if offset < HEADER_SIZE || offset > size {
            return Err(StorageError::CorruptPage {
                page_no,
                reason: format!("write offset {} out of range", offset),
            });
        }

        Ok(Self {
            page_no,
            state: Mutex::new(PageState { data, dirty: false }),
        })
    }

    /// Number of page slots needed to hold a page with `need` payload bytes.
    pub fn slots_for(need: usize) -> usize {
        (need + HEADER_SIZE).div_ceil(PAGE_SIZE).max(1)
    }

    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    pub fn size(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn offset(&self) -> usize {
        self.state.lock().offset()
    }

    pub fn free_size(&self) -> usize {
        let state = self.state.lock();
        state.data.len() - state.offset()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Appends `bytes` at the write offset and returns where they start.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let offset = state.offset();
        let available = state.data.len() - offset;
        if bytes.len() > available {
            return Err(StorageError::PageFull {
                page_no: self.page_no,
                needed: bytes.len(),
                available,
            });
        }

        state.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        state.set_offset(offset + bytes.len());
        state.dirty = true;
        Ok(offset)
    }

    /// Overwrites bytes in place. The range must lie in the written region.
    pub fn update(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.check_range(&state, offset, bytes.len())?;
        state.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        state.dirty = true;
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        self.check_range(&state, offset, len)?;
        Ok(state.data[offset..offset + len].to_vec())
    }

    /// Runs `write` over the buffer if the page is dirty, and marks the page
    /// clean once it succeeds. Holds the page lock throughout, so no append
    /// can slip in between the write and the clean mark.
    pub fn write_back<F>(&self, write: F) -> Result<bool>
    where
        F: FnOnce(&[u8]) -> Result<()>,
    {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(false);
        }
        write(&state.data)?;
        state.dirty = false;
        Ok(true)
    }

    fn check_range(&self, state: &PageState, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if offset >= HEADER_SIZE && end <= state.offset() => Ok(()),
            _ => Err(StorageError::InvalidRecord {
                uid: uid_of(self.page_no, offset as u32),
                reason: format!(
                    "range {}+{} outside written region {}..{}",
                    offset,
                    len,
                    HEADER_SIZE,
                    state.offset()
                ),
            }),
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Page")
            .field("page_no", &self.page_no)
            .field("size", &state.data.len())
            .field("offset", &state.offset())
            .field("dirty", &state.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(1, PAGE_SIZE);
        assert_eq!(page.page_no(), 1);
        assert_eq!(page.size(), PAGE_SIZE);
        assert_eq!(page.offset(), HEADER_SIZE);
        assert_eq!(page.free_size(), PAGE_SIZE - HEADER_SIZE);
        assert!(page.is_dirty());
    }

    #[test]
    fn test_write_returns_offset() {
        let page = Page::new(1, PAGE_SIZE);
        assert_eq!(page.write(b"hello").unwrap(), HEADER_SIZE);
        assert_eq!(page.write(b"world").unwrap(), HEADER_SIZE + 5);
        assert_eq!(page.offset(), HEADER_SIZE + 10);
        assert_eq!(page.read(HEADER_SIZE + 5, 5).unwrap(), b"world");
    }

    #[test]
    fn test_write_past_end_is_page_full() {
        let page = Page::new(2, PAGE_SIZE);
        page.write(&vec![1u8; PAGE_SIZE - HEADER_SIZE - 4]).unwrap();
        let err = page.write(&[0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::PageFull {
                page_no: 2,
                needed: 5,
                available: 4
            }
        ));
        // An exact fit still succeeds.
        page.write(&[7u8; 4]).unwrap();
        assert_eq!(page.free_size(), 0);
    }

    #[test]
    fn test_update_in_place() {
        let page = Page::new(1, PAGE_SIZE);
        let at = page.write(b"abcdef").unwrap();
        page.update(at + 2, b"XY").unwrap();
        assert_eq!(page.read(at, 6).unwrap(), b"abXYef");
        assert!(page.update(at + 5, b"too long").is_err());
        assert!(page.read(0, 4).is_err());
    }

    #[test]
    fn test_load_round_trips_header() {
        let page = Page::new(4, 2 * PAGE_SIZE);
        page.write(&[9u8; 100]).unwrap();

        let mut bytes = Vec::new();
        page.write_back(|data| {
            bytes = data.to_vec();
            Ok(())
        })
        .unwrap();
        assert!(!page.is_dirty());

        let loaded = Page::load(4, bytes).unwrap();
        assert_eq!(loaded.size(), 2 * PAGE_SIZE);
        assert_eq!(loaded.offset(), HEADER_SIZE + 100);
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_load_rejects_bad_header() {
        let mut bytes = vec![0u8; PAGE_SIZE];
        (&mut bytes[0..4]).put_u32(PAGE_SIZE as u32);
        (&mut bytes[4..8]).put_u32(2);
        assert!(matches!(
            Page::load(1, bytes),
            Err(StorageError::CorruptPage { page_no: 1, .. })
        ));
    }

    #[test]
    fn test_write_back_skips_clean_page() {
        let page = Page::new(1, PAGE_SIZE);
        assert!(page.write_back(|_| Ok(())).unwrap());
        assert!(!page.write_back(|_| panic!("clean page written")).unwrap());
    }

    #[test]
    fn test_failed_write_back_stays_dirty() {
        let page = Page::new(1, PAGE_SIZE);
        let result = page.write_back(|_| Err(StorageError::PageNotFound(1)));
        assert!(result.is_err());
        assert!(page.is_dirty());
    }

    #[test]
    fn test_slots_for() {
        assert_eq!(Page::slots_for(0), 1);
        assert_eq!(Page::slots_for(PAGE_SIZE - HEADER_SIZE), 1);
        assert_eq!(Page::slots_for(PAGE_SIZE - HEADER_SIZE + 1), 2);
        assert_eq!(Page::slots_for(3 * PAGE_SIZE), 4);
    }
}
