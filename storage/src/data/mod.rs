// storage/src/data/mod.rs

//! Addressable records.
//!
//! A record is stored in a page as `[valid:1][size:4][payload:size]` and is
//! addressed by the uid of its envelope. Records are handed out through a
//! reference-counted cache, so every holder of a uid shares one [`DataItem`]
//! and its read/write lock.

use crate::cache::{CacheBackend, RefCountCache};
use crate::page::{PageCache, PageHandle, PageIndex, HEADER_SIZE};
use crate::{split_uid, uid_of, PageNo, Result, StorageError, Uid};
use bytes::{Buf, BufMut};
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

const VALID_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
const DATA_OFFSET: usize = 5;

/// Bytes the envelope adds in front of the payload.
pub const ENVELOPE_SIZE: usize = DATA_OFFSET;

const VALID: u8 = 1;
const INVALID: u8 = 0;

pub struct DataItem {
    uid: Uid,
    offset: usize,
    size: usize,
    page: PageHandle,
    lock: RwLock<()>,
    before_image: Mutex<Option<Vec<u8>>>,
}

impl DataItem {
    /// Builds a valid envelope around `data`.
    pub fn wrap(data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(ENVELOPE_SIZE + data.len());
        raw.put_u8(VALID);
        raw.put_u32(data.len() as u32);
        raw.put_slice(data);
        raw
    }

    fn load(uid: Uid, page: PageHandle) -> Result<Self> {
        let (_, offset) = split_uid(uid);
        let offset = offset as usize;

        let header = page.read(offset, ENVELOPE_SIZE)?;
        let mut cursor = &header[SIZE_OFFSET..];
        let size = cursor.get_u32() as usize;

        if offset + ENVELOPE_SIZE + size > page.offset() {
            return Err(StorageError::InvalidRecord {
                uid,
                reason: format!("payload of {} bytes runs past the written region", size),
            });
        }

        Ok(Self {
            uid,
            offset,
            size,
            page,
            lock: RwLock::new(()),
            before_image: Mutex::new(None),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn page_no(&self) -> PageNo {
        self.page.page_no()
    }

    /// Payload length, fixed at insert.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_valid(&self) -> Result<bool> {
        let _guard = self.lock.read();
        Ok(self.page.read(self.offset + VALID_OFFSET, 1)?[0] == VALID)
    }

    /// A copy of the payload.
    pub fn data(&self) -> Result<Vec<u8>> {
        let _guard = self.lock.read();
        self.page.read(self.offset + DATA_OFFSET, self.size)
    }

    /// Reads `len` payload bytes starting at `pos`.
    pub fn read_at(&self, pos: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(pos, len)?;
        let _guard = self.lock.read();
        self.page.read(self.offset + DATA_OFFSET + pos, len)
    }

    /// Replaces the whole payload. The new payload must have the same size.
    pub fn update(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size {
            return Err(StorageError::InvalidRecord {
                uid: self.uid,
                reason: format!("update of {} bytes into a {} byte record", bytes.len(), self.size),
            });
        }
        self.update_at(0, bytes)
    }

    /// Overwrites part of the payload, keeping the previous envelope as the
    /// pre-image for [`DataItem::rollback`].
    pub fn update_at(&self, pos: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(pos, bytes.len())?;
        let _guard = self.lock.write();
        self.capture_before_image()?;
        self.page.update(self.offset + DATA_OFFSET + pos, bytes)
    }

    /// Overwrites `expected` at `pos` with `new` only if the bytes there still
    /// equal `expected`. Returns whether the write happened.
    pub fn compare_and_update_at(&self, pos: usize, expected: &[u8], new: &[u8]) -> Result<bool> {
        self.check_range(pos, expected.len().max(new.len()))?;
        let _guard = self.lock.write();
        let current = self
            .page
            .read(self.offset + DATA_OFFSET + pos, expected.len())?;
        if current != expected {
            return Ok(false);
        }
        self.capture_before_image()?;
        self.page.update(self.offset + DATA_OFFSET + pos, new)?;
        Ok(true)
    }

    pub fn update_valid(&self, valid: bool) -> Result<()> {
        let _guard = self.lock.write();
        self.capture_before_image()?;
        let flag = if valid { VALID } else { INVALID };
        self.page.update(self.offset + VALID_OFFSET, &[flag])
    }

    /// Restores the envelope captured before the last update. Returns false
    /// if there was nothing to restore.
    pub fn rollback(&self) -> Result<bool> {
        let _guard = self.lock.write();
        match self.before_image.lock().take() {
            Some(image) => {
                self.page.update(self.offset, &image)?;
                debug!("rolled back record {:#x}", self.uid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The envelope as it was before the last update, if any.
    pub fn before_image(&self) -> Option<Vec<u8>> {
        self.before_image.lock().clone()
    }

    // Caller holds the write lock.
    fn capture_before_image(&self) -> Result<()> {
        let image = self.page.read(self.offset, ENVELOPE_SIZE + self.size)?;
        *self.before_image.lock() = Some(image);
        Ok(())
    }

    fn check_range(&self, pos: usize, len: usize) -> Result<()> {
        match pos.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(StorageError::InvalidRecord {
                uid: self.uid,
                reason: format!("range {}+{} outside {} byte payload", pos, len, self.size),
            }),
        }
    }
}

impl std::fmt::Debug for DataItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataItem")
            .field("uid", &format_args!("{:#x}", self.uid))
            .field("size", &self.size)
            .finish()
    }
}

/// Loads records through the page cache. Records write back with their page,
/// so eviction has nothing to do beyond dropping the page handle.
struct ItemStore {
    pages: PageCache,
}

impl CacheBackend for ItemStore {
    type Item = DataItem;

    fn load(&self, uid: Uid) -> Result<DataItem> {
        let (page_no, _) = split_uid(uid);
        let page = self.pages.get(page_no)?;
        DataItem::load(uid, page)
    }

    fn evict(&self, _uid: Uid, _item: &DataItem) -> Result<()> {
        Ok(())
    }
}

/// A referenced record. Dropping it releases the reference.
pub struct DataItemRef {
    dm: DataManager,
    item: Arc<DataItem>,
}

impl DataItemRef {
    pub fn try_clone(&self) -> Result<DataItemRef> {
        self.dm.get(self.item.uid())
    }
}

impl Deref for DataItemRef {
    type Target = DataItem;

    fn deref(&self) -> &DataItem {
        &self.item
    }
}

impl Drop for DataItemRef {
    fn drop(&mut self) {
        if let Err(e) = self.dm.release(self.item.uid()) {
            error!("failed to release record {:#x}: {}", self.item.uid(), e);
        }
    }
}

struct DataManagerInner {
    pages: PageCache,
    index: PageIndex,
    items: RefCountCache<ItemStore>,
}

/// Allocates and locates records in one page file. Cloning shares it.
#[derive(Clone)]
pub struct DataManager {
    inner: Arc<DataManagerInner>,
}

impl DataManager {
    pub fn create(path: &Path) -> Result<Self> {
        let pages = PageCache::create(path)?;
        Ok(Self::with_pages(pages, PageIndex::new()))
    }

    /// Opens an existing file and refiles every page's free space.
    pub fn open(path: &Path) -> Result<Self> {
        let pages = PageCache::open(path)?;
        let index = PageIndex::new();
        let mut count = 0;
        for info in pages.scan_free_space()? {
            index.add(info.page_no, info.free_size);
            count += 1;
        }
        info!("rebuilt free-space index for {} pages", count);
        Ok(Self::with_pages(pages, index))
    }

    fn with_pages(pages: PageCache, index: PageIndex) -> Self {
        Self {
            inner: Arc::new(DataManagerInner {
                items: RefCountCache::new(ItemStore {
                    pages: pages.clone(),
                }),
                pages,
                index,
            }),
        }
    }

    /// Stores `data` as a new valid record and returns its uid.
    pub fn insert(&self, data: &[u8]) -> Result<Uid> {
        let raw = DataItem::wrap(data);
        if raw.len() > u32::MAX as usize - HEADER_SIZE {
            return Err(StorageError::RecordTooLarge {
                len: data.len(),
                max: u32::MAX as usize - HEADER_SIZE - ENVELOPE_SIZE,
            });
        }

        loop {
            let page = match self.inner.index.select(raw.len()) {
                Some(info) => self.inner.pages.get(info.page_no)?,
                None => self.inner.pages.new_page(raw.len())?,
            };

            let written = page.write(&raw);
            self.inner.index.add(page.page_no(), page.free_size());
            match written {
                Ok(offset) => return Ok(uid_of(page.page_no(), offset as u32)),
                Err(StorageError::PageFull { page_no, .. }) => {
                    debug!("page {} filled up under us, retrying", page_no);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The record at `uid`, valid or not.
    pub fn get(&self, uid: Uid) -> Result<DataItemRef> {
        let item = self.inner.items.get(uid)?;
        Ok(DataItemRef {
            dm: self.clone(),
            item,
        })
    }

    /// The record at `uid`, or `None` if it has been invalidated.
    pub fn select(&self, uid: Uid) -> Result<Option<DataItemRef>> {
        let item = self.get(uid)?;
        if item.is_valid()? {
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }

    pub fn release(&self, uid: Uid) -> Result<()> {
        self.inner.items.release(uid)
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.inner.pages
    }

    pub fn page_index(&self) -> &PageIndex {
        &self.inner.index
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.pages.flush_all()
    }

    /// Drops every cached record, then flushes and closes the page cache.
    pub fn close(&self) -> Result<()> {
        self.inner.items.close()?;
        self.inner.pages.close()
    }
}
