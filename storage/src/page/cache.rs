// storage/src/page/cache.rs

use super::{Page, PageInfo, PAGE_SIZE};
use crate::cache::{CacheBackend, RefCountCache};
use crate::file::PageFile;
use crate::{PageNo, Result, StorageError};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

/// Cache backend that reads pages from and writes them back to a [`PageFile`].
pub struct PageStore {
    file: Mutex<PageFile>,
}

impl PageStore {
    fn new(file: PageFile) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    /// Writes a dirty page at its file position and fsyncs. The page stays
    /// dirty if either step fails.
    pub fn write_back(&self, page: &Page) -> Result<()> {
        let written = page.write_back(|data| {
            let mut file = self.file.lock();
            file.write_page(page.page_no(), data)?;
            file.sync()
        })?;
        if written {
            debug!("flushed page {}", page.page_no());
        }
        Ok(())
    }
}

impl CacheBackend for PageStore {
    type Item = Page;

    fn load(&self, key: u64) -> Result<Page> {
        let page_no = key as PageNo;
        let data = self.file.lock().read_page(page_no)?;
        Page::load(page_no, data)
    }

    fn evict(&self, _key: u64, page: &Page) -> Result<()> {
        self.write_back(page)
    }
}

struct PageCacheInner {
    cache: RefCountCache<PageStore>,
    max_page_no: Mutex<PageNo>,
}

/// Buffer pool over one page file. Cloning shares the pool.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<PageCacheInner>,
}

impl PageCache {
    pub fn create(path: &Path) -> Result<Self> {
        let file = PageFile::create_new(path)?;
        Ok(Self::with_file(file, 0))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = PageFile::open(path)?;
        let max_page_no = file.page_slots()?;
        info!(
            "page cache over {} with {} page slots",
            path.display(),
            max_page_no
        );
        Ok(Self::with_file(file, max_page_no))
    }

    fn with_file(file: PageFile, max_page_no: PageNo) -> Self {
        Self {
            inner: Arc::new(PageCacheInner {
                cache: RefCountCache::new(PageStore::new(file)),
                max_page_no: Mutex::new(max_page_no),
            }),
        }
    }

    /// Fetches a page, taking a reference that the returned handle gives back
    /// when dropped.
    pub fn get(&self, page_no: PageNo) -> Result<PageHandle> {
        if page_no == 0 || page_no > self.max_page_no() {
            return Err(StorageError::PageNotFound(page_no));
        }
        let page = self.inner.cache.get(u64::from(page_no))?;
        Ok(PageHandle {
            cache: self.clone(),
            page,
        })
    }

    /// Drops one reference to a page; at zero it is written back and evicted.
    pub fn release(&self, page_no: PageNo) -> Result<()> {
        self.inner.cache.release(u64::from(page_no))
    }

    /// Allocates a page able to hold `need` payload bytes.
    ///
    /// The page takes the first unused page number and reserves as many
    /// consecutive slots as its size spans. It is cached first, so a concurrent
    /// `get` never reads the not yet written slot, then written through.
    pub fn new_page(&self, need: usize) -> Result<PageHandle> {
        let slots = Page::slots_for(need);
        let page_no = {
            let mut max = self.inner.max_page_no.lock();
            let page_no = *max + 1;
            *max += slots as PageNo;
            page_no
        };

        let page = Page::new(page_no, slots * PAGE_SIZE);
        let page = self.inner.cache.insert_loaded(u64::from(page_no), page)?;
        let handle = PageHandle {
            cache: self.clone(),
            page,
        };
        self.inner.cache.backend().write_back(&handle)?;
        debug!("allocated page {} spanning {} slot(s)", page_no, slots);
        Ok(handle)
    }

    /// Highest page slot in use.
    pub fn max_page_no(&self) -> PageNo {
        *self.inner.max_page_no.lock()
    }

    /// Reads every page header from the file and reports each page's free
    /// space. Multi-slot pages are reported once, by their first page number.
    pub fn scan_free_space(&self) -> Result<Vec<PageInfo>> {
        let max = self.max_page_no();
        let mut pages = Vec::new();
        let mut page_no: PageNo = 1;

        let mut file = self.inner.cache.backend().file.lock();
        while page_no <= max {
            let (size, offset) = file.read_header(page_no)?;
            pages.push(PageInfo {
                page_no,
                free_size: size - offset,
            });
            page_no += (size / PAGE_SIZE) as PageNo;
        }
        Ok(pages)
    }

    /// Writes back every dirty cached page without evicting it.
    pub fn flush_all(&self) -> Result<()> {
        for (_, page) in self.inner.cache.entries() {
            self.inner.cache.backend().write_back(&page)?;
        }
        Ok(())
    }

    /// Flushes and evicts every page. Outstanding handles become inert.
    pub fn close(&self) -> Result<()> {
        self.inner.cache.close()
    }

    /// Number of physical page reads performed.
    pub fn page_loads(&self) -> u64 {
        self.inner.cache.loads()
    }

    /// Number of pages written back and dropped from the cache.
    pub fn page_evictions(&self) -> u64 {
        self.inner.cache.evictions()
    }

    pub fn reference_count(&self, page_no: PageNo) -> usize {
        self.inner.cache.reference_count(u64::from(page_no))
    }

    pub fn is_cached(&self, page_no: PageNo) -> bool {
        self.inner.cache.contains(u64::from(page_no))
    }
}

/// A referenced page. Dropping the handle releases the reference.
pub struct PageHandle {
    cache: PageCache,
    page: Arc<Page>,
}

impl PageHandle {
    /// Takes another reference to the same page.
    pub fn try_clone(&self) -> Result<PageHandle> {
        self.cache.get(self.page.page_no())
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Err(e) = self.cache.release(self.page.page_no()) {
            error!("failed to release page {}: {}", self.page.page_no(), e);
        }
    }
}
