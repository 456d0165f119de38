// storage/src/file/mod.rs

use crate::page::{HEADER_SIZE, PAGE_SIZE};
use crate::{PageNo, Result, StorageError};
use bytes::Buf;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Byte position of a page in its file. Page numbers start at 1.
pub fn page_offset(page_no: PageNo) -> u64 {
    u64::from(page_no - 1) * PAGE_SIZE as u64
}

/// Random-access file holding a sequence of pages.
///
/// Every page starts with `[declaredSize:4][writeOffset:4]`. The declared size
/// is a multiple of [`PAGE_SIZE`]; a page larger than one slot occupies that
/// many consecutive slots.
pub struct PageFile {
    file: File,
    path: PathBuf,
}

impl PageFile {
    pub fn create_new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        info!("created page file {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let page_file = Self {
            file,
            path: path.to_path_buf(),
        };
        let len = page_file.len()?;
        if len % PAGE_SIZE as u64 != 0 {
            return Err(StorageError::CorruptPage {
                page_no: (len / PAGE_SIZE as u64) as PageNo + 1,
                reason: format!("file length {} is not a multiple of the page size", len),
            });
        }

        info!(
            "opened page file {} ({} page slots)",
            path.display(),
            len / PAGE_SIZE as u64
        );
        Ok(page_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Number of page slots the file spans.
    pub fn page_slots(&self) -> Result<PageNo> {
        Ok((self.len()? / PAGE_SIZE as u64) as PageNo)
    }

    /// Reads the `(declaredSize, writeOffset)` header of a page.
    pub fn read_header(&mut self, page_no: PageNo) -> Result<(usize, usize)> {
        self.check_page_no(page_no)?;

        let start = page_offset(page_no);
        if start + HEADER_SIZE as u64 > self.len()? {
            return Err(StorageError::PageNotFound(page_no));
        }

        let mut header = [0u8; HEADER_SIZE];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut header)?;

        let mut cursor = &header[..];
        let size = cursor.get_u32() as usize;
        let offset = cursor.get_u32() as usize;

        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(StorageError::CorruptPage {
                page_no,
                reason: format!("declared size {} is not a positive multiple of {}", size, PAGE_SIZE),
            });
        }
        if offset < HEADER_SIZE || offset > size {
            return Err(StorageError::CorruptPage {
                page_no,
                reason: format!("write offset {} outside {}..={}", offset, HEADER_SIZE, size),
            });
        }
        Ok((size, offset))
    }

    /// Reads a full page: first its declared size, then that many bytes.
    pub fn read_page(&mut self, page_no: PageNo) -> Result<Vec<u8>> {
        let (size, _) = self.read_header(page_no)?;

        let start = page_offset(page_no);
        if start + size as u64 > self.len()? {
            return Err(StorageError::CorruptPage {
                page_no,
                reason: format!("declared size {} runs past end of file", size),
            });
        }

        let mut buffer = vec![0u8; size];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut buffer)?;

        debug!("read page {} ({} bytes)", page_no, size);
        Ok(buffer)
    }

    pub fn write_page(&mut self, page_no: PageNo, data: &[u8]) -> Result<()> {
        self.check_page_no(page_no)?;

        self.file.seek(SeekFrom::Start(page_offset(page_no)))?;
        self.file.write_all(data)?;

        debug!("wrote page {} ({} bytes)", page_no, data.len());
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(StorageError::Io)
    }

    fn check_page_no(&self, page_no: PageNo) -> Result<()> {
        // Page numbers are 1-based; 0 is never a valid page.
        if page_no == 0 {
            return Err(StorageError::PageNotFound(page_no));
        }
        Ok(())
    }
}
