// storage/src/version/wrap.rs

use crate::data::{DataItemRef, DataManager};
use crate::{Result, StorageError, Uid, Xid};
use bytes::{Buf, BufMut};

const XMIN_OFFSET: usize = 0;
const XMAX_OFFSET: usize = 8;
const DATA_OFFSET: usize = 16;

/// Creating and deleting xid of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionHeader {
    pub xmin: Xid,
    pub xmax: Xid,
}

/// A row version: `[xmin:8][xmax:8][row bytes]` inside a record.
pub struct VersionWrap {
    item: DataItemRef,
}

impl VersionWrap {
    /// Encodes a new version created by `xid`.
    pub fn wrap_raw(xid: Xid, data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(DATA_OFFSET + data.len());
        raw.put_u64(xid);
        raw.put_u64(0);
        raw.put_slice(data);
        raw
    }

    /// Loads the version at `uid`, valid or not.
    pub fn load(dm: &DataManager, uid: Uid) -> Result<Self> {
        Self::from_item(dm.get(uid)?)
    }

    /// Loads the version at `uid`, or `None` if its record is invalid.
    pub fn select(dm: &DataManager, uid: Uid) -> Result<Option<Self>> {
        match dm.select(uid)? {
            Some(item) => Ok(Some(Self::from_item(item)?)),
            None => Ok(None),
        }
    }

    fn from_item(item: DataItemRef) -> Result<Self> {
        if item.size() < DATA_OFFSET {
            return Err(StorageError::InvalidRecord {
                uid: item.uid(),
                reason: format!("{} bytes is too short for a version header", item.size()),
            });
        }
        Ok(Self { item })
    }

    pub fn uid(&self) -> Uid {
        self.item.uid()
    }

    pub fn is_valid(&self) -> Result<bool> {
        self.item.is_valid()
    }

    pub fn header(&self) -> Result<VersionHeader> {
        let raw = self.item.read_at(XMIN_OFFSET, DATA_OFFSET)?;
        let mut buf = &raw[..];
        Ok(VersionHeader {
            xmin: buf.get_u64(),
            xmax: buf.get_u64(),
        })
    }

    pub fn xmin(&self) -> Result<Xid> {
        Ok(self.header()?.xmin)
    }

    pub fn xmax(&self) -> Result<Xid> {
        Ok(self.header()?.xmax)
    }

    /// The row bytes.
    pub fn data(&self) -> Result<Vec<u8>> {
        self.item
            .read_at(DATA_OFFSET, self.item.size() - DATA_OFFSET)
    }

    pub fn set_xmax(&self, xid: Xid) -> Result<()> {
        self.item.update_at(XMAX_OFFSET, &xid.to_be_bytes())
    }

    /// Resets xmax to 0 if it still holds `xid`.
    pub fn clear_xmax_if(&self, xid: Xid) -> Result<bool> {
        self.item
            .compare_and_update_at(XMAX_OFFSET, &xid.to_be_bytes(), &0u64.to_be_bytes())
    }
}
