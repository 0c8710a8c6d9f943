use super::{validate_partition_name, Error};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

type Content = Arc<RwLock<Vec<u8>>>;

/// In-memory implementation of [Storage](super::Storage).
///
/// Clones share the same files, so a store saved through one clone can be loaded through another.
#[derive(Clone, Default)]
pub struct Storage {
    files: Arc<Mutex<BTreeMap<(String, u32), Content>>>,
}

impl super::Storage for Storage {
    type Blob = Blob;

    fn pin(&self, partition: &str, fileno: u32) -> Result<Blob, Error> {
        validate_partition_name(partition)?;

        let files = self.files.lock().unwrap();
        let content = files
            .get(&(partition.to_string(), fileno))
            .ok_or_else(|| Error::FileMissing(partition.into(), fileno))?;
        Ok(Blob {
            content: content.clone(),
        })
    }

    fn create(&self, partition: &str, fileno: u32) -> Result<Blob, Error> {
        validate_partition_name(partition)?;

        let mut files = self.files.lock().unwrap();
        let key = (partition.to_string(), fileno);
        if files.contains_key(&key) {
            return Err(Error::FileExists(partition.into(), fileno));
        }
        let content = Content::default();
        files.insert(key, content.clone());
        Ok(Blob { content })
    }

    fn unlink(&self, partition: &str, fileno: u32) -> Result<(), Error> {
        validate_partition_name(partition)?;

        let mut files = self.files.lock().unwrap();
        files
            .remove(&(partition.to_string(), fileno))
            .ok_or_else(|| Error::FileMissing(partition.into(), fileno))?;
        Ok(())
    }
}

/// Handle to an in-memory file.
pub struct Blob {
    content: Content,
}

impl super::Blob for Blob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let content = self.content.read().unwrap();
        if offset >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - offset);
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let end = offset.checked_add(buf.len()).ok_or(Error::OffsetOverflow)?;
        let mut content = self.content.write().unwrap();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> Result<u64, Error> {
        Ok(self.content.read().unwrap().len() as u64)
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        let len: usize = len.try_into().map_err(|_| Error::OffsetOverflow)?;
        self.content.write().unwrap().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}
