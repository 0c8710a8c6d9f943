//! Numbered backing files grouped into partitions.
//!
//! A [DocMap](crate::DocMap) spreads its pages over a sequence of files (`0`, `1`, ...) within a
//! single partition. [Storage] hands out [Blob] handles to those files: a handle keeps its file
//! pinned (open and not evictable) for as long as it is held and unpins it when dropped.
//!
//! # Partition Names
//!
//! Partition names must be non-empty and contain only ASCII alphanumeric characters, dashes
//! (`-`), or underscores (`_`).

use std::io::Error as IoError;
use thiserror::Error;

pub mod fs;
pub mod memory;
pub mod metered;

/// Errors that can occur when interacting with [Storage].
#[derive(Debug, Error)]
pub enum Error {
    #[error("partition name invalid, must only contain alphanumeric, dash ('-'), or underscore ('_') characters: {0}")]
    PartitionNameInvalid(String),
    #[error("partition creation failed: {0}")]
    PartitionCreationFailed(String),
    #[error("file missing: {0}/{1}")]
    FileMissing(String, u32),
    #[error("file already exists: {0}/{1}")]
    FileExists(String, u32),
    #[error("file open failed: {0}/{1} error: {2}")]
    FileOpenFailed(String, u32, IoError),
    #[error("file resize failed: {0}/{1} error: {2}")]
    FileResizeFailed(String, u32, IoError),
    #[error("file sync failed: {0}/{1} error: {2}")]
    FileSyncFailed(String, u32, IoError),
    #[error("file remove failed: {0}/{1} error: {2}")]
    FileRemoveFailed(String, u32, IoError),
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("offset overflow")]
    OffsetOverflow,
}

/// Interface to the numbered files of a partition.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The handle to an individual file.
    type Blob: Blob;

    /// Pin an existing file.
    ///
    /// Returns [Error::FileMissing] if the file does not exist.
    fn pin(&self, partition: &str, fileno: u32) -> Result<Self::Blob, Error>;

    /// Create an empty file and pin it.
    ///
    /// Returns [Error::FileExists] if the file already exists.
    fn create(&self, partition: &str, fileno: u32) -> Result<Self::Blob, Error>;

    /// Remove a file.
    ///
    /// Returns [Error::FileMissing] if the file does not exist.
    fn unlink(&self, partition: &str, fileno: u32) -> Result<(), Error>;
}

/// Interface to read and write a pinned file.
///
/// Dropping the handle unpins the file.
#[allow(clippy::len_without_is_empty)]
pub trait Blob: Send + Sync + 'static {
    /// Read into `buf` starting at `offset`, returning the number of bytes read.
    ///
    /// The count is only smaller than `buf` when the end of the file is reached.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error>;

    /// Current length of the file.
    fn len(&self) -> Result<u64, Error>;

    /// Truncate or zero-extend the file to `len`.
    fn resize(&self, len: u64) -> Result<(), Error>;

    /// Durably persist all writes.
    fn sync(&self) -> Result<(), Error>;
}

pub(crate) fn validate_partition_name(partition: &str) -> Result<(), Error> {
    if partition.is_empty()
        || partition
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || ['_', '-'].contains(&c)))
    {
        return Err(Error::PartitionNameInvalid(partition.into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Exercise the contract every [Storage] implementation must uphold.
    pub(crate) fn run_storage_tests<S: Storage>(storage: S) {
        // Invalid names are rejected
        assert!(matches!(
            storage.create("bad/name", 0),
            Err(Error::PartitionNameInvalid(_))
        ));

        // Missing files cannot be pinned
        assert!(matches!(
            storage.pin("partition", 0),
            Err(Error::FileMissing(_, 0))
        ));

        // Create and write
        let blob = storage.create("partition", 0).unwrap();
        assert_eq!(blob.len().unwrap(), 0);
        blob.write_at(b"hello world", 0).unwrap();
        blob.write_at(b"!", 11).unwrap();
        blob.sync().unwrap();
        assert_eq!(blob.len().unwrap(), 12);
        drop(blob);

        // Creating again fails
        assert!(matches!(
            storage.create("partition", 0),
            Err(Error::FileExists(_, 0))
        ));

        // Read back, including a short read at the end of the file
        let blob = storage.pin("partition", 0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(blob.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        let mut buf = [0u8; 8];
        assert_eq!(blob.read_at(&mut buf, 8).unwrap(), 4);
        assert_eq!(&buf[..4], b"rld!");
        assert_eq!(blob.read_at(&mut buf, 100).unwrap(), 0);

        // Writing past the end zero-fills the gap
        blob.write_at(b"x", 14).unwrap();
        let mut buf = [0xFFu8; 3];
        assert_eq!(blob.read_at(&mut buf, 12).unwrap(), 3);
        assert_eq!(&buf, b"\0\0x");

        // Resize
        blob.resize(5).unwrap();
        assert_eq!(blob.len().unwrap(), 5);
        blob.resize(7).unwrap();
        let mut buf = [0xFFu8; 7];
        assert_eq!(blob.read_at(&mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"hello\0\0");
        drop(blob);

        // Files are independent per partition and number
        let other = storage.create("partition", 1).unwrap();
        assert_eq!(other.len().unwrap(), 0);
        let elsewhere = storage.create("other", 0).unwrap();
        assert_eq!(elsewhere.len().unwrap(), 0);

        // Unlink
        storage.unlink("partition", 0).unwrap();
        assert!(matches!(
            storage.pin("partition", 0),
            Err(Error::FileMissing(_, 0))
        ));
        assert!(matches!(
            storage.unlink("partition", 0),
            Err(Error::FileMissing(_, 0))
        ));
        assert!(storage.pin("partition", 1).is_ok());
    }
}
