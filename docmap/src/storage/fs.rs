use super::{validate_partition_name, Error};
use std::{
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Configuration for the filesystem [Storage].
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory under which every partition gets its own subdirectory.
    pub directory: PathBuf,
}

impl Config {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }
}

/// Implementation of [Storage](super::Storage) backed by one file per `(partition, fileno)`.
///
/// File `n` of partition `p` lives at `<directory>/p/n`.
#[derive(Clone)]
pub struct Storage {
    lock: Arc<Mutex<()>>,
    cfg: Config,
}

impl Storage {
    pub fn new(cfg: Config) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            cfg,
        }
    }

    fn path(&self, partition: &str, fileno: u32) -> PathBuf {
        self.cfg
            .directory
            .join(partition)
            .join(format!("{fileno:08}"))
    }
}

impl super::Storage for Storage {
    type Blob = Blob;

    fn pin(&self, partition: &str, fileno: u32) -> Result<Blob, Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path(partition, fileno))
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::FileMissing(partition.into(), fileno),
                _ => Error::FileOpenFailed(partition.into(), fileno, e),
            })?;
        Ok(Blob::new(partition.into(), fileno, file))
    }

    fn create(&self, partition: &str, fileno: u32) -> Result<Blob, Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        // Create the partition directory, if it does not exist
        let path = self.path(partition, fileno);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|_| Error::PartitionCreationFailed(partition.into()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::FileExists(partition.into(), fileno),
                _ => Error::FileOpenFailed(partition.into(), fileno, e),
            })?;
        Ok(Blob::new(partition.into(), fileno, file))
    }

    fn unlink(&self, partition: &str, fileno: u32) -> Result<(), Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        fs::remove_file(self.path(partition, fileno)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::FileMissing(partition.into(), fileno),
            _ => Error::FileRemoveFailed(partition.into(), fileno, e),
        })
    }
}

/// Handle to an open file.
pub struct Blob {
    partition: String,
    fileno: u32,
    file: File,
}

impl Blob {
    fn new(partition: String, fileno: u32, file: File) -> Self {
        Self {
            partition,
            fileno,
            file,
        }
    }
}

impl super::Blob for Blob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let mut read = 0;
        while read < buf.len() {
            let position = offset
                .checked_add(read as u64)
                .ok_or(Error::OffsetOverflow)?;
            #[cfg(unix)]
            let n = {
                use std::os::unix::fs::FileExt;
                self.file.read_at(&mut buf[read..], position)
            };
            #[cfg(windows)]
            let n = {
                use std::os::windows::fs::FileExt;
                self.file.seek_read(&mut buf[read..], position)
            };
            match n {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Err(Error::ReadFailed),
            }
        }
        Ok(read)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .write_all_at(buf, offset)
                .map_err(|_| Error::WriteFailed)?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0;
            while written < buf.len() {
                let n = self
                    .file
                    .seek_write(&buf[written..], offset + written as u64)
                    .map_err(|_| Error::WriteFailed)?;
                written += n;
            }
        }
        Ok(())
    }

    fn len(&self) -> Result<u64, Error> {
        Ok(self.file.metadata().map_err(|_| Error::ReadFailed)?.len())
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        self.file
            .set_len(len)
            .map_err(|e| Error::FileResizeFailed(self.partition.clone(), self.fileno, e))
    }

    fn sync(&self) -> Result<(), Error> {
        self.file
            .sync_all()
            .map_err(|e| Error::FileSyncFailed(self.partition.clone(), self.fileno, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{tests::run_storage_tests, Storage as _};
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::env;

    #[test_traced]
    fn test_fs_storage() {
        let mut rng = StdRng::from_entropy();
        let directory = env::temp_dir().join(format!("docmap_storage_{}", rng.gen::<u64>()));
        run_storage_tests(Storage::new(Config::new(directory.clone())));
        fs::remove_dir_all(directory).unwrap();
    }

    #[test_traced]
    fn test_fs_unlink_errors() {
        let mut rng = StdRng::from_entropy();
        let directory = env::temp_dir().join(format!("docmap_unlink_{}", rng.gen::<u64>()));
        let storage = Storage::new(Config::new(directory.clone()));

        // A file that was never created is missing
        storage.create("partition", 0).unwrap();
        assert!(matches!(
            storage.unlink("partition", 1),
            Err(Error::FileMissing(_, 1))
        ));

        // A directory in place of the file cannot be removed
        fs::create_dir_all(directory.join("partition").join(format!("{:08}", 2))).unwrap();
        assert!(matches!(
            storage.unlink("partition", 2),
            Err(Error::FileRemoveFailed(_, 2, _))
        ));
        storage.unlink("partition", 0).unwrap();
        fs::remove_dir_all(directory).unwrap();
    }
}
