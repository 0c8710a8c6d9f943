//! Map document numbers to the repositories holding their raw bytes.
//!
//! Documents are parsed out of repositories (backing files, or numbered byte ranges of one)
//! in order, so every repository covers a contiguous range of document numbers. [ReposSet]
//! stores those ranges run-length encoded as [Record]s of two kinds:
//!
//! - [Kind::SingleFile]: a single repository holding `quantity` documents.
//! - [Kind::ManyFiles]: `quantity` consecutive repositories holding one document each.
//!
//! Records are contiguous and non-overlapping, so a document number is resolved with a
//! single binary search. Alongside the records, a sparse list of [Checkpoint]s marks byte
//! offsets within compressed repositories from which decompression can resume.

use crate::mime::Mime;
use std::{cmp::Ordering, collections::TryReserveError};
use thiserror::Error;

/// Errors that can occur when interacting with a [ReposSet].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("no repository is open")]
    Empty,
    #[error("docno {0} does not extend the open repository")]
    InvalidAppend(u64),
    #[error("record starting at docno {0} is out of order")]
    UnorderedRecord(u64),
    #[error("checkpoint for repository {0} at offset {1} is out of order")]
    UnorderedCheckpoint(u32, u64),
    #[error("docno {0} is not covered by any repository")]
    NotFound(u64),
}

/// Layout of the repositories covered by a [Record].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// One repository holding many documents.
    SingleFile,
    /// Many repositories holding one document each.
    ManyFiles,
}

impl Kind {
    /// Bit used to persist the kind.
    pub fn bit(self) -> u64 {
        match self {
            Kind::SingleFile => 0,
            Kind::ManyFiles => 1,
        }
    }

    pub fn from_bit(bit: u64) -> Self {
        if bit & 1 == 0 {
            Kind::SingleFile
        } else {
            Kind::ManyFiles
        }
    }
}

/// A run of documents and the repositories holding them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub kind: Kind,
    /// First repository of the run.
    pub reposno: u32,
    /// First document of the run.
    pub docno: u64,
    /// Number of documents in the run.
    pub quantity: u64,
}

impl Record {
    /// One past the last document of the run.
    pub fn end(&self) -> u64 {
        self.docno + self.quantity
    }

    /// Whether `docno` falls within the run.
    pub fn contains(&self, docno: u64) -> bool {
        docno >= self.docno && docno < self.end()
    }

    /// Repository holding `docno`, which must fall within the run.
    pub fn reposno_of(&self, docno: u64) -> u32 {
        match self.kind {
            Kind::SingleFile => self.reposno,
            Kind::ManyFiles => self.reposno + (docno - self.docno) as u32,
        }
    }

    /// One past the last repository of the run.
    fn repos_end(&self) -> u32 {
        match self.kind {
            Kind::SingleFile => self.reposno + 1,
            Kind::ManyFiles => self.reposno + self.quantity as u32,
        }
    }
}

/// Compression applied to a repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
}

impl Compression {
    /// MIME type of the compressed stream.
    pub fn mime(self) -> Mime {
        match self {
            Compression::Gzip => Mime::APPLICATION_X_GZIP,
            Compression::Bzip2 => Mime::APPLICATION_X_BZIP2,
        }
    }

    /// Returns the compression named by `mime`, if any.
    pub fn from_mime(mime: Mime) -> Option<Self> {
        match mime {
            Mime::APPLICATION_X_GZIP => Some(Compression::Gzip),
            Mime::APPLICATION_X_BZIP2 => Some(Compression::Bzip2),
            _ => None,
        }
    }
}

/// Point within a compressed repository from which decompression can resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub reposno: u32,
    /// Offset into the compressed stream.
    pub offset: u64,
    pub compression: Compression,
}

/// Ranges of document numbers covered by each repository.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReposSet {
    entries: u32,
    records: Vec<Record>,
    checkpoints: Vec<Checkpoint>,
}

impl ReposSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of repositories.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Open a new repository whose first document is `docno`, returning its number.
    ///
    /// A repository starting right where a run of single-document repositories ends joins that
    /// run.
    pub fn append(&mut self, docno: u64) -> Result<u32, Error> {
        let reposno = self.entries;
        match self.records.last_mut() {
            Some(last) if docno < last.end() => return Err(Error::UnorderedRecord(docno)),
            Some(last) if last.kind == Kind::ManyFiles && last.end() == docno => {
                last.quantity += 1;
            }
            _ => {
                self.records.try_reserve(1)?;
                self.records.push(Record {
                    kind: Kind::ManyFiles,
                    reposno,
                    docno,
                    quantity: 1,
                });
            }
        }
        self.entries += 1;
        Ok(reposno)
    }

    /// Extend the open repository with `count` documents starting at `docno`.
    pub fn append_docno(&mut self, mut docno: u64, mut count: u64) -> Result<(), Error> {
        let entries = self.entries;
        let last = self.records.last_mut().ok_or(Error::Empty)?;

        // The first document of a repository is recorded when it is opened.
        if last.end() == docno + 1 {
            if count <= 1 {
                return Ok(());
            }
            docno += 1;
            count -= 1;
        }
        if last.end() != docno {
            return Err(Error::InvalidAppend(docno));
        }

        match last.kind {
            Kind::SingleFile => last.quantity += count,
            Kind::ManyFiles if last.quantity == 1 => {
                last.kind = Kind::SingleFile;
                last.quantity += count;
            }
            Kind::ManyFiles => {
                // Split the open repository off the end of the run.
                last.quantity -= 1;
                self.records.try_reserve(1)?;
                self.records.push(Record {
                    kind: Kind::SingleFile,
                    reposno: entries - 1,
                    docno: docno - 1,
                    quantity: count + 1,
                });
            }
        }
        Ok(())
    }

    /// Record a resumable decompression point.
    ///
    /// Checkpoints must be added in non-decreasing `(reposno, offset)` order.
    pub fn add_checkpoint(
        &mut self,
        reposno: u32,
        compression: Compression,
        offset: u64,
    ) -> Result<(), Error> {
        if let Some(last) = self.checkpoints.last() {
            if (reposno, offset) < (last.reposno, last.offset) {
                return Err(Error::UnorderedCheckpoint(reposno, offset));
            }
        }
        self.checkpoints.try_reserve(1)?;
        self.checkpoints.push(Checkpoint {
            reposno,
            offset,
            compression,
        });
        Ok(())
    }

    /// Record covering `docno`.
    pub fn record(&self, docno: u64) -> Option<&Record> {
        self.records
            .binary_search_by(|record| {
                if record.end() <= docno {
                    Ordering::Less
                } else if record.docno > docno {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .ok()
            .map(|slot| &self.records[slot])
    }

    /// Last record, which describes the open repository.
    pub fn record_last(&self) -> Option<&Record> {
        self.records.last()
    }

    /// Repository holding `docno`.
    pub fn reposno(&self, docno: u64) -> Result<u32, Error> {
        self.record(docno)
            .map(|record| record.reposno_of(docno))
            .ok_or(Error::NotFound(docno))
    }

    /// First checkpoint of repository `reposno`, if it is compressed.
    pub fn check(&self, reposno: u32) -> Option<&Checkpoint> {
        let slot = self
            .checkpoints
            .partition_point(|checkpoint| checkpoint.reposno < reposno);
        self.checkpoints
            .get(slot)
            .filter(|checkpoint| checkpoint.reposno == reposno)
    }

    /// Insert a deserialized record.
    ///
    /// Records must arrive in order; the repository count grows to cover the record.
    pub fn set_record(&mut self, record: Record) -> Result<(), Error> {
        if let Some(last) = self.records.last() {
            if record.docno < last.end() || record.reposno < last.repos_end() {
                return Err(Error::UnorderedRecord(record.docno));
            }
        }
        self.records.try_reserve(1)?;
        self.records.push(record);
        self.entries = self.entries.max(record.repos_end());
        Ok(())
    }

    /// Remove all records and checkpoints.
    pub fn clear(&mut self) {
        self.entries = 0;
        self.records.clear();
        self.checkpoints.clear();
    }
}
