//! A paged, compressed store of per-document metadata.
//!
//! [DocMap] assigns every added document the next document number ("docno") and appends its
//! [Entry] to a sequence of fixed-size pages spread over numbered backing files. Entries are
//! encoded relative to their predecessor on the same page, so sequential appends are cheap and
//! random lookups decode forward from the start of a page. Frequently accessed fields can
//! additionally be kept in memory (see [Cache]).
//!
//! # Format
//!
//! Page `p` lives in file `p / pages_per_file` at offset `(p % pages_per_file) * page_size`,
//! where `pages_per_file = max_file_size / page_size`. Data pages come first, followed by the
//! cache pages written by the most recent [DocMap::save].
//!
//! A data page holds a tag, the number of entries on the page and the entries themselves:
//!
//! ```text
//! +------+---+---+---+---+-----------+-----------+-----+
//! | 0xDA |  Entries (u32 BE) |  Entry 0  |  Entry 1  | ... |
//! +------+---+---+---+---+-----------+-----------+-----+
//! ```
//!
//! Every entry is written as a sequence of vbytes relative to the previous entry (the first
//! entry of a page is relative to an all-zero entry):
//!
//! ```text
//! location:       0 if contiguous with the previous entry, else (fileno gap + 1, offset)
//! docno:          (docno gap << 1) | compressed
//! distinct_words
//! words:          words - distinct_words
//! bytes:          bytes + 1 - 2 * words
//! mime:           ordinal
//! trecno:         shared prefix length, suffix length, suffix bytes
//! weight:         float with 7 bits of precision
//! ```
//!
//! A cache page holds a tag, the total number of entries, the number of data pages and a
//! sequence of self-delimiting records terminated by `0x00`:
//!
//! ```text
//! +------+------------------+-------------------+----------+----------+-----+------+
//! | 0xCA | Entries (vbyte)  | Data pages (vbyte) | Record 0 | Record 1 | ... | 0x00 |
//! +------+------------------+-------------------+----------+----------+-----+------+
//! ```
//!
//! Arrays are split across pages as fragments of `(id, total length, start, count (u32 BE),
//! items)`. The last data page is tagged `0xDF` and the last cache page `0xCF`.
//!
//! # Buffering
//!
//! A fixed number of pages is held in memory and shared between a read window, used to serve
//! lookups, and an append window, holding the pages being filled. The append window takes one
//! page at a time from the read window as pages fill up. Once the read window is down to a
//! single page, the append window is flushed and all pages are handed back to the read window.
//!
//! # Recovery
//!
//! [DocMap::load] restores the page index, the field caches and the repository set from the
//! cache pages. If they are missing, corrupt or describe different caches than requested, it
//! rebuilds everything by decoding every data page instead.
//!
//! # Example
//!
//! ```rust
//! use docmap::{storage::memory::Storage, Cache, Config, DocMap, Document};
//! use prometheus_client::registry::Registry;
//! use std::num::{NonZeroU64, NonZeroUsize};
//!
//! let storage = Storage::default();
//! let cfg = Config {
//!     partition: "docmap".into(),
//!     page_size: NonZeroUsize::new(4096).unwrap(),
//!     buffer_pages: NonZeroUsize::new(4).unwrap(),
//!     max_file_size: NonZeroU64::new(1 << 30).unwrap(),
//!     cache: Cache::WORDS,
//! };
//!
//! // Add a document
//! let mut docmap = DocMap::new(storage.clone(), &mut Registry::default(), cfg.clone()).unwrap();
//! let docno = docmap
//!     .add(&Document {
//!         trecno: b"DOC-0001",
//!         bytes: 1200,
//!         words: 300,
//!         distinct_words: 120,
//!         weight: 1.5,
//!         ..Default::default()
//!     })
//!     .unwrap();
//! assert_eq!(docno, 0);
//! docmap.save().unwrap();
//!
//! // Reopen and look it up
//! let mut docmap = DocMap::load(storage, &mut Registry::default(), cfg).unwrap();
//! assert_eq!(docmap.get_words(0).unwrap(), 300);
//! assert_eq!(docmap.get_trecno(0).unwrap(), b"DOC-0001");
//! ```

mod buffer;
mod cache;
mod entry;
mod persist;
mod store;

use crate::{codec, mime::Mime, reposset, storage};
pub use entry::Entry;
use std::{
    collections::TryReserveError,
    num::{NonZeroU64, NonZeroUsize},
    ops::{BitOr, BitOrAssign},
};
pub use store::DocMap;
use thiserror::Error;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 64;

/// Smallest supported number of buffered pages (one for reading and one for appending).
pub const MIN_BUFFER_PAGES: usize = 2;

const DATA_TAG: u8 = 0xDA;
const FINAL_DATA_TAG: u8 = 0xDF;
const CACHE_TAG: u8 = 0xCA;
const FINAL_CACHE_TAG: u8 = 0xCF;

/// Size of the tag and entry count preceding the entries of a data page.
const DATA_HEADER_SIZE: usize = 5;

/// Number of entries per front-coded block of the trecno cache.
const TRECNO_BLOCK: u64 = 4;

/// Number of entries per block of the location cache.
const LOCATION_BLOCK: u64 = 8;

/// Bits of precision used for weights.
const WEIGHT_PRECISION: u32 = 7;

/// Bits of precision used for persisted aggregates.
const AGGREGATE_PRECISION: u32 = 23;

/// Errors that can occur when interacting with a [DocMap].
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] storage::Error),
    #[error("codec error: {0}")]
    Codec(#[from] codec::Error),
    #[error("repository set error: {0}")]
    ReposSet(#[from] reposset::Error),
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("docno out of range: {0} >= {1}")]
    DocnoOutOfRange(u64, u64),
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    #[error("entry too large: {0} bytes does not fit in a page of {1} bytes")]
    EntryTooLarge(usize, usize),
    #[error("docno not found: {0}")]
    NotFound(u64),
    #[error("invalid tag on page {0}: {1:#04x}")]
    InvalidTag(u64, u8),
    #[error("invalid size of file {0}: {1}")]
    InvalidFileSize(u32, u64),
    #[error("corrupt page {0}: {1}")]
    CorruptPage(u64, codec::Error),
    #[error("corrupt: {0}")]
    Corrupt(String),
}

/// Configuration for [DocMap] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// The partition holding the backing files.
    pub partition: String,

    /// The size of each page, in bytes.
    pub page_size: NonZeroUsize,

    /// The number of pages held in memory, shared between reading and appending.
    pub buffer_pages: NonZeroUsize,

    /// The maximum size of a backing file, in bytes.
    pub max_file_size: NonZeroU64,

    /// The fields to cache in memory.
    pub cache: Cache,
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.page_size.get() < MIN_PAGE_SIZE {
            return Err(Error::InvalidConfig("page size is too small"));
        }
        if self.buffer_pages.get() < MIN_BUFFER_PAGES {
            return Err(Error::InvalidConfig("at least two buffer pages are required"));
        }
        if self.max_file_size.get() < self.page_size.get() as u64 {
            return Err(Error::InvalidConfig("maximum file size is smaller than a page"));
        }
        Ok(())
    }

    /// Number of pages stored in each backing file.
    fn pages_per_file(&self) -> u64 {
        self.max_file_size.get() / self.page_size.get() as u64
    }
}

/// A set of fields kept in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cache(u8);

impl Cache {
    pub const NONE: Self = Self(0);
    /// External identifiers, front-coded in blocks.
    pub const TRECNO: Self = Self(1);
    /// Repository, offset, length, MIME type and compression.
    pub const LOCATION: Self = Self(1 << 1);
    pub const WORDS: Self = Self(1 << 2);
    pub const DISTINCT_WORDS: Self = Self(1 << 3);
    pub const WEIGHT: Self = Self(1 << 4);
    pub const ALL: Self = Self(0x1f);

    /// Whether every field of `other` is part of `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Cache {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Cache {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Metadata of a document to add.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Document<'a> {
    /// Repository holding the document.
    pub fileno: u32,
    /// Byte offset of the document within its repository. Zero opens a new repository.
    pub offset: u64,
    /// Length of the document, in bytes.
    pub bytes: u32,
    /// Whether the repository is compressed.
    pub compressed: bool,
    pub words: u32,
    pub distinct_words: u32,
    pub weight: f32,
    /// External identifier.
    pub trecno: &'a [u8],
    pub mime: Mime,
}

impl Default for Document<'_> {
    fn default() -> Self {
        Self {
            fileno: 0,
            offset: 0,
            bytes: 0,
            compressed: false,
            words: 0,
            distinct_words: 0,
            weight: 0.0,
            trecno: &[],
            mime: Mime::default(),
        }
    }
}

/// Where the raw bytes of a document live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub fileno: u32,
    pub offset: u64,
    pub bytes: u32,
    pub mime: Mime,
    pub compressed: bool,
}

/// Running totals over all entries.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aggregates {
    pub entries: u64,
    pub sum_bytes: f64,
    pub sum_words: f64,
    pub sum_distinct_words: f64,
    pub sum_weight: f64,
    pub sum_trecno: f64,
}

impl Aggregates {
    fn add(&mut self, entry: &Entry) {
        self.entries += 1;
        self.sum_bytes += entry.bytes as f64;
        self.sum_words += entry.words as f64;
        self.sum_distinct_words += entry.distinct_words as f64;
        self.sum_weight += entry.weight as f64;
        self.sum_trecno += entry.trecno.len() as f64;
    }

    fn average(&self, sum: f64) -> f64 {
        if self.entries == 0 {
            return 0.0;
        }
        sum / self.entries as f64
    }

    pub fn total_bytes(&self) -> f64 {
        self.sum_bytes
    }

    pub fn avg_bytes(&self) -> f64 {
        self.average(self.sum_bytes)
    }

    pub fn avg_words(&self) -> f64 {
        self.average(self.sum_words)
    }

    pub fn avg_distinct_words(&self) -> f64 {
        self.average(self.sum_distinct_words)
    }

    pub fn avg_weight(&self) -> f64 {
        self.average(self.sum_weight)
    }

    pub fn avg_trecno_len(&self) -> f64 {
        self.average(self.sum_trecno)
    }
}
