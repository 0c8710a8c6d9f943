//! In-memory copies of selected entry fields.

use super::{
    entry::{common_prefix, Entry},
    Cache, Error, Location, LOCATION_BLOCK, TRECNO_BLOCK,
};
use crate::{
    codec::{self, MAX_VBYTE_SIZE},
    mime::Mime,
    reposset::{self, Kind, ReposSet},
};
use std::{collections::TryReserveError, mem::take};

pub(super) fn push<T>(vec: &mut Vec<T>, value: T) -> Result<(), TryReserveError> {
    vec.try_reserve(1)?;
    vec.push(value);
    Ok(())
}

/// Field caches indexed by docno.
///
/// External identifiers are stored in blocks of [TRECNO_BLOCK] entries: the first entry of a
/// block is stored whole and the others are front-coded against their predecessor. Locations
/// are stored in blocks of [LOCATION_BLOCK] entries holding the length of each document and,
/// for blocks starting in the middle of a repository, the offset of the first document.
#[derive(Default)]
pub(super) struct Caches {
    pub set: Cache,

    pub words: Vec<u32>,
    pub distinct_words: Vec<u32>,
    pub weights: Vec<f32>,

    pub trecno_offsets: Vec<u64>,
    pub trecnos: Vec<u8>,

    pub location_offsets: Vec<u64>,
    pub locations: Vec<u8>,
    pub mime_exceptions: Vec<(u64, Mime)>,

    scratch: Vec<u8>,
}

impl Caches {
    pub fn new(set: Cache) -> Self {
        Self {
            set,
            ..Default::default()
        }
    }

    /// Drop every cached value, keeping the set of cached fields.
    pub fn clear(&mut self) {
        self.words.clear();
        self.distinct_words.clear();
        self.weights.clear();
        self.trecno_offsets.clear();
        self.trecnos.clear();
        self.location_offsets.clear();
        self.locations.clear();
        self.mime_exceptions.clear();
    }

    /// Release the fields outside of `set`.
    pub fn retain(&mut self, set: Cache) {
        fn release<T>(vec: &mut Vec<T>) {
            *vec = Vec::new();
        }
        if !set.contains(Cache::WORDS) {
            release(&mut self.words);
        }
        if !set.contains(Cache::DISTINCT_WORDS) {
            release(&mut self.distinct_words);
        }
        if !set.contains(Cache::WEIGHT) {
            release(&mut self.weights);
        }
        if !set.contains(Cache::TRECNO) {
            release(&mut self.trecno_offsets);
            release(&mut self.trecnos);
        }
        if !set.contains(Cache::LOCATION) {
            release(&mut self.location_offsets);
            release(&mut self.locations);
            release(&mut self.mime_exceptions);
        }
        self.set = set;
    }

    /// Cache the fields of `entry`, which must be the next docno. The repository of the entry
    /// must already be recorded in `reposset`.
    pub fn push(&mut self, reposset: &ReposSet, entry: &Entry) -> Result<(), Error> {
        if self.set.contains(Cache::WORDS) {
            push(&mut self.words, entry.words)?;
        }
        if self.set.contains(Cache::DISTINCT_WORDS) {
            push(&mut self.distinct_words, entry.distinct_words)?;
        }
        if self.set.contains(Cache::WEIGHT) {
            push(&mut self.weights, entry.weight)?;
        }
        if self.set.contains(Cache::TRECNO) {
            self.push_trecno(entry.docno, &entry.trecno)?;
        }
        if self.set.contains(Cache::LOCATION) {
            self.push_location(reposset, entry)?;
        }
        Ok(())
    }

    fn push_trecno(&mut self, docno: u64, trecno: &[u8]) -> Result<(), Error> {
        self.trecnos.try_reserve(2 * MAX_VBYTE_SIZE + trecno.len())?;
        if docno % TRECNO_BLOCK == 0 {
            push(&mut self.trecno_offsets, self.trecnos.len() as u64)?;
            codec::write_vbyte(trecno.len() as u64, &mut self.trecnos);
            self.trecnos.extend_from_slice(trecno);
            return Ok(());
        }

        let mut prev = take(&mut self.scratch);
        let result = self.decode_trecno(docno - 1, &mut prev);
        let prefix = common_prefix(&prev, trecno);
        self.scratch = prev;
        result?;
        codec::write_vbyte(prefix as u64, &mut self.trecnos);
        codec::write_vbyte((trecno.len() - prefix) as u64, &mut self.trecnos);
        self.trecnos.extend_from_slice(&trecno[prefix..]);
        Ok(())
    }

    fn push_location(&mut self, reposset: &ReposSet, entry: &Entry) -> Result<(), Error> {
        self.locations.try_reserve(2 * MAX_VBYTE_SIZE)?;
        if entry.docno % LOCATION_BLOCK == 0 {
            push(&mut self.location_offsets, self.locations.len() as u64)?;
            let record = reposset
                .record(entry.docno)
                .ok_or(reposset::Error::NotFound(entry.docno))?;
            if record.kind == Kind::SingleFile && record.docno != entry.docno {
                codec::write_vbyte(entry.offset, &mut self.locations);
            }
        }
        codec::write_vbyte(entry.bytes as u64, &mut self.locations);
        if entry.mime != Mime::default() {
            push(&mut self.mime_exceptions, (entry.docno, entry.mime))?;
        }
        Ok(())
    }

    pub fn words(&self, docno: u64) -> Option<u32> {
        self.words.get(docno as usize).copied()
    }

    pub fn distinct_words(&self, docno: u64) -> Option<u32> {
        self.distinct_words.get(docno as usize).copied()
    }

    pub fn weight(&self, docno: u64) -> Option<f32> {
        self.weights.get(docno as usize).copied()
    }

    /// Cached external identifier of `docno`, if identifiers are cached.
    pub fn trecno(&self, docno: u64) -> Result<Option<Vec<u8>>, Error> {
        if !self.set.contains(Cache::TRECNO) {
            return Ok(None);
        }
        let mut trecno = Vec::new();
        self.decode_trecno(docno, &mut trecno)?;
        Ok(Some(trecno))
    }

    fn decode_trecno(&self, docno: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        let start = self
            .trecno_offsets
            .get((docno / TRECNO_BLOCK) as usize)
            .ok_or(Error::NotFound(docno))?;
        let mut buf = self
            .trecnos
            .get(*start as usize..)
            .ok_or(codec::Error::EndOfBuffer)?;

        let len = codec::read_vbyte(&mut buf)? as usize;
        out.clear();
        out.extend_from_slice(codec::read_slice(&mut buf, len)?);
        for _ in 0..docno % TRECNO_BLOCK {
            let prefix = codec::read_vbyte(&mut buf)? as usize;
            let suffix = codec::read_vbyte(&mut buf)? as usize;
            if prefix > out.len() {
                return Err(codec::Error::InvalidData("trecno prefix too long").into());
            }
            out.truncate(prefix);
            out.extend_from_slice(codec::read_slice(&mut buf, suffix)?);
        }
        Ok(())
    }

    /// Cached location of `docno`, if locations are cached.
    pub fn location(&self, reposset: &ReposSet, docno: u64) -> Result<Option<Location>, Error> {
        if !self.set.contains(Cache::LOCATION) {
            return Ok(None);
        }
        let base = docno - docno % LOCATION_BLOCK;
        let start = self
            .location_offsets
            .get((docno / LOCATION_BLOCK) as usize)
            .ok_or(Error::NotFound(docno))?;
        let mut buf = self
            .locations
            .get(*start as usize..)
            .ok_or(codec::Error::EndOfBuffer)?;

        // The first document of a block records its offset unless a repository starts there
        let record = *reposset
            .record(docno)
            .ok_or(reposset::Error::NotFound(docno))?;
        let anchor = reposset
            .record(base)
            .ok_or(reposset::Error::NotFound(base))?;
        let anchor = if anchor.kind == Kind::SingleFile && anchor.docno != base {
            codec::read_vbyte(&mut buf)?
        } else {
            0
        };

        // Sum the lengths of the documents preceding `docno` within its repository
        let single = record.kind == Kind::SingleFile;
        let mut offset = if single && record.docno < base {
            anchor
        } else {
            0
        };
        let mut bytes = 0;
        for current in base..=docno {
            bytes = codec::read_vbyte_u32(&mut buf)?;
            if single && current < docno && current >= record.docno {
                offset += bytes as u64;
            }
        }

        let reposno = record.reposno_of(docno);
        let mime = match self
            .mime_exceptions
            .binary_search_by_key(&docno, |(docno, _)| *docno)
        {
            Ok(slot) => self.mime_exceptions[slot].1,
            Err(_) => Mime::default(),
        };
        Ok(Some(Location {
            fileno: reposno,
            offset,
            bytes,
            mime,
            compressed: reposset.check(reposno).is_some(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reposset::Compression;
    use commonware_macros::test_traced;

    struct Builder {
        reposset: ReposSet,
        caches: Caches,
        entries: Vec<Entry>,
    }

    impl Builder {
        fn new(set: Cache) -> Self {
            Self {
                reposset: ReposSet::new(),
                caches: Caches::new(set),
                entries: Vec::new(),
            }
        }

        /// Add a document, opening a new repository if `open` is set.
        fn add(&mut self, open: bool, bytes: u32, trecno: &[u8], mime: Mime, compressed: bool) {
            let docno = self.entries.len() as u64;
            let (fileno, offset) = match self.entries.last() {
                Some(prev) if !open => (prev.fileno, prev.offset + prev.bytes as u64),
                _ => (self.reposset.entries(), 0),
            };
            if open {
                let reposno = self.reposset.append(docno).unwrap();
                if compressed {
                    self.reposset
                        .add_checkpoint(reposno, Compression::Gzip, 0)
                        .unwrap();
                }
            } else {
                self.reposset.append_docno(docno, 1).unwrap();
            }
            let entry = Entry {
                docno,
                fileno,
                offset,
                bytes,
                compressed,
                words: bytes / 4,
                distinct_words: bytes / 8,
                mime,
                trecno: trecno.to_vec(),
                weight: docno as f32,
            };
            self.caches.push(&self.reposset, &entry).unwrap();
            self.entries.push(entry);
        }
    }

    #[test_traced]
    fn test_trecno_blocks() {
        let mut builder = Builder::new(Cache::TRECNO);
        for trecno in ["AAAA", "AAAB", "AAAC", "AAAD", "BBBB", "BBBBC", "B", "", "XYZ"] {
            builder.add(true, 10, trecno.as_bytes(), Mime::default(), false);
        }
        assert_eq!(builder.caches.trecno_offsets.len(), 3);
        for entry in &builder.entries {
            assert_eq!(
                builder.caches.trecno(entry.docno).unwrap().unwrap(),
                entry.trecno
            );
        }
        assert!(matches!(
            builder.caches.trecno(100),
            Err(Error::NotFound(100))
        ));
    }

    #[test_traced]
    fn test_flat_fields() {
        let mut builder = Builder::new(Cache::WORDS | Cache::WEIGHT);
        for _ in 0..5 {
            builder.add(true, 40, b"x", Mime::default(), false);
        }
        assert_eq!(builder.caches.words(3), Some(10));
        assert_eq!(builder.caches.weight(4), Some(4.0));
        assert_eq!(builder.caches.distinct_words(3), None);
        assert!(builder.caches.trecno(0).unwrap().is_none());
    }

    #[test_traced]
    fn test_locations() {
        let mut builder = Builder::new(Cache::LOCATION);

        // One repository spanning several blocks
        builder.add(true, 7, b"a", Mime::default(), false);
        for i in 1..20 {
            builder.add(false, 7 + i, b"a", Mime::default(), false);
        }

        // Single-document repositories, some compressed or of another type
        for i in 0..10 {
            builder.add(true, 3, b"b", Mime::TEXT_HTML, i % 2 == 0);
        }

        // A repository starting within a block
        builder.add(true, 11, b"c", Mime::default(), true);
        for _ in 0..12 {
            builder.add(false, 5, b"c", Mime::default(), true);
        }

        for entry in &builder.entries {
            let location = builder
                .caches
                .location(&builder.reposset, entry.docno)
                .unwrap()
                .unwrap();
            assert_eq!(
                location,
                Location {
                    fileno: entry.fileno,
                    offset: entry.offset,
                    bytes: entry.bytes,
                    mime: entry.mime,
                    compressed: entry.compressed,
                },
                "docno {}",
                entry.docno
            );
        }
        assert_eq!(builder.caches.mime_exceptions.len(), 10);
    }

    #[test_traced]
    fn test_retain() {
        let mut builder = Builder::new(Cache::ALL);
        for _ in 0..10 {
            builder.add(true, 40, b"doc", Mime::default(), false);
        }
        builder.caches.retain(Cache::WORDS | Cache::TRECNO);
        assert_eq!(builder.caches.set, Cache::WORDS | Cache::TRECNO);
        assert_eq!(builder.caches.words(9), Some(10));
        assert_eq!(builder.caches.weight(9), None);
        assert!(builder.caches.locations.is_empty());
        assert!(builder
            .caches
            .location(&builder.reposset, 0)
            .unwrap()
            .is_none());
        assert_eq!(builder.caches.trecno(9).unwrap().unwrap(), b"doc");

        builder.caches.clear();
        assert_eq!(builder.caches.words(0), None);
        assert_eq!(builder.caches.set, Cache::WORDS | Cache::TRECNO);
    }
}
