use super::{
    buffer::{Cursor, Files, Pages, Position, WindowId},
    cache::Caches,
    entry::Entry,
    Aggregates, Cache, Config, Document, Error, Location, DATA_HEADER_SIZE, DATA_TAG,
    WEIGHT_PRECISION,
};
use crate::{
    codec,
    reposset::{Compression, ReposSet},
    storage::{self, Storage},
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use tracing::debug;

pub(super) struct Metrics {
    pub adds: Counter,
    pub lookups: Counter,
    pub cache_hits: Counter,
    pub page_reads: Counter,
    pub page_writes: Counter,
    pub rescans: Counter,
    pub saves: Counter,
    pub entries: Gauge,
    pub pages: Gauge,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            adds: Counter::default(),
            lookups: Counter::default(),
            cache_hits: Counter::default(),
            page_reads: Counter::default(),
            page_writes: Counter::default(),
            rescans: Counter::default(),
            saves: Counter::default(),
            entries: Gauge::default(),
            pages: Gauge::default(),
        };
        registry.register("adds", "Number of entries added", metrics.adds.clone());
        registry.register("lookups", "Number of lookups", metrics.lookups.clone());
        registry.register(
            "cache_hits",
            "Number of lookups served from a field cache",
            metrics.cache_hits.clone(),
        );
        registry.register(
            "page_reads",
            "Number of pages read from storage",
            metrics.page_reads.clone(),
        );
        registry.register(
            "page_writes",
            "Number of pages written to storage",
            metrics.page_writes.clone(),
        );
        registry.register(
            "rescans",
            "Number of full rescans of the data pages",
            metrics.rescans.clone(),
        );
        registry.register("saves", "Number of saves", metrics.saves.clone());
        registry.register("entries", "Number of entries", metrics.entries.clone());
        registry.register("pages", "Number of data pages", metrics.pages.clone());
        metrics
    }
}

/// End of the last document added.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Tail {
    pub fileno: u32,
    pub end: u64,
    pub compressed: bool,
}

impl Tail {
    pub(super) fn of(entry: &Entry) -> Self {
        Self {
            fileno: entry.fileno,
            end: entry.offset + entry.bytes as u64,
            compressed: entry.compressed,
        }
    }
}

/// Record `entry`, the next docno, in the repository set, the caches and the aggregates.
pub(super) fn index_entry(
    reposset: &mut ReposSet,
    caches: &mut Caches,
    aggregates: &mut Aggregates,
    tail: &mut Option<Tail>,
    entry: &Entry,
) -> Result<(), Error> {
    if entry.docno != aggregates.entries {
        return Err(Error::Corrupt(format!(
            "expected docno {}, found {}",
            aggregates.entries, entry.docno
        )));
    }
    if entry.offset == 0 {
        let reposno = reposset.append(entry.docno)?;
        if reposno != entry.fileno {
            return Err(Error::Corrupt(format!(
                "docno {} opens repository {} but is stored in {}",
                entry.docno, reposno, entry.fileno
            )));
        }
        if entry.compressed {
            reposset.add_checkpoint(reposno, Compression::Gzip, 0)?;
        }
    } else {
        let continues = tail.as_ref().is_some_and(|tail| {
            tail.fileno == entry.fileno
                && tail.compressed == entry.compressed
                && tail.end == entry.offset
        });
        if !continues {
            return Err(Error::Corrupt(format!(
                "docno {} does not continue its repository",
                entry.docno
            )));
        }
        reposset.append_docno(entry.docno, 1)?;
    }
    caches.push(reposset, entry)?;
    aggregates.add(entry);
    *tail = Some(Tail::of(entry));
    Ok(())
}

/// A paged, compressed store of per-document metadata.
pub struct DocMap<S: Storage> {
    pub(super) cfg: Config,
    pub(super) pages: Pages<S>,

    // Cursors over the read and append windows
    pub(super) read: Cursor,
    pub(super) write: Cursor,

    // First docno of every data page
    pub(super) page_index: Vec<u64>,

    pub(super) reposset: ReposSet,
    pub(super) caches: Caches,
    pub(super) aggregates: Aggregates,
    pub(super) tail: Option<Tail>,

    // Encoding scratch space
    pub(super) scratch: Vec<u8>,

    // Whether the page index, caches or repository set changed since the last save
    pub(super) dirty: bool,

    pub(super) metrics: Metrics,
}

impl<S: Storage> DocMap<S> {
    /// Create an empty store in `cfg.partition`.
    ///
    /// Fails if the partition already holds a store.
    pub fn new(storage: S, registry: &mut Registry, cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        storage.create(&cfg.partition, 0)?;
        let mut docmap = Self::init(storage, registry, cfg)?;
        docmap.rotate(0)?;
        debug!(partition = %docmap.cfg.partition, "created docmap");
        Ok(docmap)
    }

    /// Build an empty in-memory state without touching storage.
    pub(super) fn init(storage: S, registry: &mut Registry, cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = Metrics::new(registry);
        let files = Files::new(
            storage,
            cfg.partition.clone(),
            cfg.page_size.get(),
            cfg.pages_per_file(),
            metrics.page_reads.clone(),
            metrics.page_writes.clone(),
        );
        let pages = Pages::new(files, cfg.buffer_pages.get())?;
        let mut scratch = Vec::new();
        scratch.try_reserve(cfg.page_size.get())?;
        Ok(Self {
            caches: Caches::new(cfg.cache),
            cfg,
            pages,
            read: Cursor::default(),
            write: Cursor::default(),
            page_index: Vec::new(),
            reposset: ReposSet::new(),
            aggregates: Aggregates::default(),
            tail: None,
            scratch,
            dirty: false,
            metrics,
        })
    }

    /// Remove every backing file of the store.
    pub fn destroy(self) -> Result<(), Error> {
        let files = &self.pages.files;
        for fileno in 0.. {
            match files.storage().unlink(files.partition(), fileno) {
                Ok(()) => {}
                Err(storage::Error::FileMissing(_, _)) => break,
                Err(err) => return Err(err.into()),
            }
        }
        debug!(partition = %self.cfg.partition, "destroyed docmap");
        Ok(())
    }

    /// Number of entries.
    pub fn entries(&self) -> u64 {
        self.aggregates.entries
    }

    /// Running totals over all entries.
    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    pub fn avg_bytes(&self) -> f64 {
        self.aggregates.avg_bytes()
    }

    pub fn total_bytes(&self) -> f64 {
        self.aggregates.total_bytes()
    }

    pub fn avg_words(&self) -> f64 {
        self.aggregates.avg_words()
    }

    pub fn avg_distinct_words(&self) -> f64 {
        self.aggregates.avg_distinct_words()
    }

    pub fn avg_weight(&self) -> f64 {
        self.aggregates.avg_weight()
    }

    /// Fields currently cached in memory.
    pub fn cached(&self) -> Cache {
        self.caches.set
    }

    pub fn reposset(&self) -> &ReposSet {
        &self.reposset
    }

    /// Repository holding `docno`.
    pub fn reposno(&self, docno: u64) -> Result<u32, Error> {
        self.check_range(docno)?;
        Ok(self.reposset.reposno(docno)?)
    }

    fn check_range(&self, docno: u64) -> Result<(), Error> {
        if docno >= self.aggregates.entries {
            return Err(Error::DocnoOutOfRange(docno, self.aggregates.entries));
        }
        Ok(())
    }

    fn validate(&self, doc: &Document) -> Result<(), Error> {
        if doc.distinct_words > doc.words {
            return Err(Error::InvalidEntry(format!(
                "{} distinct words exceed {} words",
                doc.distinct_words, doc.words
            )));
        }
        if 2 * doc.words as u64 > doc.bytes as u64 + 1 {
            return Err(Error::InvalidEntry(format!(
                "{} words do not fit in {} bytes",
                doc.words, doc.bytes
            )));
        }
        if !doc.weight.is_finite() {
            return Err(Error::InvalidEntry(format!(
                "weight {} is not finite",
                doc.weight
            )));
        }
        if doc.offset == 0 {
            let next = self.reposset.entries();
            if doc.fileno != next {
                return Err(Error::InvalidEntry(format!(
                    "document opens repository {} but the next repository is {}",
                    doc.fileno, next
                )));
            }
            return Ok(());
        }
        match self.tail {
            None => Err(Error::InvalidEntry("no repository is open".into())),
            Some(tail) if tail.fileno != doc.fileno => Err(Error::InvalidEntry(format!(
                "document continues repository {} but {} is open",
                doc.fileno, tail.fileno
            ))),
            Some(tail) if tail.compressed != doc.compressed => Err(Error::InvalidEntry(
                "compression differs from the open repository".into(),
            )),
            Some(tail) if tail.end != doc.offset => Err(Error::InvalidEntry(format!(
                "offset {} does not follow the previous document ending at {} \
                 (gaps within a repository are unsupported)",
                doc.offset, tail.end
            ))),
            Some(_) => Ok(()),
        }
    }

    pub(super) fn write_position(&self) -> Result<Position, Error> {
        self.write
            .position
            .ok_or_else(|| Error::Corrupt("no page is open for appending".into()))
    }

    /// Append a document, returning its docno.
    pub fn add(&mut self, doc: &Document) -> Result<u64, Error> {
        self.validate(doc)?;
        let docno = self.aggregates.entries;
        let entry = Entry {
            docno,
            fileno: doc.fileno,
            offset: doc.offset,
            bytes: doc.bytes,
            compressed: doc.compressed,
            words: doc.words,
            distinct_words: doc.distinct_words,
            mime: doc.mime,
            trecno: doc.trecno.to_vec(),
            weight: codec::quantize(doc.weight, WEIGHT_PRECISION),
        };

        // Reject entries that would not fit even at the start of a page
        let page_size = self.pages.page_size();
        self.scratch.clear();
        self.scratch.try_reserve(entry.trecno.len() + 64)?;
        entry.encode(&Entry::default(), &mut self.scratch);
        if DATA_HEADER_SIZE + self.scratch.len() > page_size {
            return Err(Error::EntryTooLarge(self.scratch.len(), page_size));
        }

        // Encode relative to the previous entry, moving to a fresh page if needed
        let mut position = self.write_position()?;
        self.scratch.clear();
        entry.encode(&self.write.entry, &mut self.scratch);
        if position.pos + self.scratch.len() > page_size {
            self.rotate(docno)?;
            position = self.write_position()?;
            self.scratch.clear();
            entry.encode(&self.write.entry, &mut self.scratch);
        }
        let end = position.pos + self.scratch.len();
        self.pages.page_mut(WindowId::Append, position.page)[position.pos..end]
            .copy_from_slice(&self.scratch);
        self.pages.append.dirty = true;

        index_entry(
            &mut self.reposset,
            &mut self.caches,
            &mut self.aggregates,
            &mut self.tail,
            &entry,
        )?;
        self.dirty = true;

        self.write.position = Some(Position { pos: end, ..position });
        self.write.entry = entry;
        self.write.entries += 1;
        self.write.past += 1;
        self.write.end_docno = docno + 1;

        self.metrics.adds.inc();
        self.metrics.entries.set(self.aggregates.entries as i64);
        Ok(docno)
    }

    /// Finish the current append page and start a fresh one whose first entry is `docno`.
    pub(super) fn rotate(&mut self, docno: u64) -> Result<(), Error> {
        if self.pages.append.len > 0 {
            let position = self.write_position()?;
            let count = self.write.entries.to_be_bytes();
            self.pages.page_mut(WindowId::Append, position.page)[1..DATA_HEADER_SIZE]
                .copy_from_slice(&count);

            // A read cursor on the finished page saw the count of an earlier add
            if self.read.position.is_some_and(|read| read.page == position.page) {
                self.read.entries = self.write.entries;
            }
        }

        // Once the read window is down to its last page, flush and take every page back
        if self.pages.read.capacity == 1 {
            self.pages.commit_append()?;
            self.pages.reclaim();
            self.read.check(&self.pages);
            self.write.check(&self.pages);
        }

        // Provision the next file when crossing a file boundary
        let page = self.pages.append.end();
        if page != 0 && page % self.pages.files.pages_per_file() == 0 {
            let fileno = self.pages.files.fileno(page)?;
            self.pages.files.provision(fileno)?;
        }

        self.pages.steal();
        self.read.check(&self.pages);
        self.page_index.try_reserve(1)?;
        self.page_index.push(docno);

        self.pages.append.len += 1;
        let bytes = self.pages.page_mut(WindowId::Append, page);
        bytes.fill(0);
        bytes[0] = DATA_TAG;
        self.pages.append.dirty = true;
        self.dirty = true;
        self.write
            .reset(&self.pages, WindowId::Append, page, docno, docno)?;

        self.metrics.pages.set(self.page_index.len() as i64);
        debug!(page, docno, "started page");
        Ok(())
    }

    /// One past the last docno on `page`.
    fn page_end(&self, page: u64) -> u64 {
        self.page_index
            .get(page as usize + 1)
            .copied()
            .unwrap_or(self.aggregates.entries)
    }

    /// Page holding `docno`.
    fn find_page(&self, docno: u64) -> u64 {
        let slot = self.page_index.partition_point(|first| *first <= docno);
        slot.saturating_sub(1) as u64
    }

    /// Position the read cursor before the first entry of `page`.
    pub(super) fn reset_read(&mut self, page: u64) -> Result<(), Error> {
        let first = *self
            .page_index
            .get(page as usize)
            .ok_or_else(|| Error::Corrupt(format!("page {page} is not indexed")))?;
        let end = self.page_end(page);
        let id = self.pages.page_in(page, self.pages.append.end())?;
        self.read.reset(&self.pages, id, page, first, end)?;

        // The header of the page being appended to is only updated when it is finished
        if self.write.position.is_some_and(|position| position.page == page) {
            self.read.entries = self.write.entries;
        }
        Ok(())
    }

    /// Position the read cursor on `docno`.
    fn traverse(&mut self, docno: u64) -> Result<(), Error> {
        self.check_range(docno)?;
        self.read.check(&self.pages);
        if let Some(position) = self.read.position {
            self.read.end_docno = self.page_end(position.page);
        }

        match self.read.position {
            Some(position) if self.read.covers(docno) => {
                if self.read.past > 0 && docno < self.read.entry.docno {
                    self.reset_read(position.page)?;
                } else if self.write.position.is_some_and(|w| w.page == position.page) {
                    self.read.entries = self.write.entries;
                }
            }
            _ => self.reset_read(self.find_page(docno))?,
        }

        while self.read.past == 0 || self.read.entry.docno < docno {
            if self.read.past >= self.read.entries {
                return Err(Error::NotFound(docno));
            }
            self.read.advance(&self.pages)?;
        }
        if self.read.entry.docno != docno {
            return Err(Error::NotFound(docno));
        }
        Ok(())
    }

    /// Decode the complete entry of `docno` from its page.
    pub fn get(&mut self, docno: u64) -> Result<Entry, Error> {
        self.metrics.lookups.inc();
        self.traverse(docno)?;
        Ok(self.read.entry.clone())
    }

    /// External identifier of `docno`.
    pub fn get_trecno(&mut self, docno: u64) -> Result<Vec<u8>, Error> {
        self.check_range(docno)?;
        self.metrics.lookups.inc();
        if let Some(trecno) = self.caches.trecno(docno)? {
            self.metrics.cache_hits.inc();
            return Ok(trecno);
        }
        self.traverse(docno)?;
        Ok(self.read.entry.trecno.clone())
    }

    /// Where the raw bytes of `docno` live.
    pub fn get_location(&mut self, docno: u64) -> Result<Location, Error> {
        self.check_range(docno)?;
        self.metrics.lookups.inc();
        if let Some(location) = self.caches.location(&self.reposset, docno)? {
            self.metrics.cache_hits.inc();
            return Ok(location);
        }
        self.traverse(docno)?;
        Ok(self.read.entry.location())
    }

    /// Length of `docno`, in bytes.
    pub fn get_bytes(&mut self, docno: u64) -> Result<u32, Error> {
        self.check_range(docno)?;
        if self.caches.set.contains(Cache::LOCATION) {
            return Ok(self.get_location(docno)?.bytes);
        }
        self.metrics.lookups.inc();
        self.traverse(docno)?;
        Ok(self.read.entry.bytes)
    }

    pub fn get_words(&mut self, docno: u64) -> Result<u32, Error> {
        self.check_range(docno)?;
        self.metrics.lookups.inc();
        if let Some(words) = self.caches.words(docno) {
            self.metrics.cache_hits.inc();
            return Ok(words);
        }
        self.traverse(docno)?;
        Ok(self.read.entry.words)
    }

    pub fn get_distinct_words(&mut self, docno: u64) -> Result<u32, Error> {
        self.check_range(docno)?;
        self.metrics.lookups.inc();
        if let Some(distinct_words) = self.caches.distinct_words(docno) {
            self.metrics.cache_hits.inc();
            return Ok(distinct_words);
        }
        self.traverse(docno)?;
        Ok(self.read.entry.distinct_words)
    }

    pub fn get_weight(&mut self, docno: u64) -> Result<f32, Error> {
        self.check_range(docno)?;
        self.metrics.lookups.inc();
        if let Some(weight) = self.caches.weight(docno) {
            self.metrics.cache_hits.inc();
            return Ok(weight);
        }
        self.traverse(docno)?;
        Ok(self.read.entry.weight)
    }

    /// Change the set of cached fields.
    ///
    /// Dropping fields releases them in place. Adding fields (or `reread`) rebuilds every
    /// cache, the page index and the repository set by decoding all data pages.
    pub fn cache(&mut self, set: Cache, reread: bool) -> Result<(), Error> {
        let current = self.caches.set;
        if !reread {
            if set == current {
                return Ok(());
            }
            if current.contains(set) {
                self.caches.retain(set);
                self.dirty = true;
                return Ok(());
            }
        }
        self.caches.set = set;
        self.rescan()
    }

    /// Rebuild the page index, repository set, caches and aggregates from the data pages.
    pub(super) fn rescan(&mut self) -> Result<(), Error> {
        let pages = self.pages.append.end();
        debug!(pages, cache = ?self.caches.set, "rescanning");
        self.metrics.rescans.inc();

        self.page_index.clear();
        self.reposset.clear();
        self.caches.clear();
        self.aggregates = Aggregates::default();
        self.tail = None;
        for page in 0..pages {
            self.page_index.try_reserve(1)?;
            self.page_index.push(self.aggregates.entries);
            self.reset_read(page)?;
            while self.read.past < self.read.entries {
                self.read.advance(&self.pages)?;
                index_entry(
                    &mut self.reposset,
                    &mut self.caches,
                    &mut self.aggregates,
                    &mut self.tail,
                    &self.read.entry,
                )?;
            }
        }
        self.dirty = true;

        self.metrics.entries.set(self.aggregates.entries as i64);
        self.metrics.pages.set(self.page_index.len() as i64);
        debug!(entries = self.aggregates.entries, "rescanned");
        Ok(())
    }

    /// Decode every entry and check it against the page index, the repository set and the
    /// cached fields.
    pub fn verify(&mut self) -> Result<(), Error> {
        let pages = self.pages.append.end();
        if self.page_index.len() as u64 != pages {
            return Err(Error::Corrupt(format!(
                "{} pages are indexed but {} exist",
                self.page_index.len(),
                pages
            )));
        }

        let mut docno = 0;
        for page in 0..pages {
            if self.page_index[page as usize] != docno {
                return Err(Error::Corrupt(format!(
                    "page {page} is indexed at docno {} but starts at {docno}",
                    self.page_index[page as usize]
                )));
            }
            self.reset_read(page)?;
            while self.read.past < self.read.entries {
                self.read.advance(&self.pages)?;
                self.verify_entry(docno)?;
                docno += 1;
            }
        }
        if docno != self.aggregates.entries {
            return Err(Error::Corrupt(format!(
                "{} entries are recorded but {docno} are stored",
                self.aggregates.entries
            )));
        }
        Ok(())
    }

    fn verify_entry(&self, docno: u64) -> Result<(), Error> {
        let mismatch = |field: &str| {
            Error::Corrupt(format!("{field} of docno {docno} does not match its page"))
        };
        let entry = &self.read.entry;
        if entry.docno != docno {
            return Err(mismatch("docno"));
        }

        let reposno = self.reposset.reposno(docno)?;
        if reposno != entry.fileno {
            return Err(mismatch("repository"));
        }
        if self.reposset.check(reposno).is_some() != entry.compressed {
            return Err(mismatch("compression"));
        }

        let set = self.caches.set;
        if set.contains(Cache::WORDS) && self.caches.words(docno) != Some(entry.words) {
            return Err(mismatch("cached words"));
        }
        if set.contains(Cache::DISTINCT_WORDS)
            && self.caches.distinct_words(docno) != Some(entry.distinct_words)
        {
            return Err(mismatch("cached distinct words"));
        }
        if set.contains(Cache::WEIGHT) && self.caches.weight(docno) != Some(entry.weight) {
            return Err(mismatch("cached weight"));
        }
        if let Some(trecno) = self.caches.trecno(docno)? {
            if trecno != entry.trecno {
                return Err(mismatch("cached trecno"));
            }
        }
        if let Some(location) = self.caches.location(&self.reposset, docno)? {
            if location != entry.location() {
                return Err(mismatch("cached location"));
            }
        }
        Ok(())
    }
}
