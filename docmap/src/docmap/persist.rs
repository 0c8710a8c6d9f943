//! Saving and loading the state that is not held by the data pages.

use super::{
    buffer::{Files, WindowId},
    cache::{push, Caches},
    store::{DocMap, Tail},
    Aggregates, Cache, Config, Error, AGGREGATE_PRECISION, CACHE_TAG, DATA_HEADER_SIZE, DATA_TAG,
    FINAL_CACHE_TAG, FINAL_DATA_TAG, LOCATION_BLOCK, TRECNO_BLOCK, WEIGHT_PRECISION,
};
use crate::{
    codec,
    mime::Mime,
    reposset::{self, Compression, Kind, ReposSet},
    storage::{self, Blob as _, Storage},
};
use bytes::{Buf, BufMut};
use prometheus_client::registry::Registry;
use tracing::{debug, warn};

/// Arrays persisted as fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    PageIndex,
    Words,
    DistinctWords,
    Weights,
    TrecnoOffsets,
    Trecnos,
    ReposRecords,
    ReposCheckpoints,
    LocationOffsets,
    Locations,
    MimeExceptions,
}

impl Channel {
    const COUNT: usize = 11;

    fn id(self) -> u8 {
        match self {
            Channel::PageIndex => 0x02,
            Channel::Words => 0x03,
            Channel::DistinctWords => 0x04,
            Channel::Weights => 0x07,
            Channel::TrecnoOffsets => 0x08,
            Channel::Trecnos => 0x09,
            Channel::ReposRecords => 0x0A,
            Channel::ReposCheckpoints => 0x0B,
            Channel::LocationOffsets => 0x0C,
            Channel::Locations => 0x0D,
            Channel::MimeExceptions => 0x0E,
        }
    }

    fn from_id(id: u64) -> Option<Self> {
        Some(match id {
            0x02 => Channel::PageIndex,
            0x03 => Channel::Words,
            0x04 => Channel::DistinctWords,
            0x07 => Channel::Weights,
            0x08 => Channel::TrecnoOffsets,
            0x09 => Channel::Trecnos,
            0x0A => Channel::ReposRecords,
            0x0B => Channel::ReposCheckpoints,
            0x0C => Channel::LocationOffsets,
            0x0D => Channel::Locations,
            0x0E => Channel::MimeExceptions,
            _ => return None,
        })
    }
}

const END_ID: u8 = 0x00;
const AGGREGATES_ID: u8 = 0x01;

fn fragment_header(channel: Channel, total: u64, start: u64, count: u32, out: &mut Vec<u8>) {
    out.put_u8(channel.id());
    codec::write_vbyte(total, out);
    codec::write_vbyte(start, out);
    out.put_u32(count);
}

fn fragment_header_size(total: u64, start: u64) -> usize {
    1 + codec::vbyte_size(total) + codec::vbyte_size(start) + COUNT_SIZE
}

/// Size of the fixed-width item count of a fragment.
const COUNT_SIZE: usize = 4;

/// Size of an aggregates record.
const AGGREGATES_SIZE: usize = 1 + 5 * codec::float_size(AGGREGATE_PRECISION);

/// A self-delimiting record of a cache page.
#[derive(Debug, PartialEq)]
enum Record {
    End,
    Aggregates([f32; 5]),
    /// Items `[start, start + count)` of an array of `total` items, which follow the header.
    Fragment {
        channel: Channel,
        total: u64,
        start: u64,
        count: u32,
    },
}

impl Record {
    fn read(buf: &mut &[u8]) -> Result<Self, Error> {
        match codec::read_vbyte(buf)? {
            id if id == END_ID as u64 => Ok(Record::End),
            id if id == AGGREGATES_ID as u64 => {
                let mut sums = [0.0; 5];
                for sum in &mut sums {
                    *sum = codec::read_float(buf, AGGREGATE_PRECISION)?;
                }
                Ok(Record::Aggregates(sums))
            }
            id => {
                let channel = Channel::from_id(id)
                    .ok_or_else(|| Error::Corrupt(format!("unknown cache record {id:#04x}")))?;
                let total = codec::read_vbyte(buf)?;
                let start = codec::read_vbyte(buf)?;
                if buf.len() < COUNT_SIZE {
                    return Err(codec::Error::EndOfBuffer.into());
                }
                let count = buf.get_u32();
                Ok(Record::Fragment {
                    channel,
                    total,
                    start,
                    count,
                })
            }
        }
    }
}

/// Lays out records over consecutive cache pages, staging them in a scratch buffer.
struct Writer<'a, S: Storage> {
    files: &'a Files<S>,
    buf: &'a mut [u8],
    page_size: usize,

    // Page stored in the first slot of the buffer
    first: u64,
    slot: usize,
    pos: usize,
    // Offset of the first record of the current page
    body: usize,

    entries: u64,
    data_pages: u64,
    item: Vec<u8>,
}

impl<'a, S: Storage> Writer<'a, S> {
    fn new(files: &'a Files<S>, buf: &'a mut [u8], first: u64, entries: u64) -> Self {
        let mut writer = Self {
            page_size: files.page_size(),
            files,
            buf,
            first,
            slot: 0,
            pos: 0,
            body: 0,
            entries,
            data_pages: first,
            item: Vec::new(),
        };
        writer.open_page();
        writer
    }

    fn open_page(&mut self) {
        let start = self.slot * self.page_size;
        let page = &mut self.buf[start..start + self.page_size];
        page.fill(0);
        let mut header = &mut page[..];
        header.put_u8(CACHE_TAG);
        codec::write_vbyte(self.entries, &mut header);
        codec::write_vbyte(self.data_pages, &mut header);
        self.pos = self.page_size - header.len();
        self.body = self.pos;
    }

    /// Bytes left on the current page, keeping one for the terminator.
    fn available(&self) -> usize {
        self.page_size - self.pos - 1
    }

    fn put(&mut self, bytes: &[u8]) {
        let start = self.slot * self.page_size + self.pos;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.files
            .write(self.first, &self.buf[..self.slot * self.page_size])?;
        self.first += self.slot as u64;
        self.slot = 0;
        Ok(())
    }

    fn next_page(&mut self) -> Result<(), Error> {
        self.put(&[END_ID]);
        self.slot += 1;
        if (self.slot + 1) * self.page_size > self.buf.len() {
            self.flush()?;
        }
        self.open_page();
        Ok(())
    }

    /// Terminate the last page, tag it as final and write out every staged page. Returns
    /// one past the last page written.
    fn finish(mut self) -> Result<u64, Error> {
        self.put(&[END_ID]);
        self.buf[self.slot * self.page_size] = FINAL_CACHE_TAG;
        self.slot += 1;
        self.flush()?;
        Ok(self.first)
    }

    fn aggregates(&mut self, aggregates: &Aggregates) -> Result<(), Error> {
        if self.available() < AGGREGATES_SIZE {
            self.next_page()?;
        }
        let mut item = std::mem::take(&mut self.item);
        item.clear();
        item.put_u8(AGGREGATES_ID);
        for sum in [
            aggregates.sum_bytes,
            aggregates.sum_words,
            aggregates.sum_distinct_words,
            aggregates.sum_weight,
            aggregates.sum_trecno,
        ] {
            codec::write_float(sum as f32, AGGREGATE_PRECISION, &mut item);
        }
        self.put(&item);
        self.item = item;
        Ok(())
    }

    /// Write `items` as fragments, splitting them across pages as needed.
    ///
    /// An empty array is still written so that it is known to be present.
    fn fragments<T>(
        &mut self,
        channel: Channel,
        items: &[T],
        encode: impl Fn(&T, &mut Vec<u8>),
    ) -> Result<(), Error> {
        let total = items.len() as u64;
        let mut start = 0;
        loop {
            let header_size = fragment_header_size(total, start as u64);
            if self.available() < header_size {
                self.next_page()?;
                continue;
            }

            // Stage as many items as fit after the header
            let header_pos = self.pos;
            self.pos += header_size;
            let mut count = 0;
            let mut item = std::mem::take(&mut self.item);
            while start + count < items.len() {
                item.clear();
                encode(&items[start + count], &mut item);
                if item.len() > self.available() {
                    break;
                }
                self.put(&item);
                count += 1;
            }
            self.item = item;

            if count == 0 && start < items.len() {
                self.pos = header_pos;
                if header_pos == self.body {
                    return Err(Error::EntryTooLarge(header_size, self.page_size));
                }
                self.next_page()?;
                continue;
            }
            self.write_header(header_pos, channel, total, start as u64, count as u32);
            start += count;
            if start == items.len() {
                return Ok(());
            }
            self.next_page()?;
        }
    }

    /// Write `bytes` as fragments of single-byte items.
    fn fragment_bytes(&mut self, channel: Channel, bytes: &[u8]) -> Result<(), Error> {
        let total = bytes.len() as u64;
        let mut start = 0;
        loop {
            // Unless the array is empty, at least one byte must follow the header
            let header_size = fragment_header_size(total, start as u64);
            if self.available() < header_size + usize::from(start < bytes.len()) {
                self.next_page()?;
                continue;
            }
            let header_pos = self.pos;
            self.pos += header_size;
            let count = self.available().min(bytes.len() - start);
            self.put(&bytes[start..start + count]);
            self.write_header(header_pos, channel, total, start as u64, count as u32);
            start += count;
            if start == bytes.len() {
                return Ok(());
            }
            self.next_page()?;
        }
    }

    fn write_header(&mut self, pos: usize, channel: Channel, total: u64, start: u64, count: u32) {
        let mut header = std::mem::take(&mut self.item);
        header.clear();
        fragment_header(channel, total, start, count, &mut header);
        let at = self.slot * self.page_size + pos;
        self.buf[at..at + header.len()].copy_from_slice(&header);
        self.item = header;
    }
}

/// State restored from cache pages.
#[derive(Default)]
struct Restored {
    page_index: Vec<u64>,
    reposset: ReposSet,
    caches: Caches,
    aggregates: Option<[f32; 5]>,

    // Expected total and items read so far, per channel
    fills: [Option<(u64, u64)>; Channel::COUNT],
}

impl Restored {
    fn read_items(&mut self, channel: Channel, count: u32, buf: &mut &[u8]) -> Result<(), Error> {
        // Every item occupies at least one byte
        let count = count as usize;
        if count > buf.len() {
            return Err(codec::Error::EndOfBuffer.into());
        }
        let caches = &mut self.caches;
        match channel {
            Channel::Trecnos => {
                caches.trecnos.try_reserve(count)?;
                caches.trecnos.extend_from_slice(codec::read_slice(buf, count)?);
            }
            Channel::Locations => {
                caches.locations.try_reserve(count)?;
                caches.locations.extend_from_slice(codec::read_slice(buf, count)?);
            }
            _ => {
                for _ in 0..count {
                    self.read_item(channel, buf)?;
                }
            }
        }
        Ok(())
    }

    fn read_item(&mut self, channel: Channel, buf: &mut &[u8]) -> Result<(), Error> {
        let caches = &mut self.caches;
        match channel {
            Channel::PageIndex => push(&mut self.page_index, codec::read_vbyte(buf)?)?,
            Channel::Words => push(&mut caches.words, codec::read_vbyte_u32(buf)?)?,
            Channel::DistinctWords => {
                push(&mut caches.distinct_words, codec::read_vbyte_u32(buf)?)?
            }
            Channel::Weights => push(
                &mut caches.weights,
                codec::read_float(buf, WEIGHT_PRECISION)?,
            )?,
            Channel::TrecnoOffsets => push(&mut caches.trecno_offsets, codec::read_vbyte(buf)?)?,
            Channel::LocationOffsets => {
                push(&mut caches.location_offsets, codec::read_vbyte(buf)?)?
            }
            Channel::MimeExceptions => {
                let docno = codec::read_vbyte(buf)?;
                let mime = Mime::new(codec::read_vbyte_u32(buf)?);
                push(&mut caches.mime_exceptions, (docno, mime))?;
            }
            Channel::ReposRecords => {
                let packed = codec::read_vbyte(buf)?;
                let reposno = u32::try_from(packed >> 1)
                    .map_err(|_| codec::Error::InvalidData("reposno overflow"))?;
                let record = reposset::Record {
                    kind: Kind::from_bit(packed),
                    reposno,
                    docno: codec::read_vbyte(buf)?,
                    quantity: codec::read_vbyte(buf)?,
                };
                if record.quantity == 0 {
                    return Err(codec::Error::InvalidData("empty repository record").into());
                }
                self.reposset.set_record(record)?;
            }
            Channel::ReposCheckpoints => {
                let reposno = codec::read_vbyte_u32(buf)?;
                let offset = codec::read_vbyte(buf)?;
                let mime = Mime::new(codec::read_vbyte_u32(buf)?);
                let compression = Compression::from_mime(mime).ok_or_else(|| {
                    Error::Corrupt(format!("checkpoint with unknown compression {mime}"))
                })?;
                self.reposset.add_checkpoint(reposno, compression, offset)?;
            }
            Channel::Trecnos | Channel::Locations => {
                return Err(Error::Corrupt("byte arrays are read in bulk".into()))
            }
        }
        Ok(())
    }

    /// Parse the records of one cache page.
    fn read_page(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        loop {
            match Record::read(&mut buf)? {
                Record::End => return Ok(()),
                Record::Aggregates(sums) => {
                    if self.aggregates.replace(sums).is_some() {
                        return Err(Error::Corrupt("duplicate aggregates".into()));
                    }
                }
                Record::Fragment {
                    channel,
                    total,
                    start,
                    count,
                } => {
                    let (expected, filled) =
                        self.fills[channel as usize].get_or_insert((total, 0));
                    if *expected != total || *filled != start {
                        return Err(Error::Corrupt(format!(
                            "fragment {start}..+{count} of {channel:?} is out of order"
                        )));
                    }
                    *filled += count as u64;
                    if *filled > total {
                        return Err(Error::Corrupt(format!("{channel:?} overflows")));
                    }
                    self.read_items(channel, count, &mut buf)?;
                }
            }
        }
    }

    /// Number of items of `channel`, if it was present and complete.
    fn total(&self, channel: Channel) -> Option<u64> {
        self.fills[channel as usize].map(|(total, _)| total)
    }

    /// Check the restored state against the data pages, returning the set of cached fields.
    fn validate(&self, entries: u64, data_pages: u64) -> Result<Cache, Error> {
        for (slot, fill) in self.fills.iter().enumerate() {
            if let Some((total, filled)) = fill {
                if total != filled {
                    return Err(Error::Corrupt(format!(
                        "channel {slot} holds {filled} of {total} items"
                    )));
                }
            }
        }
        if self.aggregates.is_none() {
            return Err(Error::Corrupt("aggregates are missing".into()));
        }
        if self.total(Channel::ReposRecords).is_none()
            || self.total(Channel::ReposCheckpoints).is_none()
        {
            return Err(Error::Corrupt("repository set is missing".into()));
        }

        // The page index starts at docno 0 and strictly increases
        if self.page_index.len() as u64 != data_pages {
            return Err(Error::Corrupt(format!(
                "{} pages are indexed but {data_pages} exist",
                self.page_index.len()
            )));
        }
        if self.page_index.first() != Some(&0)
            || self.page_index.windows(2).any(|pair| pair[0] >= pair[1])
            || self
                .page_index
                .last()
                .is_some_and(|last| *last >= entries && entries > 0)
        {
            return Err(Error::Corrupt("page index is not ordered".into()));
        }

        // Repositories cover every docno
        let covered = self.reposset.records().iter().try_fold(0u64, |end, record| {
            (record.docno == end).then(|| record.end())
        });
        if covered != Some(entries) {
            return Err(Error::Corrupt(format!(
                "repositories cover {covered:?} of {entries} entries"
            )));
        }

        // Cached fields cover every docno
        let mut set = Cache::NONE;
        let flat = [
            (Channel::Words, Cache::WORDS),
            (Channel::DistinctWords, Cache::DISTINCT_WORDS),
            (Channel::Weights, Cache::WEIGHT),
        ];
        for (channel, field) in flat {
            match self.total(channel) {
                Some(total) if total == entries => set |= field,
                Some(total) => {
                    return Err(Error::Corrupt(format!(
                        "{channel:?} holds {total} of {entries} entries"
                    )))
                }
                None => {}
            }
        }
        let blocked = [
            (
                Channel::TrecnoOffsets,
                Channel::Trecnos,
                TRECNO_BLOCK,
                Cache::TRECNO,
                &self.caches.trecno_offsets,
                self.caches.trecnos.len(),
            ),
            (
                Channel::LocationOffsets,
                Channel::Locations,
                LOCATION_BLOCK,
                Cache::LOCATION,
                &self.caches.location_offsets,
                self.caches.locations.len(),
            ),
        ];
        for (offsets, bytes, block, field, starts, len) in blocked {
            match (self.total(offsets), self.total(bytes)) {
                (None, None) => {}
                (Some(total), Some(_)) if total == entries.div_ceil(block) => {
                    if starts.windows(2).any(|pair| pair[0] > pair[1])
                        || starts.last().is_some_and(|last| *last as usize >= len)
                    {
                        return Err(Error::Corrupt(format!("{offsets:?} are out of range")));
                    }
                    set |= field;
                }
                _ => return Err(Error::Corrupt(format!("{bytes:?} are incomplete"))),
            }
        }
        if set.contains(Cache::LOCATION) {
            if self.total(Channel::MimeExceptions).is_none() {
                return Err(Error::Corrupt("MIME exceptions are missing".into()));
            }
            let exceptions = &self.caches.mime_exceptions;
            if exceptions.windows(2).any(|pair| pair[0].0 >= pair[1].0)
                || exceptions.last().is_some_and(|last| last.0 >= entries)
            {
                return Err(Error::Corrupt("MIME exceptions are not ordered".into()));
            }
        }
        Ok(set)
    }
}

impl<S: Storage> DocMap<S> {
    /// Open the store saved in `cfg.partition`.
    ///
    /// The page index, repository set and caches are restored from the cache pages written by
    /// the last [DocMap::save]. If those pages are corrupt or hold a different set of caches
    /// than `cfg.cache`, the data pages are decoded instead.
    pub fn load(storage: S, registry: &mut Registry, cfg: Config) -> Result<Self, Error> {
        let mut docmap = Self::init(storage, registry, cfg)?;
        let total = docmap.count_pages()?;
        if total == 0 {
            // Created but never saved
            docmap.rotate(0)?;
            debug!(partition = %docmap.cfg.partition, "loaded empty docmap");
            return Ok(docmap);
        }

        // The final cache page locates the end of the data pages
        let page_size = docmap.pages.page_size();
        docmap.scratch.clear();
        docmap.scratch.resize(page_size, 0);
        let last = total - 1;
        if docmap.pages.files.read(last, &mut docmap.scratch)? != 1 {
            return Err(Error::Corrupt(format!("page {last} is missing")));
        }
        if docmap.scratch[0] != FINAL_CACHE_TAG {
            return Err(Error::InvalidTag(last, docmap.scratch[0]));
        }
        let mut header = &docmap.scratch[1..];
        let entries = codec::read_vbyte(&mut header).map_err(|err| Error::CorruptPage(last, err))?;
        let data_pages =
            codec::read_vbyte(&mut header).map_err(|err| Error::CorruptPage(last, err))?;
        if data_pages == 0 || data_pages >= total {
            return Err(Error::Corrupt(format!(
                "{data_pages} data pages do not fit in {total} pages"
            )));
        }

        // Resume appending to the last data page
        let tail = data_pages - 1;
        docmap.pages.load_append(tail)?;
        let page = docmap.pages.page_mut(WindowId::Append, tail);
        if page[0] != FINAL_DATA_TAG {
            return Err(Error::InvalidTag(tail, page[0]));
        }
        page[0] = DATA_TAG;
        docmap
            .write
            .reset(&docmap.pages, WindowId::Append, tail, 0, 0)?;
        while docmap.write.past < docmap.write.entries {
            docmap.write.advance(&docmap.pages)?;
        }

        // Restore the rest from the cache pages, falling back to decoding the data pages
        let cache = docmap.cfg.cache;
        match docmap.restore(data_pages, total, entries) {
            Ok(()) => {
                docmap.dirty = false;
                docmap.cache(cache, false)?;
            }
            Err(err @ Error::Storage(_)) => return Err(err),
            Err(err) => {
                warn!(?err, "cache pages are unusable, rescanning");
                docmap.caches = Caches::new(cache);
                docmap.rescan()?;
            }
        }
        docmap.pages.read.len = 0;
        docmap.read.position = None;

        let first = docmap.page_index[tail as usize];
        docmap.write.first_docno = first;
        docmap.write.end_docno = docmap.aggregates.entries;
        docmap.metrics.entries.set(docmap.aggregates.entries as i64);
        docmap.metrics.pages.set(docmap.page_index.len() as i64);
        debug!(
            partition = %docmap.cfg.partition,
            entries = docmap.aggregates.entries,
            pages = data_pages,
            cache = ?docmap.caches.set,
            "loaded docmap"
        );
        Ok(docmap)
    }

    /// Number of pages across every backing file.
    fn count_pages(&self) -> Result<u64, Error> {
        let files = &self.pages.files;
        let page_size = files.page_size() as u64;
        let full = files.pages_per_file() * page_size;
        let mut pages = 0;
        for fileno in 0.. {
            let blob = match files.pin(fileno) {
                Err(Error::Storage(storage::Error::FileMissing(_, _))) if fileno > 0 => break,
                result => result?,
            };
            let len = blob.len()?;
            if len > full || len % page_size != 0 {
                return Err(Error::InvalidFileSize(fileno, len));
            }
            pages += len / page_size;
            if len < full {
                // Only the last file may be partially filled
                if files.pin(fileno + 1).is_ok() {
                    return Err(Error::InvalidFileSize(fileno, len));
                }
                break;
            }
        }
        Ok(pages)
    }

    /// Restore the page index, repository set, caches and aggregates from the cache pages
    /// `[data_pages, total)`.
    fn restore(&mut self, data_pages: u64, total: u64, entries: u64) -> Result<(), Error> {
        let mut restored = Restored {
            caches: Caches::new(Cache::NONE),
            ..Default::default()
        };
        for page in data_pages..total {
            let id = self.pages.page_in(page, total)?;
            let bytes = self.pages.page(id, page);
            let expected = if page == total - 1 {
                FINAL_CACHE_TAG
            } else {
                CACHE_TAG
            };
            if bytes[0] != expected {
                return Err(Error::InvalidTag(page, bytes[0]));
            }
            let mut buf = &bytes[1..];
            let result = codec::read_vbyte(&mut buf)
                .and_then(|page_entries| Ok((page_entries, codec::read_vbyte(&mut buf)?)));
            match result {
                Ok(header) if header == (entries, data_pages) => {}
                Ok(_) => return Err(Error::Corrupt(format!("page {page} has a stale header"))),
                Err(err) => return Err(Error::CorruptPage(page, err)),
            }
            restored.read_page(buf).map_err(|err| match err {
                Error::Codec(err) => Error::CorruptPage(page, err),
                err => err,
            })?;
        }
        let set = restored.validate(entries, data_pages)?;

        // The last data page must end where the restored state does
        let tail = data_pages - 1;
        let first = restored.page_index[tail as usize];
        if first + self.write.entries as u64 != entries {
            return Err(Error::Corrupt(format!(
                "page {tail} holds {} entries from docno {first}, expected {entries} in total",
                self.write.entries
            )));
        }
        if self.write.entries > 0 && self.write.entry.docno + 1 != entries {
            return Err(Error::Corrupt(format!(
                "last entry has docno {}, expected {}",
                self.write.entry.docno,
                entries - 1
            )));
        }

        let Some(sums) = restored.aggregates else {
            return Err(Error::Corrupt("aggregates are missing".into()));
        };
        let [sum_bytes, sum_words, sum_distinct_words, sum_weight, sum_trecno] = sums;
        self.aggregates = Aggregates {
            entries,
            sum_bytes: sum_bytes as f64,
            sum_words: sum_words as f64,
            sum_distinct_words: sum_distinct_words as f64,
            sum_weight: sum_weight as f64,
            sum_trecno: sum_trecno as f64,
        };
        self.page_index = restored.page_index;
        self.reposset = restored.reposset;
        self.caches = restored.caches;
        self.caches.set = set;
        self.tail = (self.write.entries > 0).then(|| Tail::of(&self.write.entry));
        Ok(())
    }

    /// Persist every change since the last save.
    ///
    /// Data pages are flushed first (the last one tagged as final), followed by fresh cache
    /// pages holding the aggregates, the page index, the active caches and the repository
    /// set. Pages left over from an earlier, larger save are removed and every file is synced.
    pub fn save(&mut self) -> Result<(), Error> {
        if !self.dirty && !self.pages.append.dirty {
            return Ok(());
        }
        let page_size = self.pages.page_size();

        // Flush the append window, writing the last page from a copy tagged as final
        if self.pages.append.dirty {
            let position = self.write_position()?;
            let count = self.write.entries.to_be_bytes();
            self.pages.page_mut(WindowId::Append, position.page)[1..DATA_HEADER_SIZE]
                .copy_from_slice(&count);
            let window = self.pages.append_pages();
            let (full, last) = window.split_at(window.len() - page_size);
            self.pages.files.write(self.pages.append.page, full)?;
            self.scratch.clear();
            self.scratch.extend_from_slice(last);
            self.scratch[0] = FINAL_DATA_TAG;
            self.pages
                .files
                .write(self.pages.append.end() - 1, &self.scratch)?;
            self.pages.append.dirty = false;
        }

        // Write the cache pages, staging them in the read window
        let data_pages = self.pages.append.end();
        let entries = self.aggregates.entries;
        self.read.position = None;
        let (files, buf) = self.pages.scratch();
        let mut writer = Writer::new(files, buf, data_pages, entries);
        writer.aggregates(&self.aggregates)?;
        writer.fragments(Channel::PageIndex, &self.page_index, |first, out| {
            codec::write_vbyte(*first, out)
        })?;
        let caches = &self.caches;
        if caches.set.contains(Cache::WORDS) {
            writer.fragments(Channel::Words, &caches.words, |words, out| {
                codec::write_vbyte(*words as u64, out)
            })?;
        }
        if caches.set.contains(Cache::DISTINCT_WORDS) {
            writer.fragments(Channel::DistinctWords, &caches.distinct_words, |words, out| {
                codec::write_vbyte(*words as u64, out)
            })?;
        }
        if caches.set.contains(Cache::WEIGHT) {
            writer.fragments(Channel::Weights, &caches.weights, |weight, out| {
                codec::write_float(*weight, WEIGHT_PRECISION, out)
            })?;
        }
        if caches.set.contains(Cache::TRECNO) {
            writer.fragments(Channel::TrecnoOffsets, &caches.trecno_offsets, |offset, out| {
                codec::write_vbyte(*offset, out)
            })?;
            writer.fragment_bytes(Channel::Trecnos, &caches.trecnos)?;
        }
        if caches.set.contains(Cache::LOCATION) {
            writer.fragments(
                Channel::LocationOffsets,
                &caches.location_offsets,
                |offset, out| codec::write_vbyte(*offset, out),
            )?;
            writer.fragment_bytes(Channel::Locations, &caches.locations)?;
            writer.fragments(
                Channel::MimeExceptions,
                &caches.mime_exceptions,
                |(docno, mime), out| {
                    codec::write_vbyte(*docno, out);
                    codec::write_vbyte(mime.ordinal() as u64, out);
                },
            )?;
        }
        writer.fragments(Channel::ReposRecords, self.reposset.records(), |record, out| {
            codec::write_vbyte(((record.reposno as u64) << 1) | record.kind.bit(), out);
            codec::write_vbyte(record.docno, out);
            codec::write_vbyte(record.quantity, out);
        })?;
        writer.fragments(
            Channel::ReposCheckpoints,
            self.reposset.checkpoints(),
            |checkpoint, out| {
                codec::write_vbyte(checkpoint.reposno as u64, out);
                codec::write_vbyte(checkpoint.offset, out);
                codec::write_vbyte(checkpoint.compression.mime().ordinal() as u64, out);
            },
        )?;
        let end = writer.finish()?;

        // Drop pages left over from an earlier save, then sync every file
        let files = &self.pages.files;
        let last = files.fileno(end - 1)?;
        let len = ((end - 1) % files.pages_per_file() + 1) * page_size as u64;
        files.pin(last)?.resize(len)?;
        for fileno in last + 1.. {
            match files.storage().unlink(files.partition(), fileno) {
                Ok(()) => debug!(fileno, "removed stale file"),
                Err(storage::Error::FileMissing(_, _)) => break,
                Err(err) => return Err(err.into()),
            }
        }
        for fileno in 0..=last {
            files.pin(fileno)?.sync()?;
        }

        self.dirty = false;
        self.metrics.saves.inc();
        debug!(
            entries,
            data_pages,
            cache_pages = end - data_pages,
            "saved docmap"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Storage as MemoryStorage;
    use commonware_macros::test_traced;
    use prometheus_client::metrics::counter::Counter;

    const PAGE_SIZE: usize = 64;

    fn files() -> Files<MemoryStorage> {
        Files::new(
            MemoryStorage::default(),
            "persist".into(),
            PAGE_SIZE,
            1024,
            Counter::default(),
            Counter::default(),
        )
    }

    fn read_back(files: &Files<MemoryStorage>, first: u64, end: u64) -> Restored {
        let mut restored = Restored::default();
        let mut page = vec![0; PAGE_SIZE];
        for index in first..end {
            assert_eq!(files.read(index, &mut page).unwrap(), 1);
            let expected = if index == end - 1 {
                FINAL_CACHE_TAG
            } else {
                CACHE_TAG
            };
            assert_eq!(page[0], expected);
            let mut buf = &page[1..];
            assert_eq!(codec::read_vbyte(&mut buf).unwrap(), 7);
            assert_eq!(codec::read_vbyte(&mut buf).unwrap(), first);
            restored.read_page(buf).unwrap();
        }
        restored
    }

    #[test_traced]
    fn test_fragments_split_across_pages() {
        let files = files();
        let mut buf = vec![0; 2 * PAGE_SIZE];
        let page_index: Vec<u64> = (0..100).map(|i| i * 1000).collect();
        let bytes: Vec<u8> = (0..=255).collect();

        let mut writer = Writer::new(&files, &mut buf, 3, 7);
        writer.aggregates(&Aggregates::default()).unwrap();
        writer
            .fragments(Channel::PageIndex, &page_index, |first, out| {
                codec::write_vbyte(*first, out)
            })
            .unwrap();
        writer.fragment_bytes(Channel::Trecnos, &bytes).unwrap();
        writer
            .fragments(Channel::Words, &[] as &[u32], |words, out| {
                codec::write_vbyte(*words as u64, out)
            })
            .unwrap();
        let end = writer.finish().unwrap();
        assert!(end > 3 + 4);

        let restored = read_back(&files, 3, end);
        assert_eq!(restored.page_index, page_index);
        assert_eq!(restored.caches.trecnos, bytes);
        assert_eq!(restored.total(Channel::Words), Some(0));
        assert_eq!(restored.total(Channel::PageIndex), Some(100));
        assert_eq!(restored.aggregates, Some([0.0; 5]));
        assert_eq!(restored.total(Channel::Weights), None);
    }

    #[test_traced]
    fn test_record_read() {
        let mut buf = Vec::new();
        fragment_header(Channel::Weights, 9, 4, 2, &mut buf);
        buf.put_u8(END_ID);
        let mut cursor = &buf[..];
        assert_eq!(
            Record::read(&mut cursor).unwrap(),
            Record::Fragment {
                channel: Channel::Weights,
                total: 9,
                start: 4,
                count: 2
            }
        );
        assert_eq!(Record::read(&mut cursor).unwrap(), Record::End);

        // Unknown identifiers are rejected
        let mut cursor = &[0x05u8][..];
        assert!(matches!(Record::read(&mut cursor), Err(Error::Corrupt(_))));

        // Truncated counts are rejected
        let mut cursor = &[0x03u8, 1, 0, 0][..];
        assert!(matches!(
            Record::read(&mut cursor),
            Err(Error::Codec(codec::Error::EndOfBuffer))
        ));
    }

    #[test_traced]
    fn test_out_of_order_fragment() {
        let mut buf = Vec::new();
        fragment_header(Channel::PageIndex, 4, 2, 1, &mut buf);
        codec::write_vbyte(7, &mut buf);
        buf.put_u8(END_ID);

        let mut restored = Restored::default();
        assert!(matches!(restored.read_page(&buf), Err(Error::Corrupt(_))));
    }

    #[test_traced]
    fn test_validate() {
        let mut restored = Restored::default();
        restored.aggregates = Some([0.0; 5]);
        restored.page_index = vec![0, 3];
        restored.reposset.append(0).unwrap();
        restored.reposset.append_docno(1, 4).unwrap();
        restored.fills[Channel::PageIndex as usize] = Some((2, 2));
        restored.fills[Channel::ReposRecords as usize] = Some((1, 1));
        restored.fills[Channel::ReposCheckpoints as usize] = Some((0, 0));
        restored.caches.words = vec![1; 5];
        restored.fills[Channel::Words as usize] = Some((5, 5));
        assert_eq!(restored.validate(5, 2).unwrap(), Cache::WORDS);

        // Wrong number of data pages
        assert!(restored.validate(5, 3).is_err());

        // Repositories must cover every entry
        assert!(restored.validate(6, 2).is_err());

        // Incomplete channels are rejected
        restored.fills[Channel::Words as usize] = Some((5, 4));
        assert!(restored.validate(5, 2).is_err());
    }
}
