//! Fixed-memory page buffering shared between reading and appending.

use super::{entry::Entry, Error, DATA_HEADER_SIZE, DATA_TAG, FINAL_DATA_TAG};
use crate::{
    codec,
    storage::{self, Blob as _, Storage},
};
use prometheus_client::metrics::counter::Counter;
use tracing::{debug, trace};

/// Numbered page files of a partition.
pub(super) struct Files<S: Storage> {
    storage: S,
    partition: String,
    page_size: usize,
    pages_per_file: u64,

    page_reads: Counter,
    page_writes: Counter,
}

impl<S: Storage> Files<S> {
    pub fn new(
        storage: S,
        partition: String,
        page_size: usize,
        pages_per_file: u64,
        page_reads: Counter,
        page_writes: Counter,
    ) -> Self {
        Self {
            storage,
            partition,
            page_size,
            pages_per_file,
            page_reads,
            page_writes,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages_per_file(&self) -> u64 {
        self.pages_per_file
    }

    /// File holding `page`.
    pub fn fileno(&self, page: u64) -> Result<u32, Error> {
        u32::try_from(page / self.pages_per_file)
            .map_err(|_| Error::Storage(storage::Error::OffsetOverflow))
    }

    /// File and byte offset of `page`.
    fn locate(&self, page: u64) -> Result<(u32, u64), Error> {
        let offset = (page % self.pages_per_file) * self.page_size as u64;
        Ok((self.fileno(page)?, offset))
    }

    pub fn pin(&self, fileno: u32) -> Result<S::Blob, Error> {
        Ok(self.storage.pin(&self.partition, fileno)?)
    }

    /// Pin `fileno`, creating it if it does not exist yet.
    fn open(&self, fileno: u32) -> Result<S::Blob, Error> {
        match self.storage.pin(&self.partition, fileno) {
            Err(storage::Error::FileMissing(_, _)) => {
                debug!(fileno, "provisioned file");
                Ok(self.storage.create(&self.partition, fileno)?)
            }
            result => Ok(result?),
        }
    }

    /// Create `fileno` if it does not exist yet.
    pub fn provision(&self, fileno: u32) -> Result<(), Error> {
        match self.storage.create(&self.partition, fileno) {
            Ok(_) => {
                debug!(fileno, "provisioned file");
                Ok(())
            }
            Err(storage::Error::FileExists(_, _)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read consecutive pages starting at `page` into `buf`, stopping at the end of the
    /// file holding `page`. Returns the number of complete pages read.
    pub fn read(&self, page: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let (fileno, offset) = self.locate(page)?;
        let in_file = (self.pages_per_file - page % self.pages_per_file) as usize;
        let len = buf.len().min(in_file * self.page_size);
        let blob = self.pin(fileno)?;
        let read = blob.read_at(&mut buf[..len], offset)? / self.page_size;
        self.page_reads.inc_by(read as u64);
        Ok(read)
    }

    /// Write `buf`, a whole number of pages, starting at `page`.
    pub fn write(&self, mut page: u64, mut buf: &[u8]) -> Result<(), Error> {
        debug_assert_eq!(buf.len() % self.page_size, 0);
        while !buf.is_empty() {
            let (fileno, offset) = self.locate(page)?;
            let in_file = (self.pages_per_file - page % self.pages_per_file) as usize;
            let count = in_file.min(buf.len() / self.page_size);
            let (head, tail) = buf.split_at(count * self.page_size);
            self.open(fileno)?.write_at(head, offset)?;
            self.page_writes.inc_by(count as u64);
            page += count as u64;
            buf = tail;
        }
        Ok(())
    }
}

/// Identifies one of the two windows sharing the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum WindowId {
    Read,
    Append,
}

/// A run of arena slots holding consecutive pages.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct Window {
    /// First arena slot owned by the window.
    pub first: usize,
    /// Number of slots owned by the window.
    pub capacity: usize,
    /// Page held in the first slot.
    pub page: u64,
    /// Number of slots holding a page.
    pub len: usize,
    /// Whether any held page differs from its copy on disk.
    pub dirty: bool,
}

impl Window {
    pub fn contains(&self, page: u64) -> bool {
        page >= self.page && page - self.page < self.len as u64
    }

    /// One past the last page held.
    pub fn end(&self) -> u64 {
        self.page + self.len as u64
    }

    fn slot(&self, page: u64) -> usize {
        self.first + (page - self.page) as usize
    }
}

/// The arena and the two windows over it.
///
/// The append window owns slots `[0, append.capacity)` and the read window owns the rest.
pub(super) struct Pages<S: Storage> {
    pub files: Files<S>,
    arena: Vec<u8>,
    pub read: Window,
    pub append: Window,
}

impl<S: Storage> Pages<S> {
    pub fn new(files: Files<S>, buffer_pages: usize) -> Result<Self, Error> {
        let len = files
            .page_size()
            .checked_mul(buffer_pages)
            .ok_or(Error::InvalidConfig("buffer is too large"))?;
        let mut arena = Vec::new();
        arena.try_reserve_exact(len)?;
        arena.resize(len, 0);
        Ok(Self {
            files,
            arena,
            read: Window {
                capacity: buffer_pages,
                ..Default::default()
            },
            append: Window::default(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.files.page_size()
    }

    fn slots(&self) -> usize {
        self.arena.len() / self.page_size()
    }

    pub fn window(&self, id: WindowId) -> &Window {
        match id {
            WindowId::Read => &self.read,
            WindowId::Append => &self.append,
        }
    }

    /// Window holding `page`, preferring the append window whose copy is authoritative.
    pub fn locate(&self, page: u64) -> Option<WindowId> {
        if self.append.contains(page) {
            Some(WindowId::Append)
        } else if self.read.contains(page) {
            Some(WindowId::Read)
        } else {
            None
        }
    }

    /// Contents of `page`, which must be held by window `id`.
    pub fn page(&self, id: WindowId, page: u64) -> &[u8] {
        let start = self.window(id).slot(page) * self.page_size();
        &self.arena[start..start + self.page_size()]
    }

    pub fn page_mut(&mut self, id: WindowId, page: u64) -> &mut [u8] {
        let start = self.window(id).slot(page) * self.page_size();
        let end = start + self.page_size();
        &mut self.arena[start..end]
    }

    /// Pages held by the append window.
    pub fn append_pages(&self) -> &[u8] {
        let ps = self.page_size();
        &self.arena[self.append.first * ps..(self.append.first + self.append.len) * ps]
    }

    /// Move the first slot of the read window to the end of the append window.
    ///
    /// The read window must own at least two slots.
    pub fn steal(&mut self) {
        debug_assert!(self.read.capacity > 1);
        debug_assert_eq!(self.read.first, self.append.capacity);
        self.read.first += 1;
        self.read.capacity -= 1;
        if self.read.len > 0 {
            self.read.len -= 1;
            self.read.page += 1;
        }
        self.append.capacity += 1;
    }

    /// Return every slot to the read window. The append window must be committed.
    pub fn reclaim(&mut self) {
        debug_assert!(!self.append.dirty);
        self.append.page += self.append.len as u64;
        self.append.len = 0;
        self.append.capacity = 0;
        self.read = Window {
            capacity: self.slots(),
            ..Default::default()
        };
    }

    /// Ensure `page` is held by a window, reading it (and the pages following it, up to
    /// `limit`) into the read window if needed.
    pub fn page_in(&mut self, page: u64, limit: u64) -> Result<WindowId, Error> {
        if let Some(id) = self.locate(page) {
            return Ok(id);
        }
        debug_assert!(page < limit);

        let ps = self.page_size();
        let count = self.read.capacity.min((limit - page) as usize);
        let start = self.read.first * ps;
        self.read.len = 0;
        let read = self
            .files
            .read(page, &mut self.arena[start..start + count * ps])?;
        if read == 0 {
            return Err(Error::Corrupt(format!("page {page} is missing")));
        }
        trace!(page, pages = read, "paged in");
        self.read.page = page;
        self.read.len = read;
        Ok(WindowId::Read)
    }

    /// Read `page` into a slot taken from the read window, making it the only page of the
    /// append window.
    pub fn load_append(&mut self, page: u64) -> Result<(), Error> {
        debug_assert_eq!(self.append.capacity, 0);
        self.steal();
        let start = self.append.first * self.page_size();
        let end = start + self.page_size();
        if self.files.read(page, &mut self.arena[start..end])? != 1 {
            return Err(Error::Corrupt(format!("page {page} is missing")));
        }
        self.append.page = page;
        self.append.len = 1;
        Ok(())
    }

    /// Write the append window to disk, if dirty.
    pub fn commit_append(&mut self) -> Result<(), Error> {
        if !self.append.dirty {
            return Ok(());
        }
        self.files.write(self.append.page, self.append_pages())?;
        self.append.dirty = false;
        Ok(())
    }

    /// Hand out the read window as scratch space, dropping the pages it held.
    pub fn scratch(&mut self) -> (&Files<S>, &mut [u8]) {
        self.read.len = 0;
        let start = self.read.first * self.files.page_size();
        (&self.files, &mut self.arena[start..])
    }
}

/// A decode position within a resident page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Position {
    pub window: WindowId,
    pub page: u64,
    /// Byte offset of the next entry within the page.
    pub pos: usize,
}

/// A forward-only decoder over the entries of a page.
#[derive(Clone, Debug, Default)]
pub(super) struct Cursor {
    /// `None` once the page the cursor referenced has left its window.
    pub position: Option<Position>,
    /// Last entry decoded (or written).
    pub entry: Entry,
    /// First docno on the page.
    pub first_docno: u64,
    /// One past the last docno on the page.
    pub end_docno: u64,
    /// Entries consumed so far.
    pub past: u32,
    /// Entries on the page.
    pub entries: u32,
}

impl Cursor {
    /// Invalidate the cursor if its page is no longer held by its window.
    pub fn check<S: Storage>(&mut self, pages: &Pages<S>) {
        if let Some(position) = self.position {
            if !pages.window(position.window).contains(position.page) {
                self.position = None;
            }
        }
    }

    /// Position the cursor before the first entry of `page`, held by window `id`.
    pub fn reset<S: Storage>(
        &mut self,
        pages: &Pages<S>,
        id: WindowId,
        page: u64,
        first_docno: u64,
        end_docno: u64,
    ) -> Result<(), Error> {
        let bytes = pages.page(id, page);
        if bytes[0] != DATA_TAG && bytes[0] != FINAL_DATA_TAG {
            return Err(Error::InvalidTag(page, bytes[0]));
        }
        self.entries = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        self.position = Some(Position {
            window: id,
            page,
            pos: DATA_HEADER_SIZE,
        });
        self.entry.reset();
        self.first_docno = first_docno;
        self.end_docno = end_docno;
        self.past = 0;
        Ok(())
    }

    /// Whether `docno` lies on the page the cursor is positioned on.
    pub fn covers(&self, docno: u64) -> bool {
        self.position.is_some() && docno >= self.first_docno && docno < self.end_docno
    }

    /// Decode the next entry of the page.
    ///
    /// Returns [codec::Error::EndOfBuffer] once every entry of the page has been consumed.
    pub fn advance<S: Storage>(&mut self, pages: &Pages<S>) -> Result<(), Error> {
        let Some(position) = self.position.as_mut() else {
            return Err(Error::Corrupt("cursor is not positioned".into()));
        };
        if self.past >= self.entries {
            return Err(Error::CorruptPage(position.page, codec::Error::EndOfBuffer));
        }
        let page = pages.page(position.window, position.page);
        let mut buf = page
            .get(position.pos..)
            .ok_or(Error::CorruptPage(position.page, codec::Error::EndOfBuffer))?;
        let before = buf.len();
        self.entry
            .decode_next(&mut buf)
            .map_err(|err| Error::CorruptPage(position.page, err))?;
        position.pos += before - buf.len();
        self.past += 1;
        Ok(())
    }
}
