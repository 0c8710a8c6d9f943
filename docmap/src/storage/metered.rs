//! A [Storage](super::Storage) wrapper that counts file I/O.

use super::Error;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// I/O counters shared by every handle of a [Storage].
pub struct Metrics {
    /// Handles currently held.
    pub pinned_files: Gauge,
    pub storage_reads: Counter,
    pub storage_read_bytes: Counter,
    pub storage_writes: Counter,
    pub storage_write_bytes: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            pinned_files: Gauge::default(),
            storage_reads: Counter::default(),
            storage_read_bytes: Counter::default(),
            storage_writes: Counter::default(),
            storage_write_bytes: Counter::default(),
        };
        for (name, help, counter) in [
            ("storage_reads", "Number of positional reads", &metrics.storage_reads),
            ("storage_read_bytes", "Bytes returned by reads", &metrics.storage_read_bytes),
            ("storage_writes", "Number of positional writes", &metrics.storage_writes),
            ("storage_write_bytes", "Bytes passed to writes", &metrics.storage_write_bytes),
        ] {
            registry.register(name, help, counter.clone());
        }
        registry.register(
            "pinned_files",
            "Number of file handles held",
            metrics.pinned_files.clone(),
        );
        metrics
    }
}

/// Counts reads, writes and held handles of the wrapped storage.
#[derive(Clone)]
pub struct Storage<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S> Storage<S> {
    pub fn new(inner: S, registry: &mut Registry) -> Self {
        Self {
            inner,
            metrics: Metrics::new(registry).into(),
        }
    }
}

impl<S: super::Storage> super::Storage for Storage<S> {
    type Blob = Blob<S::Blob>;

    fn pin(&self, partition: &str, fileno: u32) -> Result<Self::Blob, Error> {
        let inner = self.inner.pin(partition, fileno)?;
        Ok(Blob::new(inner, self.metrics.clone()))
    }

    fn create(&self, partition: &str, fileno: u32) -> Result<Self::Blob, Error> {
        let inner = self.inner.create(partition, fileno)?;
        Ok(Blob::new(inner, self.metrics.clone()))
    }

    fn unlink(&self, partition: &str, fileno: u32) -> Result<(), Error> {
        self.inner.unlink(partition, fileno)
    }
}

/// A handle counted in [Metrics::pinned_files] until dropped.
pub struct Blob<B> {
    inner: B,
    metrics: Arc<Metrics>,
}

impl<B> Blob<B> {
    fn new(inner: B, metrics: Arc<Metrics>) -> Self {
        metrics.pinned_files.inc();
        Self { inner, metrics }
    }
}

impl<B> Drop for Blob<B> {
    fn drop(&mut self) {
        self.metrics.pinned_files.dec();
    }
}

impl<B: super::Blob> super::Blob for Blob<B> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let read = self.inner.read_at(buf, offset)?;
        self.metrics.storage_reads.inc();
        self.metrics.storage_read_bytes.inc_by(read as u64);
        Ok(read)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.inner.write_at(buf, offset)?;
        self.metrics.storage_writes.inc();
        self.metrics.storage_write_bytes.inc_by(buf.len() as u64);
        Ok(())
    }

    fn len(&self) -> Result<u64, Error> {
        self.inner.len()
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        self.inner.resize(len)
    }

    fn sync(&self) -> Result<(), Error> {
        self.inner.sync()
    }
}
