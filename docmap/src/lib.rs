//! Persist and retrieve per-document metadata for a search engine.
//!
//! A [DocMap] records, for every document ingested by an index build, where its raw bytes live
//! (repository, offset and length), its external identifier, MIME type, word counts and
//! relevance weight. Entries are appended once, in document number order, and are then served
//! by point lookup, either by decoding compressed pages or from selectively enabled in-memory
//! caches.
//!
//! # Status
//!
//! `docmap` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod codec;
pub mod docmap;
pub mod mime;
pub mod reposset;
pub mod storage;

pub use docmap::{Aggregates, Cache, Config, DocMap, Document, Entry, Error, Location};
pub use mime::Mime;
