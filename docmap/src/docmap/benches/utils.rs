//! Helpers shared by [DocMap] benchmarks.

use docmap::{storage::memory::Storage, Cache, Config, DocMap, Document, Mime};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::num::{NonZeroU64, NonZeroUsize};

/// Size of each page.
const PAGE_SIZE: usize = 4096;

/// Pages held in memory.
const BUFFER_PAGES: usize = 16;

/// Documents in a repository.
const REPOSITORY_SIZE: u64 = 1_000;

pub type DocMapType = DocMap<Storage>;

pub fn config(cache: Cache) -> Config {
    Config {
        partition: "docmap_bench".into(),
        page_size: NonZeroUsize::new(PAGE_SIZE).unwrap(),
        buffer_pages: NonZeroUsize::new(BUFFER_PAGES).unwrap(),
        max_file_size: NonZeroU64::new(1 << 26).unwrap(),
        cache,
    }
}

pub fn init(storage: Storage, cache: Cache) -> DocMapType {
    DocMap::new(storage, &mut Registry::default(), config(cache)).unwrap()
}

/// Append `count` random documents, grouped into repositories of [REPOSITORY_SIZE].
pub fn append_random(docmap: &mut DocMapType, count: u64) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut offset = 0;
    for docno in 0..count {
        if docno % REPOSITORY_SIZE == 0 {
            offset = 0;
        }
        let bytes = rng.gen_range(256..65_536);
        let words = rng.gen_range(16..=bytes / 4);
        let trecno = format!("WSJ{:06}-{:04}", docno / 100, docno % 100);
        docmap
            .add(&Document {
                fileno: (docno / REPOSITORY_SIZE) as u32,
                offset,
                bytes,
                words,
                distinct_words: words / 3,
                weight: rng.gen_range(0.0..10.0),
                trecno: trecno.as_bytes(),
                mime: if rng.gen_bool(0.05) {
                    Mime::TEXT_HTML
                } else {
                    Mime::default()
                },
                ..Default::default()
            })
            .unwrap();
        offset += bytes as u64;
    }
}
