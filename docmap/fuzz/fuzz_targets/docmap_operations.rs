#![no_main]

use arbitrary::Arbitrary;
use docmap::{storage::memory::Storage, Cache, Config, DocMap, Document, Error, Location, Mime};
use libfuzzer_sys::fuzz_target;
use prometheus_client::registry::Registry;
use std::num::{NonZeroU64, NonZeroUsize};

#[derive(Arbitrary, Debug, Clone)]
enum DocMapOperation {
    Add {
        open: bool,
        compressed: bool,
        bytes: u16,
        words: u16,
        distinct_words: u16,
        weight: u16,
        trecno: Vec<u8>,
        html: bool,
    },
    Get { docno: u64 },
    GetFields { docno: u64 },
    SetCache { cache: u8, reread: bool },
    Save,
    Reload { cache: u8 },
    Verify,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    page_size: u8,
    buffer_pages: u8,
    pages_per_file: u8,
    operations: Vec<DocMapOperation>,
}

/// A document as recorded by the model.
struct Expected {
    location: Location,
    words: u32,
    distinct_words: u32,
    trecno: Vec<u8>,
}

fn cache(bits: u8) -> Cache {
    [
        Cache::TRECNO,
        Cache::LOCATION,
        Cache::WORDS,
        Cache::DISTINCT_WORDS,
        Cache::WEIGHT,
    ]
    .into_iter()
    .enumerate()
    .filter(|(i, _)| bits & (1 << i) != 0)
    .fold(Cache::NONE, |set, (_, field)| set | field)
}

fn fuzz(input: FuzzInput) {
    let page_size = 64 + input.page_size as usize * 4;
    let cfg = Config {
        partition: "docmap_operations_fuzz_test".into(),
        page_size: NonZeroUsize::new(page_size).unwrap(),
        buffer_pages: NonZeroUsize::new(2 + input.buffer_pages as usize % 6).unwrap(),
        max_file_size: NonZeroU64::new((1 + input.pages_per_file as u64) * page_size as u64)
            .unwrap(),
        cache: Cache::NONE,
    };
    let storage = Storage::default();
    let mut docmap = DocMap::new(storage.clone(), &mut Registry::default(), cfg.clone()).unwrap();
    let mut expected: Vec<Expected> = Vec::new();
    let mut repositories = 0;

    for op in input.operations.iter() {
        match op {
            DocMapOperation::Add {
                open,
                compressed,
                bytes,
                words,
                distinct_words,
                weight,
                trecno,
                html,
            } => {
                let bytes = (*bytes as u32).max(1);
                let words = (*words as u32).min(bytes.div_ceil(2));
                let distinct_words = (*distinct_words as u32).min(words);
                let mime = if *html {
                    Mime::TEXT_HTML
                } else {
                    Mime::default()
                };
                let (fileno, offset, compressed) = match expected.last() {
                    Some(prev) if !open => (
                        prev.location.fileno,
                        prev.location.offset + prev.location.bytes as u64,
                        prev.location.compressed,
                    ),
                    _ => (repositories, 0, *compressed),
                };
                let trecno = &trecno[..trecno.len().min(32)];
                let doc = Document {
                    fileno,
                    offset,
                    bytes,
                    compressed,
                    words,
                    distinct_words,
                    weight: *weight as f32 / 16.0,
                    trecno,
                    mime,
                };
                match docmap.add(&doc) {
                    Ok(docno) => {
                        assert_eq!(docno, expected.len() as u64);
                        if offset == 0 {
                            repositories += 1;
                        }
                        expected.push(Expected {
                            location: Location {
                                fileno,
                                offset,
                                bytes,
                                mime,
                                compressed,
                            },
                            words,
                            distinct_words,
                            trecno: trecno.to_vec(),
                        });
                    }
                    Err(Error::EntryTooLarge(_, _)) => {}
                    Err(err) => panic!("add failed: {err}"),
                }
            }

            DocMapOperation::Get { docno } => {
                let docno = docno % (expected.len() as u64 + 1);
                match expected.get(docno as usize) {
                    Some(doc) => {
                        let entry = docmap.get(docno).unwrap();
                        assert_eq!(entry.location(), doc.location);
                        assert_eq!(entry.words, doc.words);
                        assert_eq!(entry.distinct_words, doc.distinct_words);
                        assert_eq!(entry.trecno, doc.trecno);
                    }
                    None => assert!(docmap.get(docno).is_err()),
                }
            }

            DocMapOperation::GetFields { docno } => {
                if expected.is_empty() {
                    continue;
                }
                let docno = docno % expected.len() as u64;
                let doc = &expected[docno as usize];
                assert_eq!(docmap.get_location(docno).unwrap(), doc.location);
                assert_eq!(docmap.get_bytes(docno).unwrap(), doc.location.bytes);
                assert_eq!(docmap.get_words(docno).unwrap(), doc.words);
                assert_eq!(docmap.get_distinct_words(docno).unwrap(), doc.distinct_words);
                assert_eq!(docmap.get_trecno(docno).unwrap(), doc.trecno);
                assert_eq!(
                    docmap.get_weight(docno).unwrap(),
                    docmap.get(docno).unwrap().weight
                );
                assert_eq!(docmap.reposno(docno).unwrap(), doc.location.fileno);
            }

            DocMapOperation::SetCache { cache: bits, reread } => {
                docmap.cache(cache(*bits), *reread).unwrap();
                assert_eq!(docmap.cached(), cache(*bits));
            }

            DocMapOperation::Save => {
                docmap.save().unwrap();
            }

            DocMapOperation::Reload { cache: bits } => {
                docmap.save().unwrap();
                drop(docmap);
                let cfg = Config {
                    cache: cache(*bits),
                    ..cfg.clone()
                };
                docmap = DocMap::load(storage.clone(), &mut Registry::default(), cfg).unwrap();
                assert_eq!(docmap.entries(), expected.len() as u64);
                assert_eq!(docmap.cached(), cache(*bits));
            }

            DocMapOperation::Verify => {
                docmap.verify().unwrap();
            }
        }
    }

    docmap.verify().unwrap();
    docmap.destroy().unwrap();
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
