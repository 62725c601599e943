//! Common test utilities for s3packer integration tests

#![allow(dead_code)]

use std::io::{Cursor, Read};
use std::sync::Arc;

use s3packer::{EntryOrder, MemoryStore, Packer, PipelineConfig};

/// One decoded archive entry
#[derive(Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Packer over `store` with default tuning
pub fn packer(store: &Arc<MemoryStore>) -> Packer {
    packer_with(store, PipelineConfig::default())
}

/// Packer over `store` that writes entries in traversal order
pub fn ordered_packer(store: &Arc<MemoryStore>) -> Packer {
    packer_with(
        store,
        PipelineConfig {
            entry_order: EntryOrder::Enumeration,
            ..PipelineConfig::default()
        },
    )
}

pub fn packer_with(store: &Arc<MemoryStore>, config: PipelineConfig) -> Packer {
    Packer::new(store.clone(), config).expect("valid pipeline config")
}

/// Decode every entry of a zip archive, in archive order
pub fn read_entries(bytes: &[u8]) -> Vec<Entry> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("readable zip archive");
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).expect("entry by index");
            let mut data = Vec::new();
            file.read_to_end(&mut data).expect("entry content");
            Entry {
                name: file.name().to_string(),
                data,
            }
        })
        .collect()
}

/// Entry names of an archive, in archive order
pub fn entry_names(bytes: &[u8]) -> Vec<String> {
    read_entries(bytes).into_iter().map(|e| e.name).collect()
}

/// Deterministic, poorly compressible content of `len` bytes
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
