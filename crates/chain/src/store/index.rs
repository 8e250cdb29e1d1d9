//! In-memory mirror of the persistent block index.
//!
//! `by_height[h]` is the canonical hash at height `h`; `by_hash` holds every
//! stored block, canonical or not. Both lookups are O(1).

use std::collections::HashMap;

use tracing::info;

use crate::error::ConsistencyError;
use crate::storage::{BlockStorage, IndexEntry, StoredIndex};
use crate::types::Hash;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainIndex {
    by_height: Vec<Hash>,
    by_hash: HashMap<Hash, IndexEntry>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a persisted index after checking it.
    pub fn from_stored(stored: StoredIndex) -> Result<Self, ConsistencyError> {
        let index = Self {
            by_height: stored.canonical,
            by_hash: stored.entries.into_iter().map(|e| (e.hash, e)).collect(),
        };
        index.verify()?;
        Ok(index)
    }

    pub fn to_stored(&self) -> StoredIndex {
        let mut entries: Vec<IndexEntry> = self.by_hash.values().cloned().collect();
        entries.sort_by_key(|e| e.position);
        StoredIndex { entries, canonical: self.by_height.clone() }
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }

    /// Number of stored blocks, canonical or not.
    pub fn block_count(&self) -> usize {
        self.by_hash.len()
    }

    pub fn tip(&self) -> Option<(u64, Hash)> {
        let hash = *self.by_height.last()?;
        Some((self.by_height.len() as u64 - 1, hash))
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.tip().map(|(h, _)| h)
    }

    pub fn canonical_hash(&self, height: u64) -> Option<Hash> {
        self.by_height.get(height as usize).copied()
    }

    pub fn canonical_range(&self, from: u64, to: u64) -> &[Hash] {
        let len = self.by_height.len();
        let start = (from as usize).min(len);
        let end = (to as usize).saturating_add(1).min(len);
        if start >= end {
            return &[];
        }
        &self.by_height[start..end]
    }

    pub fn get(&self, hash: &Hash) -> Option<&IndexEntry> {
        self.by_hash.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn is_canonical(&self, height: u64, hash: &Hash) -> bool {
        self.canonical_hash(height) == Some(*hash)
    }

    pub fn insert(&mut self, entry: IndexEntry) {
        self.by_hash.insert(entry.hash, entry);
    }

    /// Mirror of `BlockStorage::write_canonical`.
    pub fn set_canonical_from(&mut self, from_height: u64, hashes: &[Hash]) {
        self.by_height.truncate(from_height as usize);
        self.by_height.extend_from_slice(hashes);
    }

    /// Walk back from `hash` to the first canonical ancestor.
    ///
    /// ## Returns
    /// The ancestor height and the non-canonical blocks above it, lowest
    /// first. `None` when the walk leaves the index.
    pub fn fork_point(&self, hash: &Hash) -> Option<(u64, Vec<Hash>)> {
        let mut branch = Vec::new();
        let mut cursor = *hash;
        loop {
            let entry = self.by_hash.get(&cursor)?;
            if self.is_canonical(entry.height, &cursor) {
                branch.reverse();
                return Some((entry.height, branch));
            }
            branch.push(cursor);
            cursor = entry.parent?;
        }
    }

    /// Canonical list must be a parent-linked chain of indexed blocks.
    pub fn verify(&self) -> Result<(), ConsistencyError> {
        let mut previous: Option<Hash> = None;
        for (height, hash) in self.by_height.iter().enumerate() {
            let entry = self.by_hash.get(hash).ok_or_else(|| {
                ConsistencyError::IndexCorrupted(format!("canonical block at {} not indexed", height))
            })?;
            if entry.height != height as u64 {
                return Err(ConsistencyError::IndexCorrupted(format!(
                    "entry {} claims height {}, found at {}",
                    hash.short(),
                    entry.height,
                    height
                )));
            }
            if entry.parent != previous {
                return Err(ConsistencyError::IndexCorrupted(format!("broken parent link at height {}", height)));
            }
            previous = Some(*hash);
        }
        Ok(())
    }

    /// Rebuild from the block log alone. Canonical is the longest rooted
    /// chain; at equal height the block appended first wins.
    pub fn rebuild(storage: &dyn BlockStorage) -> Result<StoredIndex, ConsistencyError> {
        let log_err = |e: String| ConsistencyError::LogCorrupted(e);
        let len = storage.log_len().map_err(|e| log_err(e.to_string()))?;

        let mut entries: Vec<IndexEntry> = Vec::new();
        let mut rooted: HashMap<Hash, IndexEntry> = HashMap::new();
        let mut best: Option<IndexEntry> = None;

        for position in 0..len {
            let block = storage
                .read_block(position)
                .map_err(|e| log_err(e.to_string()))?
                .ok_or_else(|| log_err(format!("record {} missing", position)))?;
            if block.header.compute_hash() != block.hash {
                return Err(log_err(format!("record {} fails its hash", position)));
            }
            if rooted.contains_key(&block.hash) {
                continue;
            }
            let entry = IndexEntry {
                hash: block.hash,
                height: block.height(),
                parent: block.parent(),
                position,
            };
            let connects = match &entry.parent {
                None => entry.height == 0 && !rooted.values().any(|e| e.height == 0),
                Some(p) => rooted.get(p).map(|pe| pe.height + 1 == entry.height).unwrap_or(false),
            };
            if !connects {
                continue;
            }
            if best.as_ref().map(|b| entry.height > b.height).unwrap_or(true) {
                best = Some(entry.clone());
            }
            rooted.insert(entry.hash, entry.clone());
            entries.push(entry);
        }

        let mut canonical = Vec::new();
        let mut cursor = best.map(|b| b.hash);
        while let Some(hash) = cursor {
            canonical.push(hash);
            cursor = rooted.get(&hash).and_then(|e| e.parent);
        }
        canonical.reverse();
        info!(blocks = entries.len(), tip = canonical.len(), "block index rebuilt from log");
        Ok(StoredIndex { entries, canonical })
    }
}
