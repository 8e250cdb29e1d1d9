//! Blocks whose parent has not arrived yet.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::block::Block;
use crate::types::Hash;

/// Bounded by count; the oldest orphan goes first.
#[derive(Debug)]
pub struct OrphanPool {
    max: usize,
    blocks: HashMap<Hash, Block>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    order: VecDeque<Hash>,
}

impl OrphanPool {
    pub fn new(max: usize) -> Self {
        Self { max, blocks: HashMap::new(), by_parent: HashMap::new(), order: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Returns the hashes dropped to stay within bounds.
    pub fn insert(&mut self, block: Block) -> Vec<Hash> {
        if self.max == 0 || self.blocks.contains_key(&block.hash) {
            return Vec::new();
        }
        // orphans always have a parent
        let parent = match block.parent() {
            Some(p) => p,
            None => return Vec::new(),
        };
        self.by_parent.entry(parent).or_default().push(block.hash);
        self.order.push_back(block.hash);
        self.blocks.insert(block.hash, block);

        let mut dropped = Vec::new();
        while self.blocks.len() > self.max {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.remove(&oldest).is_some() {
                        dropped.push(oldest);
                    }
                }
                None => break,
            }
        }
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "orphan pool full, oldest dropped");
        }
        dropped
    }

    /// Remove and return every orphan waiting on `parent`.
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let hashes = self.by_parent.remove(parent).unwrap_or_default();
        let mut children = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(block) = self.blocks.remove(&hash) {
                self.order.retain(|h| *h != hash);
                children.push(block);
            }
        }
        children
    }

    fn remove(&mut self, hash: &Hash) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        if let Some(parent) = block.parent() {
            if let Some(siblings) = self.by_parent.get_mut(&parent) {
                siblings.retain(|h| h != hash);
                if siblings.is_empty() {
                    self.by_parent.remove(&parent);
                }
            }
        }
        Some(block)
    }
}
