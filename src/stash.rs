// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side stash.
//!
//! An insertion-ordered sequence of blocks that are not currently resident
//! in the tree. The queue relies on this ordering for its FIFO discipline;
//! the eviction sort is stable so that order survives among blocks of equal
//! priority.

use crate::bucket::OramBlock;
use crate::{Leaf, TreeHeight};

#[derive(Debug)]
pub(crate) struct Stash<B> {
    blocks: Vec<B>,
}

/// Depth of the common ancestor of the root-to-`a` and root-to-`b` paths.
/// Leaves agreeing on their top bits share a deeper ancestor.
fn common_ancestor_depth(a: Leaf, b: Leaf, height: TreeHeight) -> u32 {
    let diff = a ^ b;
    if diff == 0 {
        u32::from(height)
    } else {
        u32::from(height) - 1 - diff.ilog2()
    }
}

impl<B: OramBlock> Stash<B> {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: B) {
        self.blocks.push(block);
    }

    pub fn extend(&mut self, blocks: Vec<B>) {
        self.blocks.extend(blocks);
    }

    pub fn iter(&self) -> impl Iterator<Item = &B> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut B> {
        self.blocks.iter_mut()
    }

    pub fn front(&self) -> Option<&B> {
        self.blocks.first()
    }

    pub fn pop_front(&mut self) -> Option<B> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(self.blocks.remove(0))
        }
    }

    pub fn position<P: FnMut(&B) -> bool>(&self, predicate: P) -> Option<usize> {
        self.blocks.iter().position(predicate)
    }

    pub fn remove(&mut self, index: usize) -> B {
        self.blocks.remove(index)
    }

    pub fn retain<P: FnMut(&B) -> bool>(&mut self, predicate: P) {
        self.blocks.retain(predicate);
    }

    /// Increments every block's eviction-attempt counter by one.
    pub fn bump_attempts(&mut self) {
        for block in &mut self.blocks {
            block.set_attempts(block.attempts().saturating_add(1));
        }
    }

    /// Orders the stash for eviction: high-priority blocks first, then
    /// least-attempted, then blocks whose leaf shares the deepest ancestor
    /// with `target` (those can fill the buckets only one path serves).
    ///
    /// The sort is stable, so insertion order breaks ties.
    pub fn sort_by_policy(&mut self, target: Option<Leaf>, height: TreeHeight) {
        self.blocks.sort_by(|a, b| {
            b.is_high_priority()
                .cmp(&a.is_high_priority())
                .then(a.attempts().cmp(&b.attempts()))
                .then_with(|| match target {
                    Some(leaf) => common_ancestor_depth(b.leaf(), leaf, height)
                        .cmp(&common_ancestor_depth(a.leaf(), leaf, height)),
                    None => std::cmp::Ordering::Equal,
                })
        });
    }

    /// Restores arrival order after a path drain interleaved older tree
    /// blocks behind newer stashed ones. Used by the queue before eviction
    /// so the oldest blocks claim the most widely shared buckets.
    pub fn sort_by_age(&mut self) {
        self.blocks.sort_by_key(|block| block.age());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{MapBlock, QueueBlock};

    #[test]
    fn common_ancestor_depths() {
        // Height 3: leaves 0..8, leaf nodes at depth 3.
        assert_eq!(common_ancestor_depth(0, 0, 3), 3);
        assert_eq!(common_ancestor_depth(0, 1, 3), 2);
        assert_eq!(common_ancestor_depth(0, 2, 3), 1);
        assert_eq!(common_ancestor_depth(0, 4, 3), 0);
        assert_eq!(common_ancestor_depth(5, 7, 3), 1);
    }

    #[test]
    fn policy_sort_priority_then_attempts() {
        let mut stash = Stash::new();
        let mut ordinary = MapBlock::new("b".to_string(), vec![], 0, false);
        ordinary.attempts = 1;
        let mut stuck = MapBlock::new("c".to_string(), vec![], 0, false);
        stuck.attempts = 5;
        let mut protected = MapBlock::new("/a".to_string(), vec![], 0, true);
        protected.attempts = 9;

        stash.push(stuck);
        stash.push(ordinary);
        stash.push(protected);
        stash.sort_by_policy(None, 3);

        let keys: Vec<_> = stash.iter().map(|b| b.key.clone()).collect();
        assert_eq!(keys, vec!["/a", "b", "c"]);
    }

    #[test]
    fn policy_sort_prefers_deep_placements() {
        let mut stash = Stash::new();
        stash.push(MapBlock::new("far".to_string(), vec![], 4, false));
        stash.push(MapBlock::new("near".to_string(), vec![], 1, false));
        // Target leaf 0: leaf 1 shares the depth-2 ancestor, leaf 4 only the
        // root.
        stash.sort_by_policy(Some(0), 3);
        let keys: Vec<_> = stash.iter().map(|b| b.key.clone()).collect();
        assert_eq!(keys, vec!["near", "far"]);
    }

    #[test]
    fn age_sort_restores_arrival_order() {
        let mut stash = Stash::new();
        for seq in [3u64, 0, 4, 1, 2] {
            stash.push(QueueBlock::new(vec![seq as u8], 0, seq));
        }
        stash.bump_attempts();
        stash.sort_by_age();
        let order: Vec<_> = stash.iter().map(|b| b.seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(stash.front().unwrap().seq, 0);
        assert_eq!(stash.pop_front().unwrap().seq, 0);
        assert_eq!(stash.front().unwrap().seq, 1);
    }
}
