// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The server-side bucket tree.
//!
//! A complete binary tree of fixed-capacity buckets, 1-indexed so that the
//! children of bucket `i` are `2i` and `2i + 1`. Leaf `ℓ ∈ [0, 2^H)` lives
//! at tree index `2^H + ℓ`, and the path from the root to that leaf has
//! `H + 1` buckets.

use crate::bucket::{Bucket, OramBlock};
use crate::{Leaf, TreeHeight, TreeIndex};

#[derive(Debug)]
pub(crate) struct BucketTree<B> {
    // buckets[0] is unused; 1-based indexing keeps the parent/child
    // arithmetic to shifts.
    buckets: Vec<Bucket<B>>,
    height: TreeHeight,
    reads: u64,
    writes: u64,
}

impl<B: OramBlock> BucketTree<B> {
    pub fn new(height: TreeHeight, bucket_capacity: usize) -> Self {
        assert!(height >= 1 && height <= 24, "tree height out of range");
        assert!(bucket_capacity >= 1, "bucket capacity must be positive");
        let node_count = (1usize << (height + 1)) - 1;
        let mut buckets = Vec::with_capacity(node_count + 1);
        buckets.resize_with(node_count + 1, || Bucket::new(bucket_capacity));
        Self {
            buckets,
            height,
            reads: 0,
            writes: 0,
        }
    }

    pub fn height(&self) -> TreeHeight {
        self.height
    }

    pub fn leaf_count(&self) -> u32 {
        1 << self.height
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len() - 1
    }

    fn leaf_node(&self, leaf: Leaf) -> TreeIndex {
        debug_assert!(leaf < self.leaf_count());
        self.leaf_count() + leaf
    }

    /// The bucket indices on the path from the root to `leaf`, root first.
    pub fn path(&self, leaf: Leaf) -> Vec<TreeIndex> {
        let node = self.leaf_node(leaf);
        let height = u32::from(self.height);
        (0..=height).map(|depth| node >> (height - depth)).collect()
    }

    /// Whether bucket `index` lies on the path from the root to `leaf`.
    pub fn on_path(&self, index: TreeIndex, leaf: Leaf) -> bool {
        let node = self.leaf_node(leaf);
        let depth = index.ilog2();
        node >> (u32::from(self.height) - depth) == index
    }

    /// The number of real blocks currently held by the buckets of `path`.
    pub fn valid_on_path(&self, path: &[TreeIndex]) -> usize {
        path.iter()
            .map(|&index| self.buckets[index as usize].valid_count())
            .sum()
    }

    /// Removes every real block along `path`, leaving dummies in place, and
    /// returns the blocks in root-to-leaf, slot order.
    pub fn drain_path(&mut self, path: &[TreeIndex]) -> Vec<B> {
        let mut drained = Vec::new();
        for &index in path {
            self.buckets[index as usize].drain_into(&mut drained);
            self.reads += 1;
        }
        drained
    }

    pub fn vacancies(&self, index: TreeIndex) -> usize {
        self.buckets[index as usize].vacancies()
    }

    /// Writes `block` into the first empty slot of bucket `index`. Returns
    /// whether it fit.
    pub fn place(&mut self, index: TreeIndex, block: B) -> bool {
        let placed = self.buckets[index as usize].place(block);
        if placed {
            self.writes += 1;
        }
        placed
    }

    /// The number of bucket drains performed so far. Useful for checking
    /// that decoy accesses have the same trace shape as real ones.
    pub fn read_count(&self) -> u64 {
        self.reads
    }

    /// The number of bucket slot writes performed so far.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    #[cfg(test)]
    pub fn bucket_capacities(&self) -> impl Iterator<Item = usize> + '_ {
        self.buckets.iter().skip(1).map(|bucket| bucket.capacity())
    }

    /// All real blocks currently resident, with their bucket index.
    pub fn iter_blocks(&self) -> impl Iterator<Item = (TreeIndex, &B)> {
        self.buckets
            .iter()
            .enumerate()
            .skip(1)
            .flat_map(|(index, bucket)| {
                bucket
                    .iter()
                    .filter(|block| block.is_valid())
                    .map(move |block| (index as TreeIndex, block))
            })
    }
}
