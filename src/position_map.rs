// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side position map.
//!
//! A plain mapping from logical key to the leaf the key's block is assigned
//! to. The map is the client-side secret: no obliviousness applies to it,
//! and it never references a block, only a leaf.

use std::collections::HashMap;
use std::hash::Hash;

use rand::rngs::OsRng;
use rand::Rng;

use crate::Leaf;

#[derive(Debug)]
pub(crate) struct PositionMap<K> {
    positions: HashMap<K, Leaf>,
    leaf_count: u32,
}

impl<K: Eq + Hash> PositionMap<K> {
    pub fn new(leaf_count: u32) -> Self {
        Self {
            positions: HashMap::new(),
            leaf_count,
        }
    }

    pub fn get(&self, key: &K) -> Option<Leaf> {
        self.positions.get(key).copied()
    }

    pub fn set(&mut self, key: K, leaf: Leaf) {
        self.positions.insert(key, leaf);
    }

    /// Draws a leaf uniformly at random from `[0, 2^H)`.
    pub fn new_leaf(&self) -> Leaf {
        OsRng.gen_range(0..self.leaf_count)
    }
}
