// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The oblivious key-value map.

use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::{MapBlock, OramBlock};
use crate::crypto;
use crate::evictor::{self, Evictor, Maintain, PlacementOrder};
use crate::position_map::PositionMap;
use crate::{OramError, StashPolicy, TreeHeight};

/// An oblivious key-value map.
///
/// Every `insert` and `lookup` performs the same physical trace — one path
/// read into the stash, a stash mutation, and one path eviction — so an
/// observer of the bucket tree cannot distinguish operations or correlate
/// them with keys. Values are sealed with AES-256-GCM before they enter the
/// tree.
///
/// The map owns a background eviction worker that keeps stash pressure down
/// between client calls; it is joined when the map is dropped. All methods
/// take `&self` and serialize on an internal mutex, so a map can be shared
/// across threads behind an [`Arc`].
pub struct OMap<K: Clone + Default, V> {
    core: Arc<Mutex<MapCore<K>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    _value: PhantomData<fn() -> V>,
}

struct MapCore<K: Clone + Default> {
    evictor: Evictor<MapBlock<K>>,
    positions: PositionMap<K>,
    classifier: Option<Box<dyn Fn(&K) -> bool + Send>>,
}

impl<K: Eq + Hash + Clone + Default> MapCore<K> {
    /// Reconciles client-side state after an access: the position map
    /// follows any leaf remaps the engine performed on stashed blocks, and
    /// every dropped key is assigned a fresh random leaf (logical deletion:
    /// its next lookup walks an empty path and returns `None`).
    fn settle(&mut self) {
        // Replay engine remaps first: a remapped block may already have
        // been placed back into the tree under its new leaf.
        for (key, leaf) in self.evictor.take_remaps() {
            self.positions.set(key, leaf);
        }
        for block in self.evictor.stash.iter() {
            self.positions.set(block.key.clone(), block.leaf());
        }
        for block in self.evictor.take_dropped() {
            let ghost = self.positions.new_leaf();
            self.positions.set(block.into_key(), ghost);
        }
    }

    fn pre_evict(&mut self) {
        if self.evictor.pre_eviction_due() {
            let emergency = self.evictor.emergency();
            self.evictor.full_eviction(emergency);
        }
    }
}

impl<K: Eq + Hash + Clone + Default + Send> Maintain for MapCore<K> {
    fn maintenance_due(&self) -> bool {
        self.evictor.maintenance_due()
    }

    fn run_maintenance(&mut self) {
        let emergency = self.evictor.emergency();
        self.evictor.full_eviction(emergency);
        self.settle();
    }
}

impl<K, V> OMap<K, V>
where
    K: Eq + Hash + Clone + Default + Send + 'static,
    V: Serialize + DeserializeOwned,
{
    /// Creates a map over a tree of the given height, with the given stash
    /// soft bound and bucket capacity, under the default
    /// [`StashPolicy::Grow`].
    pub fn new(height: TreeHeight, stash_limit: usize, bucket_capacity: usize) -> Self {
        Self::with_policy(height, stash_limit, bucket_capacity, StashPolicy::Grow)
    }

    /// Creates a map with an explicit stash-pressure policy.
    pub fn with_policy(
        height: TreeHeight,
        stash_limit: usize,
        bucket_capacity: usize,
        policy: StashPolicy,
    ) -> Self {
        log::info!(
            "OMap::new(H = {height}, S = {stash_limit}, Z = {bucket_capacity}, {policy:?})"
        );
        let core = Arc::new(Mutex::new(MapCore {
            evictor: Evictor::new(
                height,
                bucket_capacity,
                stash_limit,
                policy,
                PlacementOrder::DeepestFirst,
            ),
            positions: PositionMap::new(1 << height),
            classifier: None,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = evictor::spawn_maintenance(Arc::clone(&core), Arc::clone(&stop));
        Self {
            core,
            stop,
            worker: Some(worker),
            _value: PhantomData,
        }
    }

    /// Installs the predicate that marks keys as high-priority at insert
    /// time. High-priority blocks are never shed by emergency drops; use
    /// this for entries whose loss would compromise correctness (e.g.
    /// routing-table entries).
    pub fn set_priority_classifier<F>(&self, classifier: F)
    where
        F: Fn(&K) -> bool + Send + 'static,
    {
        self.lock().classifier = Some(Box::new(classifier));
    }

    /// Enters or leaves emergency mode explicitly. The container also
    /// enters emergency mode on its own when pressure forces a drop; it
    /// only leaves it through this call.
    pub fn enable_emergency_mode(&self, on: bool) {
        self.lock().evictor.set_emergency(on);
    }

    /// Inserts `key` with `value`, overwriting any previous value.
    pub fn insert(&self, key: K, value: V) -> Result<(), OramError> {
        let encoded = serde_json::to_vec(&value).map_err(|_| OramError::Malformed)?;
        let payload = crypto::seal(&encoded)?;

        let mut guard = self.lock();
        let core = &mut *guard;
        core.pre_evict();

        // Access the key's current path so the previous instance, if any,
        // is captured and replaced; a fresh key walks a random decoy path.
        let path_leaf = core
            .positions
            .get(&key)
            .unwrap_or_else(|| core.positions.new_leaf());
        if let Err(error) = core.evictor.read_path(path_leaf) {
            core.evictor.write_path(path_leaf);
            core.settle();
            return Err(error);
        }

        core.evictor.stash.retain(|block| block.key != key);

        let fresh = core.positions.new_leaf();
        let high_priority = core
            .classifier
            .as_ref()
            .map_or(false, |classify| classify(&key));
        core.positions.set(key.clone(), fresh);
        core.evictor
            .stash
            .push(MapBlock::new(key, payload, fresh, high_priority));

        core.evictor.write_path(path_leaf);
        core.settle();
        Ok(())
    }

    /// Looks up `key`, returning its value if present.
    ///
    /// A miss performs the same physical trace as a hit, on a randomly
    /// chosen decoy path. A hit remaps the key to a fresh leaf.
    pub fn lookup(&self, key: &K) -> Result<Option<V>, OramError> {
        let mut guard = self.lock();
        let core = &mut *guard;

        let Some(leaf) = core.positions.get(key) else {
            let decoy = core.positions.new_leaf();
            let outcome = core.evictor.read_path(decoy);
            core.evictor.write_path(decoy);
            core.settle();
            outcome?;
            return Ok(None);
        };

        if let Err(error) = core.evictor.read_path(leaf) {
            core.evictor.write_path(leaf);
            core.settle();
            return Err(error);
        }

        let fresh = core.positions.new_leaf();
        let mut outcome: Result<Option<V>, OramError> = Ok(None);
        if let Some(block) = core
            .evictor
            .stash
            .iter_mut()
            .find(|block| block.key == *key)
        {
            outcome = match crypto::open(&block.value) {
                Ok(plaintext) => match serde_json::from_slice(&plaintext) {
                    Ok(value) => {
                        block.set_leaf(fresh);
                        Ok(Some(value))
                    }
                    Err(_) => Err(OramError::Malformed),
                },
                Err(error) => Err(error),
            };
        }
        if matches!(outcome, Ok(Some(_))) {
            core.positions.set(key.clone(), fresh);
        }

        core.evictor.write_path(leaf);
        core.settle();
        outcome
    }

    /// The number of blocks currently stashed. Advisory diagnostic only.
    pub fn stash_len(&self) -> usize {
        self.lock().evictor.stash.len()
    }

    /// The number of bucket drains performed since construction. Advisory
    /// diagnostic; hits and misses drain the same number of buckets.
    pub fn bucket_read_count(&self) -> u64 {
        self.lock().evictor.tree.read_count()
    }

    /// The number of bucket slot writes performed since construction.
    /// Advisory diagnostic only.
    pub fn bucket_write_count(&self) -> u64 {
        self.lock().evictor.tree.write_count()
    }

    fn lock(&self) -> MutexGuard<'_, MapCore<K>> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn real_block_count(&self, key: &K) -> usize {
        let guard = self.lock();
        let in_tree = guard
            .evictor
            .tree
            .iter_blocks()
            .filter(|(_, block)| block.key == *key)
            .count();
        let in_stash = guard
            .evictor
            .stash
            .iter()
            .filter(|block| block.key == *key)
            .count();
        in_tree + in_stash
    }

    #[cfg(test)]
    fn emergency_engaged(&self) -> bool {
        self.lock().evictor.emergency()
    }
}

impl<K: Clone + Default, V> Drop for OMap<K, V> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
