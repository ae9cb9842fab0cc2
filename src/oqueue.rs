// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The oblivious FIFO queue.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::QueueBlock;
use crate::crypto;
use crate::evictor::{self, Evictor, Maintain, PlacementOrder};
use crate::{OramError, StashPolicy, TreeHeight};

/// An oblivious FIFO queue.
///
/// Every `push` and `pop` performs one full path access on a freshly drawn
/// random leaf, so the two operations are indistinguishable to an observer
/// of the bucket tree. Items are sealed with AES-256-GCM before they enter
/// the tree. FIFO order is maintained by the stash's insertion ordering
/// together with root-first eviction, which keeps the oldest items in the
/// buckets every path shares.
///
/// Like [`OMap`](crate::OMap), a queue owns a background eviction worker
/// joined on drop, and can be shared across threads behind an [`Arc`].
pub struct OQueue<V> {
    core: Arc<Mutex<QueueCore>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    _value: PhantomData<fn() -> V>,
}

struct QueueCore {
    evictor: Evictor<QueueBlock>,
    live: usize,
    capacity: Option<usize>,
    next_seq: u64,
}

impl QueueCore {
    /// Folds engine-side drops into the length accounting. The queue keeps
    /// no client-side leaf metadata, so engine remaps are just discarded.
    fn absorb_drops(&mut self) {
        let dropped = self.evictor.take_dropped().len();
        self.live = self.live.saturating_sub(dropped);
        let _ = self.evictor.take_remaps();
    }

    fn full(&self) -> bool {
        self.capacity.is_some_and(|capacity| self.live >= capacity)
    }
}

impl Maintain for QueueCore {
    fn maintenance_due(&self) -> bool {
        self.evictor.maintenance_due()
    }

    fn run_maintenance(&mut self) {
        let emergency = self.evictor.emergency();
        self.evictor.full_eviction(emergency);
        self.absorb_drops();
    }
}

impl<V> OQueue<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Creates an unbounded queue under the default [`StashPolicy::Grow`].
    pub fn new(height: TreeHeight, stash_limit: usize, bucket_capacity: usize) -> Self {
        Self::build(height, stash_limit, bucket_capacity, StashPolicy::Grow, None)
    }

    /// Creates a queue with an explicit stash-pressure policy.
    pub fn with_policy(
        height: TreeHeight,
        stash_limit: usize,
        bucket_capacity: usize,
        policy: StashPolicy,
    ) -> Self {
        Self::build(height, stash_limit, bucket_capacity, policy, None)
    }

    /// Creates a bounded queue. A push against a full queue fails with
    /// [`OramError::QueueFull`] but still performs the complete path
    /// access, so failed pushes are indistinguishable from successful ones.
    pub fn with_capacity(
        height: TreeHeight,
        stash_limit: usize,
        bucket_capacity: usize,
        capacity: usize,
    ) -> Self {
        Self::build(
            height,
            stash_limit,
            bucket_capacity,
            StashPolicy::Grow,
            Some(capacity),
        )
    }

    fn build(
        height: TreeHeight,
        stash_limit: usize,
        bucket_capacity: usize,
        policy: StashPolicy,
        capacity: Option<usize>,
    ) -> Self {
        log::info!(
            "OQueue::new(H = {height}, S = {stash_limit}, Z = {bucket_capacity}, {policy:?})"
        );
        let core = Arc::new(Mutex::new(QueueCore {
            evictor: Evictor::new(
                height,
                bucket_capacity,
                stash_limit,
                policy,
                PlacementOrder::RootFirst,
            ),
            live: 0,
            capacity,
            next_seq: 0,
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

    /// Appends `value` at the back of the queue.
    pub fn push(&self, value: V) -> Result<(), OramError> {
        let encoded = serde_json::to_vec(&value).map_err(|_| OramError::Malformed)?;
        let payload = crypto::seal(&encoded)?;

        let mut guard = self.lock();
        let core = &mut *guard;

        let leaf = core.evictor.random_leaf();
        if let Err(error) = core.evictor.read_path(leaf) {
            core.evictor.write_path(leaf);
            core.absorb_drops();
            return Err(error);
        }

        if core.full() {
            // Complete the trace before reporting the bound.
            core.evictor.write_path(leaf);
            core.absorb_drops();
            return Err(OramError::QueueFull);
        }

        let seq = core.next_seq;
        core.next_seq += 1;
        core.evictor.stash.push(QueueBlock::new(payload, leaf, seq));
        core.live += 1;
        core.evictor.write_path(leaf);
        core.absorb_drops();
        Ok(())
    }

    /// Removes and returns the item at the front of the queue, or `None` if
    /// the queue is empty. An empty pop still performs the full path
    /// access.
    pub fn pop(&self) -> Result<Option<V>, OramError> {
        let mut guard = self.lock();
        let core = &mut *guard;

        let leaf = core.evictor.random_leaf();
        if let Err(error) = core.evictor.read_path(leaf) {
            core.evictor.write_path(leaf);
            core.absorb_drops();
            return Err(error);
        }

        // A path drain appends recovered tree blocks behind newer stashed
        // ones; restore arrival order so the front is the oldest in sight.
        core.evictor.stash.sort_by_age();
        let decoded = core.evictor.stash.front().map(|front| {
            crypto::open(&front.value).and_then(|plaintext| {
                serde_json::from_slice(&plaintext).map_err(|_| OramError::Malformed)
            })
        });

        let mut outcome: Result<Option<V>, OramError> = Ok(None);
        match decoded {
            Some(Ok(value)) => {
                let _ = core.evictor.stash.pop_front();
                core.live = core.live.saturating_sub(1);
                outcome = Ok(Some(value));
            }
            // The block stays queued; the operation aborts with the
            // container consistent.
            Some(Err(error)) => outcome = Err(error),
            None => {}
        }

        core.evictor.write_path(leaf);
        core.absorb_drops();
        outcome
    }

    /// The number of items currently held. Advisory diagnostic only.
    pub fn len(&self) -> usize {
        self.lock().live
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of blocks currently stashed. Advisory diagnostic only.
    pub fn stash_len(&self) -> usize {
        self.lock().evictor.stash.len()
    }

    /// The number of bucket drains performed since construction. Advisory
    /// diagnostic; empty and non-empty pops drain the same number of
    /// buckets.
    pub fn bucket_read_count(&self) -> u64 {
        self.lock().evictor.tree.read_count()
    }

    /// The number of bucket slot writes performed since construction.
    /// Advisory diagnostic only.
    pub fn bucket_write_count(&self) -> u64 {
        self.lock().evictor.tree.write_count()
    }

    fn lock(&self) -> MutexGuard<'_, QueueCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V> Drop for OQueue<V> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
