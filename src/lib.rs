// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious storage containers.
//!
//! This crate provides two privacy-preserving containers backed by a
//! Path-ORAM-style bucket tree: an oblivious key-value map ([`OMap`]) and an
//! oblivious FIFO queue ([`OQueue`]). Both hide their access patterns from an
//! observer of the server-side bucket tree: any two request sequences of equal
//! length produce indistinguishable traces of bucket reads and writes.
//!
//! Every stored value is sealed with AES-256-GCM under a process-wide key
//! before it enters the tree, so the at-rest representation is never
//! plaintext and any tampering with stored ciphertext is detected on read.
//!
//! ```
//! use oblivious_store::OMap;
//!
//! let map: OMap<String, String> = OMap::new(5, 100, 4);
//! map.insert("/example".into(), "eth0".into())?;
//! assert_eq!(map.lookup(&"/example".into())?, Some("eth0".into()));
//! # Ok::<(), oblivious_store::OramError>(())
//! ```

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use thiserror::Error;

/// The numeric type identifying a leaf of the bucket tree, in `[0, 2^H)`.
pub type Leaf = u32;
/// The numeric type indexing tree buckets; the root is 1 and the children of
/// bucket `i` are `2i` and `2i + 1`.
pub type TreeIndex = u32;
/// The numeric type used for the height of the bucket tree.
pub type TreeHeight = u8;

/// The errors surfaced by container operations.
///
/// Internal stash-pressure conditions are absorbed by the eviction engine and
/// never surface; only unrecoverable conditions appear here. A surfaced error
/// is fatal for that operation but leaves the container consistent, so
/// further operations on other keys can still succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OramError {
    /// The stash exceeded its bound and no mitigation could free enough room.
    /// Retrying the same operation is likely to fail again until workload
    /// pressure subsides.
    #[error("stash exceeded its bound and could not be relieved")]
    StashOverflow,
    /// A stored ciphertext failed tag verification; treat as corruption.
    #[error("ciphertext failed authentication")]
    AuthFail,
    /// A ciphertext was too short to contain an IV and tag, or a value could
    /// not be encoded/decoded.
    #[error("malformed ciphertext or value encoding")]
    Malformed,
    /// A bounded queue is at capacity. The failing push still performed a
    /// full path access.
    #[error("queue is at capacity")]
    QueueFull,
}

/// How a container relieves stash pressure that eviction alone cannot clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashPolicy {
    /// No mitigation: once the soft bound is exhausted, operations fail with
    /// [`OramError::StashOverflow`].
    Strict,
    /// Grow the soft bound by 20% under extreme pressure. Never drops data.
    Grow,
    /// Drop non-priority blocks under extreme pressure; grow only when
    /// nothing is droppable. High-priority blocks are never dropped.
    DropFirst,
}

mod bucket;
mod crypto;
mod evictor;
mod omap;
mod oqueue;
mod position_map;
mod stash;
#[cfg(test)]
mod test_utils;
mod tree;

pub use omap::OMap;
pub use oqueue::OQueue;
