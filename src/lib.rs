// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious ordered map.
//!
//! The map is an AVL tree whose nodes live in an encrypted Path ORAM. Every
//! `insert`, `delete` and `find` walks a fixed number of tree levels, evaluates
//! every rebalancing case with constant-time selection, and performs a number of
//! ORAM path accesses that depends only on the capacity the map was created with.
//!
//! ```
//! use omap::{Bid, DefaultObliviousMap};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut map = DefaultObliviousMap::new(64, &[7u8; 16], &mut rng).unwrap();
//! map.insert(Bid::from(3u64), [1u8; 16], &mut rng).unwrap();
//! assert_eq!(map.find(Bid::from(3u64), &mut rng).unwrap(), Some([1u8; 16]));
//! ```

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::num::TryFromIntError;
use thiserror::Error;

pub mod avl;
pub mod bid;
pub mod bucket;
pub mod bucket_store;
pub mod bulk_load;
pub mod crypto;
pub(crate) mod ct;
pub(crate) mod node_cache;
pub mod node;
pub mod path_oram;
pub(crate) mod stash;
pub(crate) mod utils;

#[cfg(test)]
mod test_utils;

pub use crate::avl::{DefaultObliviousMap, ObliviousMap};
pub use crate::bid::Bid;
pub use crate::bucket_store::{BucketStore, CountAccessesBucketStore, MemoryBucketStore};
pub use crate::bulk_load::InitialLayout;
pub use crate::crypto::SecretKey;
pub use crate::node::Node;
pub use crate::path_oram::{DEFAULT_BLOCKS_PER_BUCKET, DEFAULT_STASH_OVERFLOW_SIZE};

/// The number of blocks held by a single bucket ("Z" in the Path ORAM literature).
pub type BucketSize = usize;
/// Numbers of blocks held by the stash.
pub type StashSize = u64;
/// A leaf of the bucket tree, numbered from 0 to `leaf_count - 1`. This is the "position" of a block.
pub type Leaf = u64;
/// A bucket of the bucket tree, numbered in heap order: the root is 1 and the children of `i` are `2i` and `2i + 1`.
pub type TreeIndex = u64;
/// The height of the bucket tree (a tree with a single bucket has height 0).
pub type TreeHeight = u64;

/// The size in bytes of a stored value.
pub const VALUE_SIZE: usize = 16;
/// A fixed-size value stored in the map.
pub type Value = [u8; VALUE_SIZE];

#[derive(Error, Debug)]
/// Errors returned by the map and its storage layers.
pub enum OmapError {
    /// Arithmetic conversion error.
    #[error("Arithmetic conversion error")]
    IntegerConversionError(#[from] TryFromIntError),
    /// The requested parameters cannot be used to build a map.
    #[error("Invalid configuration")]
    InvalidConfigurationError,
    /// The zero identifier is reserved as the absent sentinel.
    #[error("The zero key is reserved and cannot be stored")]
    InvalidKeyError,
    /// The same key appeared twice in a bulk load.
    #[error("Duplicate key in initial pairs")]
    DuplicateKeyError,
    /// The map already holds as many keys as it was created for.
    #[error("Capacity of {0} entries exceeded")]
    CapacityExceededError(u64),
    /// The stash could not hold every block that did not fit in the tree.
    #[error("Stash overflowed its bound of {0} blocks")]
    StashOverflowError(StashSize),
    /// The node cache and the ORAM both claimed to hold the same node.
    #[error("Node cache and ORAM disagree about a node")]
    CacheInconsistencyError,
    /// A child pointer led to a position that does not hold the child.
    #[error("A tree pointer does not resolve to a stored node")]
    MissingNodeError,
    /// A bucket failed to encrypt, decrypt or authenticate.
    #[error("Bucket encryption or authentication failure")]
    CryptoError,
    /// A bucket index or ciphertext did not match the store layout.
    #[error("Bucket index or size does not match the store layout")]
    BucketIndexError,
    /// An earlier fatal error disabled this instance.
    #[error("The map was disabled by an earlier fatal error")]
    PoisonedError,
}
