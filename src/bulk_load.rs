// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Building the initial encrypted bucket tree from a set of key/value pairs.
//!
//! The pairs are sorted obliviously, arranged into a perfectly balanced AVL tree by
//! recursive medians, mapped to positions drawn from a balanced permutation (every leaf
//! receives exactly `Z` records, real or padding), and packed into the leaf buckets.
//! Upper buckets start empty.

use crate::{
    bid::Bid,
    bucket::Bucket,
    crypto::BucketCipher,
    ct::ct_max,
    node::Node,
    utils::{balanced_leaf_permutation, bitonic_sort_by_keys, leaf_tree_index, try_with_capacity},
    BucketSize, Leaf, OmapError, TreeHeight, TreeIndex, Value,
};
use rand::{CryptoRng, RngCore};

/// The initial contents of the untrusted memory.
#[derive(Debug)]
pub struct InitialLayout {
    /// The number of buckets in the tree.
    pub bucket_count: u64,
    /// The size of every bucket ciphertext.
    pub bucket_byte_size: usize,
    /// Every bucket, leaves first and then the upper levels, tagged with its heap index.
    pub buckets: Vec<(TreeIndex, Vec<u8>)>,
}

/// A freshly built tree: where its root is, how many entries it has, and the memory holding it.
#[derive(Debug)]
pub(crate) struct LoadedTree {
    pub root: Bid,
    pub root_pos: Leaf,
    pub len: u64,
    pub layout: InitialLayout,
}

pub(crate) struct BulkLoader<const Z: BucketSize> {
    height: TreeHeight,
    positions: Vec<Leaf>,
    next_position: usize,
}

impl<const Z: BucketSize> BulkLoader<Z> {
    pub fn new<R: RngCore + CryptoRng>(height: TreeHeight, rng: &mut R) -> Result<Self, OmapError> {
        Ok(Self {
            height,
            positions: balanced_leaf_permutation(1 << height, u64::try_from(Z)?, rng)?,
            next_position: 0,
        })
    }

    fn take_position(&mut self) -> Result<Leaf, OmapError> {
        let position = *self
            .positions
            .get(self.next_position)
            .ok_or(OmapError::InvalidConfigurationError)?;
        self.next_position += 1;
        Ok(position)
    }

    /// Builds the tree holding `pairs` and encrypts it.
    pub fn load<R: RngCore + CryptoRng>(
        mut self,
        pairs: &[(Bid, Value)],
        cipher: &BucketCipher,
        rng: &mut R,
    ) -> Result<LoadedTree, OmapError> {
        let slot_count = self.positions.len();
        if pairs.len() > slot_count {
            return Err(OmapError::CapacityExceededError(u64::try_from(slot_count)?));
        }
        if pairs.iter().any(|(key, _)| key.is_zero()) {
            return Err(OmapError::InvalidKeyError);
        }

        let mut nodes: Vec<Node> = try_with_capacity(u64::try_from(slot_count)?)?;
        nodes.extend(pairs.iter().map(|(key, value)| Node::new(*key, *value)));
        let mut keys: Vec<Bid> = nodes.iter().map(|node| node.key).collect();
        bitonic_sort_by_keys(&mut nodes, &mut keys);
        if keys.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(OmapError::DuplicateKeyError);
        }

        let (root, root_pos, _) = self.build(&mut nodes)?;
        let len = u64::try_from(nodes.len())?;

        // Pad with dummies so that every leaf bucket receives exactly Z records.
        while nodes.len() < slot_count {
            let mut padding = Node::dummy();
            padding.pos = self.take_position()?;
            nodes.push(padding);
        }

        let mut leaf_buckets: Vec<TreeIndex> = try_with_capacity(u64::try_from(slot_count)?)?;
        leaf_buckets.extend(nodes.iter().map(|node| leaf_tree_index(node.pos, self.height)));
        bitonic_sort_by_keys(&mut nodes, &mut leaf_buckets);

        let leaf_count = 1u64 << self.height;
        let bucket_byte_size = BucketCipher::ciphertext_size(Bucket::<Z>::PLAINTEXT_SIZE);
        let mut buckets = try_with_capacity(2 * leaf_count - 1)?;
        for (records, indices) in nodes.chunks(Z).zip(leaf_buckets.chunks(Z)) {
            let mut bucket = Bucket::<Z>::default();
            bucket.blocks.copy_from_slice(records);
            buckets.push((indices[0], cipher.encrypt(&bucket.to_bytes(), indices[0], rng)?));
        }
        let empty_bucket = Bucket::<Z>::default().to_bytes();
        for index in 1..leaf_count {
            buckets.push((index, cipher.encrypt(&empty_bucket, index, rng)?));
        }

        log::info!(
            "BulkLoader::load(entries = {}, buckets = {})",
            len,
            buckets.len()
        );

        Ok(LoadedTree {
            root,
            root_pos,
            len,
            layout: InitialLayout {
                bucket_count: 2 * leaf_count - 1,
                bucket_byte_size,
                buckets,
            },
        })
    }

    // Turns the sorted `nodes` into a balanced tree rooted at the lower median.
    // Returns the root's identifier, position and height.
    fn build(&mut self, nodes: &mut [Node]) -> Result<(Bid, Leaf, u32), OmapError> {
        if nodes.is_empty() {
            return Ok((Bid::ZERO, 0, 0));
        }
        let middle = (nodes.len() - 1) / 2;
        let (left, rest) = nodes.split_at_mut(middle);
        let (root, right) = rest.split_at_mut(1);

        let (left_id, left_pos, left_height) = self.build(left)?;
        let (right_id, right_pos, right_height) = self.build(right)?;

        let root = &mut root[0];
        root.left_id = left_id;
        root.left_pos = left_pos;
        root.right_id = right_id;
        root.right_pos = right_pos;
        root.height = 1 + ct_max(left_height, right_height);
        root.pos = self.take_position()?;

        Ok((root.key, root.pos, root.height))
    }
}
