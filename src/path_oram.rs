// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM over encrypted buckets, storing tree nodes as blocks.
//!
//! Blocks are addressed by their `Bid` and carry their own position, so there is no
//! position map: the caller supplies the position of every block it reads, and is
//! responsible for remembering the fresh position of every block it writes.

use crate::{
    bid::Bid,
    bucket::Bucket,
    bucket_store::BucketStore,
    bulk_load::InitialLayout,
    crypto::BucketCipher,
    node::Node,
    stash::ObliviousStash,
    utils::{bucket_on_path, ceil_log2, leaf_tree_index, random_leaf},
    BucketSize, Leaf, OmapError, StashSize, TreeHeight,
};
use rand::{CryptoRng, RngCore};
use subtle::{Choice, ConditionallySelectable};

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket; typical values are 3 or 4.
/// Here we adopt the more conservative setting of 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

/// The default number of overflow blocks that the Path ORAM stash can store.
pub const DEFAULT_STASH_OVERFLOW_SIZE: StashSize = 40;

/// A doubly oblivious Path ORAM whose buckets live encrypted in an untrusted `BucketStore`.
///
/// ## Parameters
///
/// - Store type `S`: the untrusted memory holding the encrypted bucket tree.
/// - Bucket size `Z`: the number of blocks per Path ORAM bucket.
///     Must be at least 2. Along with the overflow size, this value affects the probability
///     of stash overflow and should be set with care.
/// - Overflow size: the number of blocks that the stash can store between accesses.
///
/// ## Security
///
/// The sequence of paths touched is independent of the blocks requested, as long as the
/// caller passes uniformly random positions for dummy reads and never reuses a position.
/// A stash overflow is reported as an error rather than handled by growing the stash.
/// With Z = 4, experiments from the [original Path ORAM paper](https://eprint.iacr.org/2013/280.pdf)
/// indicate that setting the overflow size to 40 reduces the probability of overflow below 2^{-50}.
#[derive(Debug)]
pub struct PathOram<S: BucketStore, const Z: BucketSize> {
    /// The underlying untrusted memory that the ORAM is obliviously accessing on behalf of its client.
    pub(crate) physical_memory: S,
    /// The Path ORAM stash.
    stash: ObliviousStash,
    /// Encrypts every bucket written to `physical_memory`.
    cipher: BucketCipher,
    /// The height of the Path ORAM tree data structure.
    height: TreeHeight,
    /// The number of background evictions performed so far.
    eviction_counter: u64,
    /// The number of paths read and rewritten so far.
    path_accesses: u64,
}

impl<S: BucketStore, const Z: BucketSize> PathOram<S, Z> {
    /// The height of a bucket tree with at least one leaf per entry: `max(1, ceil(log2(max_entries)))`.
    pub fn tree_height(max_entries: u64) -> TreeHeight {
        ceil_log2(max_entries).max(1)
    }

    /// Returns a `PathOram` whose untrusted memory is initialized with `layout`.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `Z` is 0 or 1, if `height` is 0,
    /// or if `layout` does not describe a tree of height `height`.
    pub fn from_layout(
        layout: InitialLayout,
        cipher: BucketCipher,
        height: TreeHeight,
        overflow_size: StashSize,
    ) -> Result<Self, OmapError> {
        log::info!(
            "PathOram::from_layout(height = {}, buckets = {})",
            height,
            layout.bucket_count
        );

        if Z <= 1 || height == 0 || height >= 63 {
            return Err(OmapError::InvalidConfigurationError);
        }
        if layout.bucket_count != (2u64 << height) - 1
            || layout.bucket_byte_size != BucketCipher::ciphertext_size(Bucket::<Z>::PLAINTEXT_SIZE)
        {
            return Err(OmapError::InvalidConfigurationError);
        }

        let mut physical_memory = S::new(layout.bucket_count, layout.bucket_byte_size)?;
        physical_memory.populate(layout.buckets)?;

        let path_size = u64::try_from(Z)? * (height + 1);
        let stash = ObliviousStash::new(path_size, overflow_size)?;

        Ok(Self {
            physical_memory,
            stash,
            cipher,
            height,
            eviction_counter: 0,
            path_accesses: 0,
        })
    }

    /// The height of the bucket tree.
    pub fn height(&self) -> TreeHeight {
        self.height
    }

    /// The number of leaves, and so of distinct positions.
    pub fn leaf_count(&self) -> u64 {
        1 << self.height
    }

    /// A uniformly random position.
    pub fn random_leaf<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Leaf {
        random_leaf(self.height, rng)
    }

    /// Reads path `position`, removes block `id` from the ORAM and evicts the same path.
    ///
    /// When `is_dummy` is set the path is chosen at random and nothing is removed,
    /// but the observable accesses are the same. Returns whether the block was found.
    pub fn read<R: RngCore + CryptoRng>(
        &mut self,
        id: &Bid,
        position: Leaf,
        is_dummy: Choice,
        rng: &mut R,
    ) -> Result<(Choice, Node), OmapError> {
        let random_position = self.random_leaf(rng);
        let position = Leaf::conditional_select(&position, &random_position, is_dummy);

        self.stash.read_from_path::<Z, S>(
            &mut self.physical_memory,
            &self.cipher,
            self.height,
            position,
        )?;

        let result = self.stash.take(id, !is_dummy);

        // Evict blocks from the stash into the path that was just read.
        self.stash.write_to_path::<Z, S, R>(
            &mut self.physical_memory,
            &self.cipher,
            self.height,
            position,
            rng,
        )?;
        self.path_accesses += 1;

        Ok(result)
    }

    /// Adds `node` (under its own key and position) to the stash and performs one eviction.
    /// When `is_dummy` is set only the eviction happens.
    pub fn write<R: RngCore + CryptoRng>(
        &mut self,
        node: &Node,
        is_dummy: Choice,
        rng: &mut R,
    ) -> Result<(), OmapError> {
        self.stash.insert(node, !is_dummy)?;
        self.evict(rng)
    }

    /// Reads and rewrites the next path in reverse-lexicographic order.
    pub fn evict<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), OmapError> {
        let position = self.next_eviction_leaf();

        self.stash.read_from_path::<Z, S>(
            &mut self.physical_memory,
            &self.cipher,
            self.height,
            position,
        )?;
        self.stash.write_to_path::<Z, S, R>(
            &mut self.physical_memory,
            &self.cipher,
            self.height,
            position,
            rng,
        )?;
        self.path_accesses += 1;

        Ok(())
    }

    // Consecutive evictions walk the leaves in bit-reversed order, which spreads them evenly over the tree.
    fn next_eviction_leaf(&mut self) -> Leaf {
        let g = self.eviction_counter % self.leaf_count();
        self.eviction_counter = self.eviction_counter.wrapping_add(1);
        g.reverse_bits() >> (64 - self.height)
    }

    /// Looks up block `id` on path `position` or in the stash, changing nothing.
    ///
    /// This is a diagnostic: its accesses depend on its arguments.
    pub fn peek(&mut self, id: &Bid, position: Leaf) -> Result<Option<Node>, OmapError> {
        if position >= self.leaf_count() {
            return Ok(self.stash.peek(id));
        }
        let leaf_index = leaf_tree_index(position, self.height);
        let ciphertexts = self.physical_memory.read_path(leaf_index)?;
        for (depth, ciphertext) in (0..=self.height).zip(ciphertexts) {
            let index = bucket_on_path(leaf_index, depth, self.height);
            let bucket = Bucket::<Z>::from_bytes(&self.cipher.decrypt(&ciphertext, index)?)?;
            if let Some(node) = bucket
                .blocks
                .iter()
                .find(|block| !block.is_dummy() && block.key == *id)
            {
                return Ok(Some(*node));
            }
        }
        Ok(self.stash.peek(id))
    }

    /// The number of paths read and rewritten since construction.
    pub fn path_accesses(&self) -> u64 {
        self.path_accesses
    }

    /// The number of real blocks currently held by the stash.
    pub fn stash_occupancy(&self) -> Result<StashSize, OmapError> {
        self.stash.occupancy()
    }

    /// The untrusted memory.
    pub fn physical_memory(&self) -> &S {
        &self.physical_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bucket_store::{CountAccessesBucketStore, MemoryBucketStore},
        bulk_load::BulkLoader,
        test_utils::init_logger,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    fn empty_oram<S: BucketStore, const Z: BucketSize>(
        height: TreeHeight,
        overflow_size: StashSize,
        rng: &mut StdRng,
    ) -> PathOram<S, Z> {
        let cipher = BucketCipher::new(&[5u8; 16]).unwrap();
        let loaded = BulkLoader::<Z>::new(height, rng).unwrap().load(&[], &cipher, rng).unwrap();
        PathOram::from_layout(loaded.layout, cipher, height, overflow_size).unwrap()
    }

    #[test]
    fn tree_height_follows_capacity() {
        type Oram = PathOram<MemoryBucketStore, 4>;
        assert_eq!(Oram::tree_height(2), 1);
        assert_eq!(Oram::tree_height(4), 2);
        assert_eq!(Oram::tree_height(5), 3);
        assert_eq!(Oram::tree_height(64), 6);
    }

    #[test]
    fn eviction_order_is_bit_reversed() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut oram = empty_oram::<MemoryBucketStore, 4>(3, 40, &mut rng);
        let order: Vec<Leaf> = (0..9).map(|_| oram.next_eviction_leaf()).collect();
        assert_eq!(order, vec![0, 4, 2, 6, 1, 5, 3, 7, 0]);
    }

    #[test]
    fn rejects_bad_layouts() {
        let mut rng = StdRng::seed_from_u64(0);
        let cipher = BucketCipher::new(&[5u8; 16]).unwrap();
        let loaded = BulkLoader::<4>::new(3, &mut rng).unwrap().load(&[], &cipher, &mut rng).unwrap();
        let result = PathOram::<MemoryBucketStore, 4>::from_layout(loaded.layout, cipher, 2, 40);
        assert!(matches!(result, Err(OmapError::InvalidConfigurationError)));
    }

    // Moves blocks around the way the tree does: every read removes a block, and it is
    // written back under a fresh position.
    fn random_workload<S: BucketStore, const Z: BucketSize>(height: TreeHeight, operations: usize) {
        init_logger();
        let mut rng = StdRng::seed_from_u64(0);
        let mut oram = empty_oram::<S, Z>(height, DEFAULT_STASH_OVERFLOW_SIZE, &mut rng);
        let block_count = 1u64 << height;
        let mut positions: HashMap<u64, Leaf> = HashMap::new();

        for key in 1..=block_count {
            let mut node = Node::new(Bid::from(key), [key as u8; 16]);
            node.pos = oram.random_leaf(&mut rng);
            positions.insert(key, node.pos);
            oram.write(&node, 0.into(), &mut rng).unwrap();
        }

        for _ in 0..operations {
            let key = rng.gen_range(1..=block_count);
            let dummy = rng.gen::<bool>();
            let (found, mut node) = oram
                .read(&Bid::from(key), positions[&key], Choice::from(dummy as u8), &mut rng)
                .unwrap();
            assert_eq!(bool::from(found), !dummy);
            if !dummy {
                assert_eq!(node.value, [key as u8; 16]);
                node.pos = oram.random_leaf(&mut rng);
                positions.insert(key, node.pos);
            }
            oram.write(&node, Choice::from(dummy as u8), &mut rng).unwrap();
            assert!(oram.stash_occupancy().unwrap() <= DEFAULT_STASH_OVERFLOW_SIZE);
        }

        for key in 1..=block_count {
            let node = oram.peek(&Bid::from(key), positions[&key]).unwrap().unwrap();
            assert_eq!(node.pos, positions[&key]);
        }
    }

    #[test]
    fn random_workload_height_3_z_4() {
        random_workload::<MemoryBucketStore, 4>(3, 300);
    }

    #[test]
    fn random_workload_height_5_z_3() {
        random_workload::<MemoryBucketStore, 3>(5, 300);
    }

    #[test]
    fn random_workload_counting_store() {
        random_workload::<CountAccessesBucketStore, 4>(4, 200);
    }

    #[test]
    fn every_access_touches_one_path() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut oram = empty_oram::<CountAccessesBucketStore, 4>(4, 40, &mut rng);
        let node = Node::new(Bid::from(1u64), [0u8; 16]);

        oram.write(&node, 0.into(), &mut rng).unwrap();
        oram.read(&Bid::from(1u64), node.pos, 0.into(), &mut rng).unwrap();
        oram.read(&Bid::from(9u64), 0, 1.into(), &mut rng).unwrap();
        oram.write(&node, 1.into(), &mut rng).unwrap();

        assert_eq!(oram.path_accesses(), 4);
        let store = oram.physical_memory();
        assert_eq!(store.path_reads, 4);
        assert_eq!(store.path_writes, 4);
        assert_eq!(store.get_read_count(), 4 * 5);
    }
}
