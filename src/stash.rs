// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A fixed-size, obliviously accessed Path ORAM stash.
//!
//! The first `path_size` slots receive the decrypted contents of the path being
//! accessed and are emptied again by the eviction that follows. The remaining
//! `overflow_size` slots hold the blocks that did not fit back into the tree.

use crate::{
    bid::Bid,
    bucket::Bucket,
    bucket_store::BucketStore,
    crypto::BucketCipher,
    node::Node,
    utils::{bitonic_sort_by_keys, bucket_on_path, leaf_tree_index, shared_path_depth},
    BucketSize, Leaf, OmapError, StashSize, TreeHeight, TreeIndex,
};
use rand::{CryptoRng, RngCore};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater};

const UNASSIGNED: TreeIndex = TreeIndex::MAX;
const OVERFLOW: TreeIndex = TreeIndex::MAX - 1;

#[derive(Debug)]
pub(crate) struct ObliviousStash {
    blocks: Vec<Node>,
    path_size: StashSize,
    overflow_size: StashSize,
}

impl ObliviousStash {
    pub fn new(path_size: StashSize, overflow_size: StashSize) -> Result<Self, OmapError> {
        let num_stash_blocks: usize = (path_size + overflow_size).try_into()?;

        Ok(Self {
            blocks: vec![Node::dummy(); num_stash_blocks],
            path_size,
            overflow_size,
        })
    }

    /// Decrypts the path ending at `leaf` into the path region of the stash.
    pub fn read_from_path<const Z: BucketSize, S: BucketStore>(
        &mut self,
        physical_memory: &mut S,
        cipher: &BucketCipher,
        height: TreeHeight,
        leaf: Leaf,
    ) -> Result<(), OmapError> {
        let leaf_index = leaf_tree_index(leaf, height);
        let ciphertexts = physical_memory.read_path(leaf_index)?;

        for (depth, ciphertext) in (0..=height).zip(ciphertexts.iter()) {
            let index = bucket_on_path(leaf_index, depth, height);
            let bucket = Bucket::<Z>::from_bytes(&cipher.decrypt(ciphertext, index)?)?;
            let first_slot = Z * usize::try_from(depth)?;
            self.blocks[first_slot..first_slot + Z].copy_from_slice(&bucket.blocks);
        }

        Ok(())
    }

    /// Removes the real block `id` from the stash, if present and if `active` is set.
    pub fn take(&mut self, id: &Bid, active: Choice) -> (Choice, Node) {
        let mut result = Node::dummy();
        let mut found: Choice = 0.into();

        for block in &mut self.blocks {
            let is_requested = active & !block.ct_is_dummy() & block.key.ct_eq(id);
            result.conditional_assign(block, is_requested);
            found |= is_requested;
            block.conditional_mark_dummy(is_requested);
        }

        (found, result)
    }

    /// Places `node` in a free overflow slot when `active` is set.
    pub fn insert(&mut self, node: &Node, active: Choice) -> Result<(), OmapError> {
        let mut placed = !active;

        for block in self.blocks.iter_mut().skip(self.path_size.try_into()?) {
            let should_place = block.ct_is_dummy() & !placed;
            block.conditional_assign(node, should_place);
            placed |= should_place;
        }

        // Only a full stash leaves a real node unplaced, and that is fatal.
        if bool::from(!placed) {
            return Err(OmapError::StashOverflowError(self.overflow_size));
        }
        Ok(())
    }

    /// Evicts as many blocks as possible onto the path ending at `leaf`, re-encrypting every bucket.
    pub fn write_to_path<const Z: BucketSize, S: BucketStore, R: RngCore + CryptoRng>(
        &mut self,
        physical_memory: &mut S,
        cipher: &BucketCipher,
        height: TreeHeight,
        leaf: Leaf,
        rng: &mut R,
    ) -> Result<(), OmapError> {
        let position = leaf_tree_index(leaf, height);
        let bucket_size = u64::try_from(Z)?;
        let mut level_assignments = vec![UNASSIGNED; self.blocks.len()];
        let mut level_counts = vec![0u64; usize::try_from(height)? + 1];

        // The deepest level each block may occupy on this path.
        let mut deepest_levels = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            // Set up valid but meaningless input in case `block` is a dummy.
            let an_arbitrary_leaf: Leaf = 0;
            let block_leaf = Leaf::conditional_select(&block.pos, &an_arbitrary_leaf, block.ct_is_dummy());
            deepest_levels.push(shared_path_depth(block_leaf, leaf, height));
        }

        // Fill levels from the leaf upward, each with any unassigned block allowed that deep.
        for level in (0..=height).rev() {
            let count = &mut level_counts[usize::try_from(level)?];
            for (i, block) in self.blocks.iter().enumerate() {
                let full = count.ct_eq(&bucket_size);
                let unassigned = level_assignments[i].ct_eq(&UNASSIGNED);
                let deep_enough = !level.ct_gt(&deepest_levels[i]);
                let should_assign = !block.ct_is_dummy() & unassigned & deep_enough & !full;

                level_assignments[i].conditional_assign(&level, should_assign);
                count.conditional_assign(&(*count + 1), should_assign);
            }
        }

        // Real blocks that found no room stay in the overflow region.
        for (i, block) in self.blocks.iter().enumerate() {
            let should_overflow = !block.ct_is_dummy() & level_assignments[i].ct_eq(&UNASSIGNED);
            level_assignments[i].conditional_assign(&OVERFLOW, should_overflow);
        }

        // Assign dummy blocks to the remaining non-full buckets until all buckets are full.
        for (i, block) in self.blocks.iter().enumerate() {
            let block_free = block.ct_is_dummy();

            let mut assigned: Choice = 0.into();
            for (level, count) in level_counts.iter_mut().enumerate() {
                let full = count.ct_eq(&bucket_size);
                let no_op = assigned | full | !block_free;

                level_assignments[i].conditional_assign(&(u64::try_from(level))?, !no_op);
                count.conditional_assign(&(*count + 1), !no_op);
                assigned |= !no_op;
            }
        }

        let mut exists_unfilled_levels: Choice = 0.into();
        for count in level_counts.iter() {
            exists_unfilled_levels |= !count.ct_eq(&bucket_size);
        }
        // Too few free slots to pad the path means the overflow region is exhausted.
        if exists_unfilled_levels.into() {
            return Err(OmapError::StashOverflowError(self.overflow_size));
        }

        bitonic_sort_by_keys(&mut self.blocks, &mut level_assignments);

        // Write the first Z * (height + 1) blocks into slots in the tree.
        let mut ciphertexts = Vec::with_capacity(usize::try_from(height)? + 1);
        for depth in 0..=usize::try_from(height)? {
            let mut new_bucket: Bucket<Z> = Bucket::default();

            for slot_number in 0..Z {
                let stash_index = depth * Z + slot_number;

                new_bucket.blocks[slot_number] = self.blocks[stash_index];
                self.blocks[stash_index] = Node::dummy();
            }

            let index = bucket_on_path(position, u64::try_from(depth)?, height);
            ciphertexts.push(cipher.encrypt(&new_bucket.to_bytes(), index, rng)?);
        }
        physical_memory.write_path(position, ciphertexts)?;

        Ok(())
    }

    /// Finds `id` without modifying the stash. Not oblivious.
    pub fn peek(&self, id: &Bid) -> Option<Node> {
        self.blocks
            .iter()
            .find(|block| !block.is_dummy() && block.key == *id)
            .copied()
    }

    /// The number of real blocks held by the stash.
    pub fn occupancy(&self) -> Result<StashSize, OmapError> {
        let occupied = self.blocks.iter().filter(|block| !block.is_dummy()).count();
        Ok(StashSize::try_from(occupied)?)
    }
}
