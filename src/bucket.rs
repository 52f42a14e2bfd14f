// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Buckets of the Path ORAM tree and their plaintext encoding.

use crate::{
    node::{Node, NODE_SIZE},
    BucketSize, OmapError,
};
use subtle::{Choice, ConditionallySelectable};

#[derive(Clone, Copy, PartialEq)]
/// A Path ORAM bucket of `Z` node slots.
pub struct Bucket<const Z: BucketSize> {
    /// The nodes stored by this bucket. Empty slots hold dummies.
    pub(crate) blocks: [Node; Z],
}

impl<const Z: BucketSize> Bucket<Z> {
    /// The size of the plaintext encoding of a bucket.
    pub const PLAINTEXT_SIZE: usize = Z * NODE_SIZE;

    /// Concatenates the encodings of the `Z` slots.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::PLAINTEXT_SIZE);
        for block in &self.blocks {
            bytes.extend_from_slice(&block.to_bytes());
        }
        bytes
    }

    /// Parses a bucket produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmapError> {
        if bytes.len() != Self::PLAINTEXT_SIZE {
            return Err(OmapError::BucketIndexError);
        }
        let mut result = Self::default();
        for (block, chunk) in result.blocks.iter_mut().zip(bytes.chunks_exact(NODE_SIZE)) {
            *block = Node::from_bytes(chunk)?;
        }
        Ok(result)
    }
}

impl<const Z: BucketSize> std::fmt::Debug for Bucket<Z> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.blocks.iter().all(Node::is_dummy) {
            write!(f, "Bucket::Dummy")
        } else {
            f.debug_struct("Bucket")
                .field("blocks", &self.blocks)
                .finish()
        }
    }
}

impl<const Z: BucketSize> Default for Bucket<Z> {
    fn default() -> Self {
        Self {
            blocks: [Node::dummy(); Z],
        }
    }
}

impl<const Z: BucketSize> ConditionallySelectable for Bucket<Z> {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        let mut result = Self::default();
        for i in 0..Z {
            result.blocks[i] = Node::conditional_select(&a.blocks[i], &b.blocks[i], choice);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bid;

    #[test]
    fn bucket_encoding_keeps_slot_order() {
        let mut bucket = Bucket::<4>::default();
        bucket.blocks[2] = Node::new(Bid::from(5u64), [1u8; 16]);
        let bytes = bucket.to_bytes();
        assert_eq!(bytes.len(), Bucket::<4>::PLAINTEXT_SIZE);

        let parsed = Bucket::<4>::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, bucket);
        assert!(parsed.blocks[0].is_dummy());
        assert_eq!(parsed.blocks[2].key, Bid::from(5u64));
    }

    #[test]
    fn bucket_encoding_rejects_other_sizes() {
        let bytes = Bucket::<2>::default().to_bytes();
        assert!(Bucket::<4>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn empty_bucket_debug() {
        assert_eq!(format!("{:?}", Bucket::<3>::default()), "Bucket::Dummy");
    }
}
