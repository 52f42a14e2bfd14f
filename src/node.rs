// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! AVL tree nodes, which double as ORAM blocks.

use crate::{
    bid::{Bid, BID_SIZE},
    ct::conditional_assign_bytes,
    Leaf, OmapError, Value, VALUE_SIZE,
};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// The serialized size of a node. The encoding uses 93 bytes and pads to a multiple of 16.
pub const NODE_SIZE: usize = 96;

const KEY_OFFSET: usize = 0;
const VALUE_OFFSET: usize = KEY_OFFSET + BID_SIZE;
const LEFT_ID_OFFSET: usize = VALUE_OFFSET + VALUE_SIZE;
const RIGHT_ID_OFFSET: usize = LEFT_ID_OFFSET + BID_SIZE;
const LEFT_POS_OFFSET: usize = RIGHT_ID_OFFSET + BID_SIZE;
const RIGHT_POS_OFFSET: usize = LEFT_POS_OFFSET + 8;
const POS_OFFSET: usize = RIGHT_POS_OFFSET + 8;
const HEIGHT_OFFSET: usize = POS_OFFSET + 8;
const DUMMY_OFFSET: usize = HEIGHT_OFFSET + 4;

/// A tree node. Its key is also its ORAM block identifier, and `pos` is the leaf it is mapped to.
///
/// A dummy node fills an empty ORAM slot. Dummies have height 0, so an absent child reads as an empty subtree.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Node {
    /// The key of this entry.
    pub key: Bid,
    /// The value of this entry.
    pub value: Value,
    /// The key of the left child, or `Bid::ZERO`.
    pub left_id: Bid,
    /// The key of the right child, or `Bid::ZERO`.
    pub right_id: Bid,
    /// The position of the left child.
    pub left_pos: Leaf,
    /// The position of the right child.
    pub right_pos: Leaf,
    /// The position of this node.
    pub pos: Leaf,
    /// The height of the subtree rooted here. Leaves have height 1.
    pub height: u32,
    dummy: u8,
}

impl Node {
    /// A fresh leaf node holding `key` and `value`.
    pub fn new(key: Bid, value: Value) -> Self {
        Self {
            key,
            value,
            left_id: Bid::ZERO,
            right_id: Bid::ZERO,
            left_pos: 0,
            right_pos: 0,
            pos: 0,
            height: 1,
            dummy: 0,
        }
    }

    /// An empty slot.
    pub fn dummy() -> Self {
        Self {
            height: 0,
            dummy: 1,
            ..Self::new(Bid::ZERO, [0u8; VALUE_SIZE])
        }
    }

    /// Whether this node is a dummy, in constant time.
    pub fn ct_is_dummy(&self) -> Choice {
        self.dummy.ct_eq(&1)
    }

    /// Whether this node is a dummy. Not constant-time.
    pub fn is_dummy(&self) -> bool {
        self.dummy == 1
    }

    pub(crate) fn conditional_mark_dummy(&mut self, choice: Choice) {
        self.dummy.conditional_assign(&1, choice);
    }

    /// The identifier and position of the left child if `left` is set, of the right child otherwise.
    pub fn child(&self, left: Choice) -> (Bid, Leaf) {
        (
            Bid::conditional_select(&self.right_id, &self.left_id, left),
            Leaf::conditional_select(&self.right_pos, &self.left_pos, left),
        )
    }

    /// When `apply` is set, points the left (if `left` is set) or right child at `(id, pos)`.
    pub fn set_child(&mut self, left: Choice, id: &Bid, pos: Leaf, apply: Choice) {
        self.left_id.conditional_assign(id, apply & left);
        self.left_pos.conditional_assign(&pos, apply & left);
        self.right_id.conditional_assign(id, apply & !left);
        self.right_pos.conditional_assign(&pos, apply & !left);
    }

    /// Serializes the node into its fixed-size encoding.
    pub fn to_bytes(&self) -> [u8; NODE_SIZE] {
        let mut bytes = [0u8; NODE_SIZE];
        bytes[KEY_OFFSET..VALUE_OFFSET].copy_from_slice(self.key.as_bytes());
        bytes[VALUE_OFFSET..LEFT_ID_OFFSET].copy_from_slice(&self.value);
        bytes[LEFT_ID_OFFSET..RIGHT_ID_OFFSET].copy_from_slice(self.left_id.as_bytes());
        bytes[RIGHT_ID_OFFSET..LEFT_POS_OFFSET].copy_from_slice(self.right_id.as_bytes());
        bytes[LEFT_POS_OFFSET..RIGHT_POS_OFFSET].copy_from_slice(&self.left_pos.to_le_bytes());
        bytes[RIGHT_POS_OFFSET..POS_OFFSET].copy_from_slice(&self.right_pos.to_le_bytes());
        bytes[POS_OFFSET..HEIGHT_OFFSET].copy_from_slice(&self.pos.to_le_bytes());
        bytes[HEIGHT_OFFSET..DUMMY_OFFSET].copy_from_slice(&self.height.to_le_bytes());
        bytes[DUMMY_OFFSET] = self.dummy;
        bytes
    }

    /// Parses a node from its fixed-size encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmapError> {
        if bytes.len() != NODE_SIZE {
            return Err(OmapError::BucketIndexError);
        }
        let bid_at = |offset: usize| {
            let mut id = [0u8; BID_SIZE];
            id.copy_from_slice(&bytes[offset..offset + BID_SIZE]);
            Bid::new(id)
        };
        let u64_at = |offset: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(word)
        };
        let mut value = [0u8; VALUE_SIZE];
        value.copy_from_slice(&bytes[VALUE_OFFSET..LEFT_ID_OFFSET]);
        let mut height = [0u8; 4];
        height.copy_from_slice(&bytes[HEIGHT_OFFSET..DUMMY_OFFSET]);

        Ok(Self {
            key: bid_at(KEY_OFFSET),
            value,
            left_id: bid_at(LEFT_ID_OFFSET),
            right_id: bid_at(RIGHT_ID_OFFSET),
            left_pos: u64_at(LEFT_POS_OFFSET),
            right_pos: u64_at(RIGHT_POS_OFFSET),
            pos: u64_at(POS_OFFSET),
            height: u32::from_le_bytes(height),
            dummy: bytes[DUMMY_OFFSET],
        })
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::dummy()
    }
}

impl ConditionallySelectable for Node {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        let mut value = a.value;
        conditional_assign_bytes(&mut value, &b.value, choice);
        Self {
            key: Bid::conditional_select(&a.key, &b.key, choice),
            value,
            left_id: Bid::conditional_select(&a.left_id, &b.left_id, choice),
            right_id: Bid::conditional_select(&a.right_id, &b.right_id, choice),
            left_pos: u64::conditional_select(&a.left_pos, &b.left_pos, choice),
            right_pos: u64::conditional_select(&a.right_pos, &b.right_pos, choice),
            pos: u64::conditional_select(&a.pos, &b.pos, choice),
            height: u32::conditional_select(&a.height, &b.height, choice),
            dummy: u8::conditional_select(&a.dummy, &b.dummy, choice),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dummy() {
            write!(f, "Node::Dummy")
        } else {
            f.debug_struct("Node")
                .field("key", &self.key)
                .field("left_id", &self.left_id)
                .field("right_id", &self.right_id)
                .field("height", &self.height)
                .finish_non_exhaustive()
        }
    }
}
