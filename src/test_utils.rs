// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! This module contains common test utilities for the `omap` crate: a plain AVL tree
//! to compare against, a structural checker, and generators for workload tests.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Once;
static INIT: Once = Once::new();
use crate::{
    avl::ObliviousMap, bid::Bid, bucket_store::BucketStore, crypto::SecretKey, BucketSize, Leaf,
    OmapError, Value, VALUE_SIZE,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use simplelog::{Config, WriteLogger};

const TEST_KEY: SecretKey = [0x24; 16];

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// A value derived from `key`, for tests that do not care about values.
pub(crate) fn value_of(key: u64) -> Value {
    let mut value = [0u8; VALUE_SIZE];
    value[..8].copy_from_slice(&key.to_le_bytes());
    value
}

/// `bytes` padded with zeros to a full value.
pub(crate) fn padded(bytes: &[u8]) -> Value {
    let mut value = [0u8; VALUE_SIZE];
    value[..bytes.len()].copy_from_slice(bytes);
    value
}

#[derive(Debug)]
struct ReferenceNode {
    key: u64,
    value: Value,
    height: u32,
    left: Option<Box<ReferenceNode>>,
    right: Option<Box<ReferenceNode>>,
}

fn height(node: &Option<Box<ReferenceNode>>) -> u32 {
    node.as_ref().map_or(0, |node| node.height)
}

impl ReferenceNode {
    fn leaf(key: u64, value: Value) -> Box<Self> {
        Box::new(Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        })
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance(&self) -> i64 {
        i64::from(height(&self.left)) - i64::from(height(&self.right))
    }
}

fn rotate_right(mut z: Box<ReferenceNode>) -> Box<ReferenceNode> {
    let mut y = z.left.take().unwrap();
    z.left = y.right.take();
    z.update_height();
    y.right = Some(z);
    y.update_height();
    y
}

fn rotate_left(mut z: Box<ReferenceNode>) -> Box<ReferenceNode> {
    let mut y = z.right.take().unwrap();
    z.right = y.left.take();
    z.update_height();
    y.left = Some(z);
    y.update_height();
    y
}

fn rebalance(mut node: Box<ReferenceNode>) -> Box<ReferenceNode> {
    node.update_height();
    let balance = node.balance();
    if balance > 1 {
        if node.left.as_ref().unwrap().balance() < 0 {
            node.left = Some(rotate_left(node.left.take().unwrap()));
        }
        return rotate_right(node);
    }
    if balance < -1 {
        if node.right.as_ref().unwrap().balance() > 0 {
            node.right = Some(rotate_right(node.right.take().unwrap()));
        }
        return rotate_left(node);
    }
    node
}

fn insert_into(
    node: Option<Box<ReferenceNode>>,
    key: u64,
    value: Value,
    inserted: &mut bool,
) -> Box<ReferenceNode> {
    let mut node = match node {
        None => {
            *inserted = true;
            return ReferenceNode::leaf(key, value);
        }
        Some(node) => node,
    };
    match key.cmp(&node.key) {
        Ordering::Less => node.left = Some(insert_into(node.left.take(), key, value, inserted)),
        Ordering::Greater => node.right = Some(insert_into(node.right.take(), key, value, inserted)),
        Ordering::Equal => {
            node.value = value;
            return node;
        }
    }
    rebalance(node)
}

// Removes the smallest key of the subtree, returning it with its value and the rest of the subtree.
fn take_min(mut node: Box<ReferenceNode>) -> (u64, Value, Option<Box<ReferenceNode>>) {
    match node.left.take() {
        None => (node.key, node.value, node.right.take()),
        Some(left) => {
            let (key, value, rest) = take_min(left);
            node.left = rest;
            (key, value, Some(rebalance(node)))
        }
    }
}

fn delete_from(
    node: Option<Box<ReferenceNode>>,
    key: u64,
    removed: &mut bool,
) -> Option<Box<ReferenceNode>> {
    let mut node = node?;
    match key.cmp(&node.key) {
        Ordering::Less => node.left = delete_from(node.left.take(), key, removed),
        Ordering::Greater => node.right = delete_from(node.right.take(), key, removed),
        Ordering::Equal => {
            *removed = true;
            match (node.left.take(), node.right.take()) {
                (None, child) | (child, None) => return child,
                (Some(left), Some(right)) => {
                    let (successor_key, successor_value, right) = take_min(right);
                    node.key = successor_key;
                    node.value = successor_value;
                    node.left = Some(left);
                    node.right = right;
                }
            }
        }
    }
    Some(rebalance(node))
}

/// A textbook AVL tree with the same rotation rules, used as the expected result.
#[derive(Debug, Default)]
pub(crate) struct ReferenceAvl {
    root: Option<Box<ReferenceNode>>,
    len: u64,
}

impl ReferenceAvl {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn find(&self, key: u64) -> Option<Value> {
        let mut current = self.root.as_ref();
        while let Some(node) = current {
            current = match key.cmp(&node.key) {
                Ordering::Less => node.left.as_ref(),
                Ordering::Greater => node.right.as_ref(),
                Ordering::Equal => return Some(node.value),
            };
        }
        None
    }

    pub fn insert(&mut self, key: u64, value: Value) {
        let mut inserted = false;
        self.root = Some(insert_into(self.root.take(), key, value, &mut inserted));
        self.len += u64::from(inserted);
    }

    pub fn delete(&mut self, key: u64) -> bool {
        let mut removed = false;
        self.root = delete_from(self.root.take(), key, &mut removed);
        self.len -= u64::from(removed);
        removed
    }

    pub fn preorder(&self) -> Vec<u64> {
        let mut result = Vec::new();
        let mut pending: Vec<&ReferenceNode> = self.root.as_deref().into_iter().collect();
        while let Some(node) = pending.pop() {
            result.push(node.key);
            pending.extend(node.right.as_deref());
            pending.extend(node.left.as_deref());
        }
        result
    }
}

/// Walks the whole tree (non-obliviously) and checks the search-tree ordering, the stored
/// heights, the AVL balance, the positions stored by parents, and the entry count.
pub(crate) fn check_invariants<S: BucketStore, const Z: BucketSize>(map: &mut ObliviousMap<S, Z>) {
    let (root, root_pos) = map.root();
    let mut count = 0;
    let height = check_subtree(map, &root, root_pos, None, None, &mut count);
    assert_eq!(count, map.len());
    assert!(usize::try_from(height).unwrap() <= map.max_depth());
}

fn check_subtree<S: BucketStore, const Z: BucketSize>(
    map: &mut ObliviousMap<S, Z>,
    id: &Bid,
    position: Leaf,
    lower: Option<Bid>,
    upper: Option<Bid>,
    count: &mut u64,
) -> u32 {
    if id.is_zero() {
        return 0;
    }
    let node = map.peek(id, position).unwrap();
    assert_eq!(node.key, *id);
    assert_eq!(node.pos, position, "stale position for {:?}", id);
    if let Some(lower) = lower {
        assert!(node.key > lower, "{:?} is not above {:?}", node.key, lower);
    }
    if let Some(upper) = upper {
        assert!(node.key < upper, "{:?} is not below {:?}", node.key, upper);
    }
    *count += 1;

    let left = check_subtree(map, &node.left_id, node.left_pos, lower, Some(node.key), count);
    let right = check_subtree(map, &node.right_id, node.right_pos, Some(node.key), upper, count);
    assert!(left.abs_diff(right) <= 1, "{:?} is unbalanced", node.key);
    assert_eq!(node.height, 1 + left.max(right), "wrong height for {:?}", node.key);
    node.height
}

/// Tests an `ObliviousMap` against `ReferenceAvl` on a workload of random finds, inserts
/// and deletes, comparing results and tree shapes.
pub(crate) fn test_correctness_random_workload<S: BucketStore, const Z: BucketSize>(
    max_entries: u64,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);
    let mut map = ObliviousMap::<S, Z>::new(max_entries, &TEST_KEY, &mut rng).unwrap();
    let mut mirror = ReferenceAvl::default();

    // Ascending insertions rotate the right spine repeatedly.
    for key in 1..=max_entries / 2 {
        map.insert(Bid::from(key), value_of(key), &mut rng).unwrap();
        mirror.insert(key, value_of(key));
    }
    assert_eq!(map.preorder_keys().unwrap(), mirror.preorder());

    for operation in 0..num_operations {
        let key = rng.gen_range(1..=2 * max_entries);
        match rng.gen_range(0..3) {
            0 => assert_eq!(map.find(Bid::from(key), &mut rng).unwrap(), mirror.find(key)),
            1 => {
                let value = rng.gen::<Value>();
                let result = map.insert(Bid::from(key), value, &mut rng);
                if mirror.len() < max_entries || mirror.find(key).is_some() {
                    result.unwrap();
                    mirror.insert(key, value);
                } else {
                    assert!(matches!(result, Err(OmapError::CapacityExceededError(_))));
                }
            }
            _ => assert_eq!(map.delete(Bid::from(key), &mut rng).unwrap(), mirror.delete(key)),
        }
        assert_eq!(map.len(), mirror.len());

        if operation % 25 == 0 {
            assert_eq!(map.preorder_keys().unwrap(), mirror.preorder());
            check_invariants(&mut map);
        }
    }

    assert_eq!(map.preorder_keys().unwrap(), mirror.preorder());
    check_invariants(&mut map);
    for key in 1..=2 * max_entries {
        assert_eq!(map.find(Bid::from(key), &mut rng).unwrap(), mirror.find(key), "{key}");
    }
}

/// Tests an `ObliviousMap` built from random pairs, then drained and refilled at random.
pub(crate) fn test_correctness_bulk_loaded_workload<S: BucketStore, const Z: BucketSize>(
    max_entries: u64,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(1);
    let mut keys: Vec<u64> = (1..=2 * max_entries).collect();
    keys.shuffle(&mut rng);
    keys.truncate(usize::try_from(max_entries).unwrap());

    let pairs: Vec<(Bid, Value)> = keys.iter().map(|k| (Bid::from(*k), rng.gen())).collect();
    let mut mirror: BTreeMap<u64, Value> = pairs.iter().map(|(k, v)| (k.low_u64(), *v)).collect();
    let mut map =
        ObliviousMap::<S, Z>::new_with_pairs(max_entries, &TEST_KEY, &pairs, &mut rng).unwrap();
    check_invariants(&mut map);
    assert_eq!(map.len(), max_entries);

    for _ in 0..num_operations {
        let key = rng.gen_range(1..=2 * max_entries);
        if rng.gen::<bool>() {
            let value = rng.gen::<Value>();
            let result = map.insert(Bid::from(key), value, &mut rng);
            if u64::try_from(mirror.len()).unwrap() < max_entries || mirror.contains_key(&key) {
                result.unwrap();
                mirror.insert(key, value);
            } else {
                // Only a new key is turned away from a full map.
                assert!(matches!(result, Err(OmapError::CapacityExceededError(_))));
            }
        } else {
            assert_eq!(
                map.delete(Bid::from(key), &mut rng).unwrap(),
                mirror.remove(&key).is_some()
            );
        }
        assert_eq!(map.len(), u64::try_from(mirror.len()).unwrap());
    }

    check_invariants(&mut map);
    let mut in_order = map.preorder_keys().unwrap();
    in_order.sort_unstable();
    assert_eq!(in_order, mirror.keys().copied().collect::<Vec<_>>());
    for (key, value) in &mirror {
        assert_eq!(map.find(Bid::from(*key), &mut rng).unwrap(), Some(*value));
    }
}

macro_rules! create_omap_correctness_test {
    ($function_name:ident, $store_type: ident, $bucket_size: expr, $max_entries:expr, $iterations_to_test: expr) => {
        paste::paste! {
            #[test]
            fn [<$function_name _ $store_type:snake _ $bucket_size _ $max_entries _ $iterations_to_test>]() {
                crate::test_utils::$function_name::<crate::bucket_store::$store_type, $bucket_size>($max_entries, $iterations_to_test);
            }
        }
    };
}

macro_rules! create_omap_correctness_tests {
    ($bucket_size: expr, $max_entries:expr, $iterations_to_test: expr) => {
        crate::test_utils::create_omap_correctness_test!(
            test_correctness_random_workload,
            MemoryBucketStore,
            $bucket_size,
            $max_entries,
            $iterations_to_test
        );
        crate::test_utils::create_omap_correctness_test!(
            test_correctness_bulk_loaded_workload,
            CountAccessesBucketStore,
            $bucket_size,
            $max_entries,
            $iterations_to_test
        );
    };
}

pub(crate) use create_omap_correctness_test;
pub(crate) use create_omap_correctness_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_avl_rotations() {
        let mut tree = ReferenceAvl::default();
        for key in [5, 2, 6, 1, 4, 7, 3] {
            tree.insert(key, value_of(key));
        }
        assert!(tree.delete(7));
        assert!(!tree.delete(7));
        assert_eq!(tree.preorder(), vec![4, 2, 1, 3, 5, 6]);
        assert_eq!(tree.find(3), Some(value_of(3)));
        assert_eq!(tree.len(), 6);
    }
}
