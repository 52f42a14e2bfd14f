// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Utilities.

use crate::{Leaf, OmapError, TreeHeight, TreeIndex};
use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng, RngCore};

use subtle::{Choice, ConditionallySelectable, ConstantTimeGreater, ConstantTimeLess};

// Buckets are numbered in heap order: the root is 1 and the children of `i` are `2i` and `2i + 1`.
// The depth of an index is therefore the position of its highest set bit, and the ancestors of a
// bucket are its bit prefixes.

/// The depth of bucket `index` (0 for the root).
pub(crate) fn bucket_depth(index: TreeIndex) -> TreeHeight {
    TreeHeight::from(index.checked_ilog2().unwrap_or(0))
}

/// The bucket at `depth` on the path from the root to the leaf bucket `leaf_index`.
pub(crate) fn bucket_on_path(leaf_index: TreeIndex, depth: TreeHeight, height: TreeHeight) -> TreeIndex {
    leaf_index >> (height - depth)
}

/// The depth of the deepest bucket shared by the paths to leaves `a` and `b`.
///
/// Leaf numbers have `height` bits, so the paths part at the highest bit where they differ.
pub(crate) fn shared_path_depth(a: Leaf, b: Leaf, height: TreeHeight) -> TreeHeight {
    let differing_bits = Leaf::BITS - (a ^ b).leading_zeros();
    height - TreeHeight::from(differing_bits)
}

/// An empty Vec with room for `capacity` elements, or an error if they cannot be allocated.
pub(crate) fn try_with_capacity<T>(capacity: u64) -> Result<Vec<T>, OmapError> {
    let mut result = Vec::new();
    result
        .try_reserve_exact(usize::try_from(capacity)?)
        .map_err(|_| OmapError::InvalidConfigurationError)?;
    Ok(result)
}

/// The heap index of the bucket holding `leaf` in a tree of height `height`.
pub(crate) fn leaf_tree_index(leaf: Leaf, height: TreeHeight) -> TreeIndex {
    (1u64 << height) + leaf
}

pub(crate) fn random_leaf<R: RngCore + CryptoRng>(height: TreeHeight, rng: &mut R) -> Leaf {
    rng.gen_range(0..(1u64 << height))
}

/// The smallest `d` such that `2^d >= n`.
pub(crate) fn ceil_log2(n: u64) -> u64 {
    if n <= 1 {
        0
    } else {
        u64::from(64 - (n - 1).leading_zeros())
    }
}

/// The largest height an AVL tree with at most `max_entries` nodes can reach.
///
/// The sparsest AVL tree of height `h` has `N(h) = N(h - 1) + N(h - 2) + 1` nodes, with
/// `N(0) = 0` and `N(1) = 1`; the bound is the largest `h` with `N(h) <= max_entries`.
pub(crate) fn max_avl_height(max_entries: u64) -> u64 {
    if max_entries == 0 {
        return 0;
    }
    let (mut previous, mut current) = (0u64, 1u64);
    let mut height = 1;
    loop {
        let next = current.saturating_add(previous).saturating_add(1);
        if next > max_entries {
            return height;
        }
        previous = current;
        current = next;
        height += 1;
    }
}

/// Sorts `items` in ascending order of `keys`, obliviously and in constant time.
///
/// This is bitonic sort generalized to any length: each half is sorted in opposite
/// directions and the result merged. The sequence of compared positions depends only on
/// `items.len()`. `keys` must have the same length as `items`.
pub(crate) fn bitonic_sort_by_keys<T: ConditionallySelectable, K: ConditionallySelectable + ConstantTimeLess>(
    items: &mut [T],
    keys: &mut [K],
) {
    sort_run(items, keys, 1.into());
}

fn sort_run<T: ConditionallySelectable, K: ConditionallySelectable + ConstantTimeLess>(
    items: &mut [T],
    keys: &mut [K],
    ascending: Choice,
) {
    if items.len() < 2 {
        return;
    }
    let half = items.len() / 2;
    {
        let (items_low, items_high) = items.split_at_mut(half);
        let (keys_low, keys_high) = keys.split_at_mut(half);
        sort_run(items_low, keys_low, !ascending);
        sort_run(items_high, keys_high, ascending);
    }
    merge_run(items, keys, ascending);
}

// `items` is bitonic. The stride is the largest power of two below the length, so the first
// part ends up holding the smaller (or larger) elements even when the length is odd.
fn merge_run<T: ConditionallySelectable, K: ConditionallySelectable + ConstantTimeLess>(
    items: &mut [T],
    keys: &mut [K],
    ascending: Choice,
) {
    if items.len() < 2 {
        return;
    }
    let stride = items.len().next_power_of_two() / 2;
    for low in 0..(items.len() - stride) {
        compare_exchange(items, keys, low, low + stride, ascending);
    }
    let (items_low, items_high) = items.split_at_mut(stride);
    let (keys_low, keys_high) = keys.split_at_mut(stride);
    merge_run(items_low, keys_low, ascending);
    merge_run(items_high, keys_high, ascending);
}

// Swaps positions `low < high` if they are out of order for the given direction.
fn compare_exchange<T: ConditionallySelectable, K: ConditionallySelectable + ConstantTimeLess>(
    items: &mut [T],
    keys: &mut [K],
    low: usize,
    high: usize,
    ascending: Choice,
) {
    let (keys_head, keys_tail) = keys.split_at_mut(high);
    let (first, second) = (&mut keys_head[low], &mut keys_tail[0]);
    let out_of_order = (ascending & first.ct_gt(second)) | (!ascending & first.ct_lt(second));
    K::conditional_swap(first, second, out_of_order);

    let (items_head, items_tail) = items.split_at_mut(high);
    T::conditional_swap(&mut items_head[low], &mut items_tail[0], out_of_order);
}

/// A shuffled list in which each of the `leaf_count` leaves appears exactly `copies` times.
///
/// # Errors
///
/// Returns an `InvalidConfigurationError` if the list cannot be allocated.
pub(crate) fn balanced_leaf_permutation<R: RngCore + CryptoRng>(
    leaf_count: u64,
    copies: u64,
    rng: &mut R,
) -> Result<Vec<Leaf>, OmapError> {
    let slot_count = leaf_count
        .checked_mul(copies)
        .ok_or(OmapError::InvalidConfigurationError)?;
    let mut permutation = try_with_capacity(slot_count)?;
    permutation.extend((0..slot_count).map(|slot| slot / copies));
    permutation.shuffle(rng);
    Ok(permutation)
}
