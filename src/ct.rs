// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Constant-time selection and comparison helpers.
//!
//! Every data-dependent decision in the tree and the ORAM goes through these
//! functions (or through `subtle` directly), so control flow never depends on secret data.

use std::iter::zip;
use subtle::{Choice, ConditionallySelectable, ConstantTimeGreater, ConstantTimeLess};

/// Returns `if_true` when `condition` is set and `if_false` otherwise, without branching on `condition`.
pub(crate) fn select<T: ConditionallySelectable>(condition: Choice, if_true: &T, if_false: &T) -> T {
    T::conditional_select(if_false, if_true, condition)
}

/// Three-way comparison: -1 if `a < b`, 0 if `a == b`, 1 if `a > b`.
pub(crate) fn ct_cmp<T: ConstantTimeGreater + ConstantTimeLess>(a: &T, b: &T) -> i8 {
    let greater = i8::conditional_select(&0, &1, a.ct_gt(b));
    let less = i8::conditional_select(&0, &1, a.ct_lt(b));
    greater - less
}

pub(crate) fn ct_max(a: u32, b: u32) -> u32 {
    select(a.ct_gt(&b), &a, &b)
}

/// Overwrites `destination` with `source` when `choice` is set.
pub(crate) fn conditional_assign_bytes(destination: &mut [u8], source: &[u8], choice: Choice) {
    assert_eq!(destination.len(), source.len());
    for (d, s) in zip(destination.iter_mut(), source) {
        d.conditional_assign(s, choice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_picks_by_condition() {
        assert_eq!(select(1.into(), &3u64, &9u64), 3);
        assert_eq!(select(0.into(), &3u64, &9u64), 9);
    }

    #[test]
    fn three_way_compare() {
        assert_eq!(ct_cmp(&1u64, &2u64), -1);
        assert_eq!(ct_cmp(&2u64, &2u64), 0);
        assert_eq!(ct_cmp(&3u64, &2u64), 1);
    }

    #[test]
    fn max_of_heights() {
        assert_eq!(ct_max(0, 0), 0);
        assert_eq!(ct_max(4, 2), 4);
        assert_eq!(ct_max(2, 5), 5);
    }

    #[test]
    fn assign_bytes_only_when_chosen() {
        let mut destination = [1u8; 4];
        conditional_assign_bytes(&mut destination, &[2u8; 4], 0.into());
        assert_eq!(destination, [1u8; 4]);
        conditional_assign_bytes(&mut destination, &[2u8; 4], 1.into());
        assert_eq!(destination, [2u8; 4]);
    }
}
