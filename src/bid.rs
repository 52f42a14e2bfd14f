// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The fixed-width identifier used both as map key and as ORAM block identifier.

use crate::ct::ct_cmp;
use duplicate::duplicate_item;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};

/// The size in bytes of a `Bid`.
pub const BID_SIZE: usize = 16;

/// A 16-byte key, ordered as a big-endian unsigned integer.
/// The all-zero value is reserved to mean "no node".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bid([u8; BID_SIZE]);

impl Bid {
    /// The reserved absent identifier.
    pub const ZERO: Bid = Bid([0u8; BID_SIZE]);

    /// Instantiates a `Bid` from its big-endian bytes.
    pub fn new(bytes: [u8; BID_SIZE]) -> Self {
        Self(bytes)
    }

    /// The big-endian bytes of this identifier.
    pub fn as_bytes(&self) -> &[u8; BID_SIZE] {
        &self.0
    }

    /// Whether this is the absent sentinel. Not constant-time; for public data only.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whether this is the absent sentinel, in constant time.
    pub fn ct_is_zero(&self) -> Choice {
        self.ct_eq(&Self::ZERO)
    }

    /// Constant-time three-way comparison: -1, 0 or 1.
    pub fn ct_cmp(&self, other: &Self) -> i8 {
        ct_cmp(self, other)
    }

    /// The low 64 bits of the identifier, used by the diagnostics.
    pub fn low_u64(&self) -> u64 {
        self.halves().1
    }

    fn halves(&self) -> (u64, u64) {
        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&self.0[..8]);
        low.copy_from_slice(&self.0[8..]);
        (u64::from_be_bytes(high), u64::from_be_bytes(low))
    }
}

#[duplicate_item(
    int_type;
    [u8];
    [u16];
    [u32];
    [u64];
)]
impl From<int_type> for Bid {
    fn from(value: int_type) -> Self {
        let mut bytes = [0u8; BID_SIZE];
        bytes[BID_SIZE - 8..].copy_from_slice(&u64::from(value).to_be_bytes());
        Self(bytes)
    }
}

impl ConstantTimeEq for Bid {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0[..].ct_eq(&other.0[..])
    }
}

impl ConstantTimeGreater for Bid {
    fn ct_gt(&self, other: &Self) -> Choice {
        let (self_high, self_low) = self.halves();
        let (other_high, other_low) = other.halves();
        self_high.ct_gt(&other_high) | (self_high.ct_eq(&other_high) & self_low.ct_gt(&other_low))
    }
}

impl ConstantTimeLess for Bid {}

impl ConditionallySelectable for Bid {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        let mut result = Bid::ZERO;
        for i in 0..BID_SIZE {
            result.0[i] = u8::conditional_select(&a.0[i], &b.0[i], choice);
        }
        result
    }
}

impl std::fmt::Debug for Bid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (high, low) = self.halves();
        if high == 0 {
            write!(f, "Bid({})", low)
        } else {
            write!(f, "Bid({:#018x}{:016x})", high, low)
        }
    }
}

impl std::fmt::Display for Bid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (high, low) = self.halves();
        if high == 0 {
            write!(f, "{}", low)
        } else {
            write!(f, "{:#018x}{:016x}", high, low)
        }
    }
}
