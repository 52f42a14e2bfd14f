// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A very simple demonstration of the use of an oblivious map.

extern crate omap;

use omap::{Bid, DefaultObliviousMap, OmapError};
use rand::{rngs::OsRng, RngCore};

fn main() -> Result<(), OmapError> {
    let mut rng = OsRng;
    let mut secret_key = [0u8; 16];
    rng.fill_bytes(&mut secret_key);

    let mut map = DefaultObliviousMap::new(64, &secret_key, &mut rng)?;
    map.insert(Bid::from(7u64), *b"seven...........", &mut rng)?;
    if let Some(value) = map.find(Bid::from(7u64), &mut rng)? {
        println!("{}", String::from_utf8_lossy(&value));
    }
    println!("Deleted: {}", map.delete(Bid::from(7u64), &mut rng)?);
    Ok(())
}
