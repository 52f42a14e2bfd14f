// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A simple interactive demonstration of an oblivious map from integers to short strings.

use omap::{Bid, DefaultObliviousMap};
use rand::{rngs::OsRng, RngCore};
use rustyline::history::FileHistory;
use rustyline::Editor;

fn parse_number(
    prompt: &str,
    rl: &mut Editor<(), FileHistory>,
) -> Result<u64, Box<dyn std::error::Error>> {
    Ok(loop {
        println!("{}", prompt);
        println!();
        let readline: String = rl.readline("> ")?;
        match readline.trim().parse::<u64>() {
            Ok(number) if number > 0 => break number,
            _ => {
                println!("Expected a positive number. Try again.");
                continue;
            }
        }
    })
}

// Truncates or zero-pads `text` to a value.
fn to_value(text: &str) -> [u8; 16] {
    let mut value = [0u8; 16];
    let bytes = text.as_bytes();
    let length = bytes.len().min(value.len());
    value[..length].copy_from_slice(&bytes[..length]);
    value
}

fn from_value(value: &[u8; 16]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .to_string()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = OsRng;
    let mut secret_key = [0u8; 16];
    rng.fill_bytes(&mut secret_key);

    let mut rl = Editor::<(), _>::new()?;

    let capacity = parse_number("How many keys would you like to store?", &mut rl)?;

    let mut map = DefaultObliviousMap::new(capacity, &secret_key, &mut rng)?;

    loop {
        let action = loop {
            println!("Enter an option (F, I, D or P):");
            println!("F) Find");
            println!("I) Insert");
            println!("D) Delete");
            println!("P) Print the tree");
            let action: String = rl.readline("> ")?;
            if !["F", "I", "D", "P"].contains(&action.as_str()) {
                println!("Try again.");
                continue;
            }
            break action;
        };

        if action == "P" {
            map.print_tree()?;
            continue;
        }

        let key = parse_number("What key?", &mut rl)?;

        match action.as_str() {
            "F" => match map.find(Bid::from(key), &mut rng)? {
                Some(value) => println!("Value at {} is {:?}.", key, from_value(&value)),
                None => println!("Key {} is not present.", key),
            },
            "I" => {
                println!("Value to store? (at most 16 bytes)");
                let text: String = rl.readline("> ")?;
                match map.insert(Bid::from(key), to_value(&text), &mut rng) {
                    Ok(()) => println!("Stored {:?} under key {}.", text, key),
                    Err(error) => println!("Could not insert: {}", error),
                }
            }
            _ => {
                if map.delete(Bid::from(key), &mut rng)? {
                    println!("Deleted key {}.", key);
                } else {
                    println!("Key {} is not present.", key);
                }
            }
        }
        println!("The map holds {} of at most {} keys.", map.len(), map.max_entries());
    }
}
