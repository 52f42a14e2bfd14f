// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The per-operation node cache.
//!
//! The cache is an append-only log: every put and every tombstone appends exactly one
//! entry, real or dummy, so its length after an operation depends only on the operation
//! kind. Lookups scan the whole log and the latest matching entry wins.

use crate::{bid::Bid, node::Node, VALUE_SIZE};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    node: Node,
    tombstone: u8,
}

#[derive(Debug, Default)]
pub(crate) struct NodeCache {
    log: Vec<CacheEntry>,
}

impl NodeCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Records the latest version of `node`. A dummy put appends an entry that matches nothing.
    pub fn put(&mut self, node: &Node, is_dummy: Choice) {
        let mut node = *node;
        node.conditional_mark_dummy(is_dummy);
        self.log.push(CacheEntry { node, tombstone: 0 });
    }

    /// Records that `id` was deleted.
    pub fn tombstone(&mut self, id: &Bid, is_dummy: Choice) {
        let mut node = Node::new(*id, [0u8; VALUE_SIZE]);
        node.conditional_mark_dummy(is_dummy);
        self.log.push(CacheEntry { node, tombstone: 1 });
    }

    /// The latest live version of `id`, if any.
    pub fn get(&self, id: &Bid) -> (Choice, Node) {
        let mut found = 0u8;
        let mut result = Node::dummy();

        for entry in &self.log {
            let is_match = !entry.node.ct_is_dummy() & entry.node.key.ct_eq(id);
            found.conditional_assign(&(1 - entry.tombstone), is_match);
            result.conditional_assign(&entry.node, is_match);
        }

        let found = Choice::from(found);
        (found, Node::conditional_select(&Node::dummy(), &result, found))
    }

    /// Empties the log, returning every entry together with whether it must be written back.
    ///
    /// An entry is live if it is real, is not a tombstone, and no later real entry has the same key.
    pub fn drain_live(&mut self) -> Vec<(Choice, Node)> {
        let mut result = Vec::with_capacity(self.log.len());

        for (i, entry) in self.log.iter().enumerate() {
            let mut superseded: Choice = 0.into();
            for later in &self.log[i + 1..] {
                superseded |= !later.node.ct_is_dummy() & later.node.key.ct_eq(&entry.node.key);
            }
            let live = !entry.node.ct_is_dummy() & !entry.tombstone.ct_eq(&1) & !superseded;
            result.push((live, entry.node));
        }

        self.log.clear();
        result
    }
}
