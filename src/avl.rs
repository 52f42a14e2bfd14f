// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious ordered map: an AVL tree stored in a Path ORAM.
//!
//! Every operation walks exactly `L` levels (the largest height an AVL tree of the
//! declared capacity can reach), fetching one node per level whether or not the walk
//! has already ended. Insert and delete then revisit all `L` levels bottom-up, and at
//! each one fetch the same seven nodes, evaluate every rotation case, and apply the
//! selected one with constant-time selection. Nodes are read from the ORAM into a
//! per-operation cache, and the cache is written back under fresh positions when
//! the operation finishes. The number and kind of ORAM accesses thus depend only on
//! the operation kind and the capacity.

use crate::{
    bid::Bid,
    bucket_store::{BucketStore, MemoryBucketStore},
    bulk_load::BulkLoader,
    crypto::{BucketCipher, SecretKey},
    ct::{conditional_assign_bytes, ct_max, select},
    node::Node,
    node_cache::NodeCache,
    path_oram::{PathOram, DEFAULT_BLOCKS_PER_BUCKET, DEFAULT_STASH_OVERFLOW_SIZE},
    utils::max_avl_height,
    BucketSize, Leaf, OmapError, StashSize, TreeHeight, Value, VALUE_SIZE,
};
use rand::{CryptoRng, RngCore};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};

// Taller bucket trees would need terabytes of memory. Smaller ones that still cannot be
// allocated are reported by the store.
const MAX_TREE_HEIGHT: TreeHeight = 32;

/// An oblivious map from 16-byte keys to 16-byte values.
///
/// ## Parameters
///
/// - Store type `S`: the untrusted memory holding the encrypted nodes.
/// - Bucket size `Z`: the number of nodes per Path ORAM bucket.
/// - `max_entries`: the largest number of keys the map may ever hold. It fixes the size
///     of the bucket tree and the number of levels every operation walks.
///
/// ## Security
///
/// Which paths of the bucket tree are accessed is independent of the keys and values
/// involved and of the shape of the tree. The number of stored keys is not hidden.
/// After a fatal error (stash overflow, failed authentication, or an internal
/// inconsistency) the map refuses every further operation.
#[derive(Debug)]
pub struct ObliviousMap<S: BucketStore, const Z: BucketSize> {
    oram: PathOram<S, Z>,
    cache: NodeCache,
    root: Bid,
    root_pos: Leaf,
    len: u64,
    max_entries: u64,
    /// Number of levels walked by every operation.
    max_depth: usize,
    poisoned: bool,
}

/// An `ObliviousMap` in memory, with the default bucket size.
pub type DefaultObliviousMap = ObliviousMap<MemoryBucketStore, DEFAULT_BLOCKS_PER_BUCKET>;

// What a root-to-leaf walk saw. Levels past the end of the walk hold `Bid::ZERO`.
struct Descent {
    path: Vec<Bid>,
    went_left: Vec<Choice>,
    found: Choice,
    target: Bid,
    value: Value,
}

#[derive(Clone, Copy)]
enum Rebalance {
    /// Cases are told apart by comparing the inserted key with the heavy child.
    Insertion(Bid),
    /// Cases are told apart by the balance of the heavy child.
    Deletion,
}

impl<S: BucketStore, const Z: BucketSize> ObliviousMap<S, Z> {
    /// Returns an empty map able to hold `max_entries` keys, with the default stash size.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `max_entries` is less than 2 or too large to allocate.
    pub fn new<R: RngCore + CryptoRng>(
        max_entries: u64,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> Result<Self, OmapError> {
        Self::new_with_parameters(max_entries, secret_key, DEFAULT_STASH_OVERFLOW_SIZE, rng)
    }

    /// Returns an empty map whose stash holds up to `overflow_size` blocks between accesses.
    pub fn new_with_parameters<R: RngCore + CryptoRng>(
        max_entries: u64,
        secret_key: &SecretKey,
        overflow_size: StashSize,
        rng: &mut R,
    ) -> Result<Self, OmapError> {
        Self::build(max_entries, secret_key, overflow_size, &[], rng)
    }

    /// Returns a map holding `pairs`, built in one pass without per-key insertions.
    ///
    /// # Errors
    ///
    /// Besides the errors of `new`, fails if a key is zero or repeated, or if there are
    /// more than `max_entries` pairs.
    pub fn new_with_pairs<R: RngCore + CryptoRng>(
        max_entries: u64,
        secret_key: &SecretKey,
        pairs: &[(Bid, Value)],
        rng: &mut R,
    ) -> Result<Self, OmapError> {
        Self::build(max_entries, secret_key, DEFAULT_STASH_OVERFLOW_SIZE, pairs, rng)
    }

    fn build<R: RngCore + CryptoRng>(
        max_entries: u64,
        secret_key: &SecretKey,
        overflow_size: StashSize,
        pairs: &[(Bid, Value)],
        rng: &mut R,
    ) -> Result<Self, OmapError> {
        log::info!(
            "ObliviousMap::new(max_entries = {}, initial entries = {})",
            max_entries,
            pairs.len()
        );

        if max_entries < 2 {
            return Err(OmapError::InvalidConfigurationError);
        }
        if u64::try_from(pairs.len())? > max_entries {
            return Err(OmapError::CapacityExceededError(max_entries));
        }

        let height = PathOram::<S, Z>::tree_height(max_entries);
        if height > MAX_TREE_HEIGHT {
            return Err(OmapError::InvalidConfigurationError);
        }

        let cipher = BucketCipher::new(secret_key)?;
        let loaded = BulkLoader::<Z>::new(height, rng)?.load(pairs, &cipher, rng)?;
        let oram = PathOram::from_layout(loaded.layout, cipher, height, overflow_size)?;
        let max_depth = usize::try_from(max_avl_height(max_entries))?;

        Ok(Self {
            oram,
            cache: NodeCache::default(),
            root: loaded.root,
            root_pos: loaded.root_pos,
            len: loaded.len,
            max_entries,
            max_depth,
            poisoned: false,
        })
    }

    /// The number of keys stored.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no key is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The capacity the map was created with.
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// The number of levels every operation walks.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The number of ORAM path accesses performed since construction.
    pub fn path_accesses(&self) -> u64 {
        self.oram.path_accesses()
    }

    /// The untrusted memory holding the tree.
    pub fn physical_memory(&self) -> &S {
        self.oram.physical_memory()
    }

    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidKeyError` if `key` is zero. Other errors are fatal.
    pub fn find<R: RngCore + CryptoRng>(
        &mut self,
        key: Bid,
        rng: &mut R,
    ) -> Result<Option<Value>, OmapError> {
        Self::check_key(&key)?;
        self.start_operation("find")?;
        let result = self.find_inner(&key, rng);
        let descent = self.poison_on_error(result)?;

        if bool::from(descent.found) {
            Ok(Some(descent.value))
        } else {
            Ok(None)
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidKeyError` if `key` is zero, and a `CapacityExceededError` if `key`
    /// is absent and the map already holds `max_entries` keys. A rejected insertion performs
    /// the same accesses as an accepted one and leaves the map usable. Other errors are fatal.
    pub fn insert<R: RngCore + CryptoRng>(
        &mut self,
        key: Bid,
        value: Value,
        rng: &mut R,
    ) -> Result<(), OmapError> {
        Self::check_key(&key)?;
        self.start_operation("insert")?;
        let result = self.insert_inner(&key, &value, rng);
        let rejected = self.poison_on_error(result)?;
        if bool::from(rejected) {
            return Err(OmapError::CapacityExceededError(self.max_entries));
        }
        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidKeyError` if `key` is zero. Other errors are fatal.
    pub fn delete<R: RngCore + CryptoRng>(
        &mut self,
        key: Bid,
        rng: &mut R,
    ) -> Result<bool, OmapError> {
        Self::check_key(&key)?;
        self.start_operation("delete")?;
        let result = self.delete_inner(&key, rng);
        let removed = self.poison_on_error(result)?;
        Ok(bool::from(removed))
    }

    fn check_key(key: &Bid) -> Result<(), OmapError> {
        if key.is_zero() {
            return Err(OmapError::InvalidKeyError);
        }
        Ok(())
    }

    fn poison_on_error<T>(&mut self, result: Result<T, OmapError>) -> Result<T, OmapError> {
        if let Err(error) = &result {
            log::error!("Disabling the map after a fatal error: {}", error);
            self.poisoned = true;
        }
        result
    }

    fn start_operation(&mut self, kind: &str) -> Result<(), OmapError> {
        if self.poisoned {
            return Err(OmapError::PoisonedError);
        }
        log::debug!("Starting {}", kind);
        self.cache = NodeCache::with_capacity(12 * self.max_depth + 8);
        Ok(())
    }

    // Writes every cached node back under a fresh position, repointing parents (and the
    // root) at the new positions. Superseded and deleted entries become dummy writes.
    fn finish_operation<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), OmapError> {
        let write_count = self.cache.len();
        let mut entries = self.cache.drain_live();
        for (_, node) in entries.iter_mut() {
            node.pos = self.oram.random_leaf(rng);
        }

        let fresh_positions: Vec<(Choice, Bid, Leaf)> = entries
            .iter()
            .map(|(live, node)| (*live, node.key, node.pos))
            .collect();
        for (_, node) in entries.iter_mut() {
            for (live, key, pos) in &fresh_positions {
                node.left_pos.conditional_assign(pos, *live & node.left_id.ct_eq(key));
                node.right_pos.conditional_assign(pos, *live & node.right_id.ct_eq(key));
            }
        }
        for (live, key, pos) in &fresh_positions {
            self.root_pos.conditional_assign(pos, *live & self.root.ct_eq(key));
        }

        for (live, node) in &entries {
            self.oram.write(node, !*live, rng)?;
        }

        log::debug!("Finished operation with {} writes", write_count);
        Ok(())
    }

    // Returns the latest version of node `id`, from the cache if it was already fetched during
    // this operation and from the ORAM (at `position`) otherwise. Costs one ORAM read either way.
    fn fetch<R: RngCore + CryptoRng>(
        &mut self,
        id: &Bid,
        position: Leaf,
        is_dummy: Choice,
        rng: &mut R,
    ) -> Result<Node, OmapError> {
        let is_dummy = is_dummy | id.ct_is_zero();
        let (cached, cached_node) = self.cache.get(id);
        let cached = cached & !is_dummy;

        // A cached node is no longer in the ORAM, so its old position must not be revealed again.
        let random_position = self.oram.random_leaf(rng);
        let position = Leaf::conditional_select(&position, &random_position, cached);
        let (stored, stored_node) = self.oram.read(id, position, is_dummy, rng)?;

        if bool::from(cached & stored) {
            return Err(OmapError::CacheInconsistencyError);
        }
        if bool::from(!is_dummy & !cached & !stored) {
            return Err(OmapError::MissingNodeError);
        }

        self.cache.put(&stored_node, !stored);
        let node = select(cached, &cached_node, &stored_node);
        Ok(select(is_dummy, &Node::dummy(), &node))
    }

    // Walks `max_depth` levels from the root toward `key`. With `to_successor`, a walk that
    // finds `key` at a node with two children continues to that node's in-order successor.
    fn descend<R: RngCore + CryptoRng>(
        &mut self,
        key: &Bid,
        to_successor: bool,
        rng: &mut R,
    ) -> Result<Descent, OmapError> {
        let follow_successor = Choice::from(u8::from(to_successor));
        let mut path = Vec::with_capacity(self.max_depth);
        let mut went_left = Vec::with_capacity(self.max_depth);
        let mut found: Choice = 0.into();
        let mut target = Bid::ZERO;
        let mut value = [0u8; VALUE_SIZE];

        let mut current_id = self.root;
        let mut current_pos = self.root_pos;
        let mut searching = !self.root.ct_is_zero();
        let mut successor: Choice = 0.into();

        for _ in 0..self.max_depth {
            let walking = searching | successor;
            let node = self.fetch(&current_id, current_pos, !walking, rng)?;

            let ordering = key.ct_cmp(&node.key);
            let is_equal = searching & ordering.ct_eq(&0);
            // Toward `key` while searching, right once at `key`, then leftmost.
            let go_left = (searching & ordering.ct_eq(&-1)) | successor;

            path.push(Bid::conditional_select(&Bid::ZERO, &node.key, walking));
            went_left.push(go_left);
            found |= is_equal;
            target.conditional_assign(&node.key, is_equal);
            conditional_assign_bytes(&mut value, &node.value, is_equal);

            let (next_id, next_pos) = node.child(go_left);
            let has_next = !next_id.ct_is_zero();
            let has_two_children = !node.left_id.ct_is_zero() & !node.right_id.ct_is_zero();

            searching = searching & !is_equal & has_next;
            successor = ((is_equal & has_two_children & follow_successor) | successor) & has_next;

            let continues = searching | successor;
            current_id = Bid::conditional_select(&Bid::ZERO, &next_id, continues);
            current_pos = Leaf::conditional_select(&0, &next_pos, continues);
        }

        Ok(Descent {
            path,
            went_left,
            found,
            target,
            value,
        })
    }

    fn find_inner<R: RngCore + CryptoRng>(
        &mut self,
        key: &Bid,
        rng: &mut R,
    ) -> Result<Descent, OmapError> {
        let descent = self.descend(key, false, rng)?;
        self.finish_operation(rng)?;
        Ok(descent)
    }

    fn insert_inner<R: RngCore + CryptoRng>(
        &mut self,
        key: &Bid,
        value: &Value,
        rng: &mut R,
    ) -> Result<Choice, OmapError> {
        let descent = self.descend(key, false, rng)?;
        let found = descent.found;
        // Updates are always admitted; a new key only while there is room.
        let has_room = Choice::from(u8::from(self.len < self.max_entries));
        let admit = found | has_room;
        let added = !found & admit;

        // Update in place, or hang a new leaf below the last node of the walk.
        let (_, mut node) = self.cache.get(key);
        node.value = *value;
        let node = select(found, &node, &Node::new(*key, *value));
        self.cache.put(&node, !admit);

        let active: Vec<Choice> = descent.path.iter().map(|id| !id.ct_is_zero()).collect();
        self.rebalance(
            &descent,
            &active,
            Rebalance::Insertion(*key),
            added,
            (*key, 0),
            rng,
        )?;

        self.len += u64::from(added.unwrap_u8());
        self.finish_operation(rng)?;
        Ok(!admit)
    }

    fn delete_inner<R: RngCore + CryptoRng>(
        &mut self,
        key: &Bid,
        rng: &mut R,
    ) -> Result<Choice, OmapError> {
        let mut descent = self.descend(key, true, rng)?;
        let found = descent.found;
        let target = descent.target;

        // The node that leaves the tree is the last one on the walk: the target itself when it
        // has at most one child, its successor otherwise.
        let mut removed_id = Bid::ZERO;
        for id in &descent.path {
            removed_id.conditional_assign(id, !id.ct_is_zero());
        }
        let removed = self.fetch(&removed_id, 0, !found, rng)?;
        let target_node = self.fetch(&target, 0, !found, rng)?;
        let swap = found & !target.ct_eq(&removed_id);
        let (orphan_id, orphan_pos) = removed.child(!removed.left_id.ct_is_zero());

        // The target's node takes over the successor's key and value.
        let mut replacement = target_node;
        replacement.key = removed.key;
        replacement.value = removed.value;
        self.cache.tombstone(&target, !swap);
        self.cache.tombstone(&removed_id, !found);
        self.cache.put(&replacement, !swap);
        for id in descent.path.iter_mut() {
            let is_target = swap & id.ct_eq(&target);
            id.conditional_assign(&removed.key, is_target);
        }

        // Every level above the removed node is rebuilt.
        let depth = descent.path.len();
        let mut active = Vec::with_capacity(depth);
        for level in 0..depth {
            let next_is_real = match descent.path.get(level + 1) {
                Some(id) => !id.ct_is_zero(),
                None => 0.into(),
            };
            active.push(!descent.path[level].ct_is_zero() & (!found | next_is_real));
        }
        self.rebalance(
            &descent,
            &active,
            Rebalance::Deletion,
            found,
            (orphan_id, orphan_pos),
            rng,
        )?;

        self.len -= u64::from(found.unwrap_u8());
        self.finish_operation(rng)?;
        Ok(found)
    }

    // Visits every level bottom-up. At an active level the node adopts `below` as the child on
    // the walk's side (once `link` is set), recomputes its height, and is rotated if unbalanced;
    // the root of the resulting subtree becomes `below` for the level above.
    fn rebalance<R: RngCore + CryptoRng>(
        &mut self,
        descent: &Descent,
        active: &[Choice],
        rule: Rebalance,
        mut link: Choice,
        mut below: (Bid, Leaf),
        rng: &mut R,
    ) -> Result<(), OmapError> {
        for level in (0..descent.path.len()).rev() {
            let is_active = active[level];

            let mut top = self.fetch(&descent.path[level], 0, !is_active, rng)?;
            top.set_child(descent.went_left[level], &below.0, below.1, is_active & link);

            let left = self.fetch(&top.left_id, top.left_pos, !is_active, rng)?;
            let right = self.fetch(&top.right_id, top.right_pos, !is_active, rng)?;
            let (left_height, right_height) = (left.height, right.height);
            top.height = 1 + ct_max(left_height, right_height);

            let left_heavy = left_height.ct_gt(&(right_height + 1));
            let right_heavy = right_height.ct_gt(&(left_height + 1));
            let rotating = is_active & (left_heavy | right_heavy);

            let heavy = select(left_heavy, &left, &right);
            let heavy_left = self.fetch(&heavy.left_id, heavy.left_pos, !rotating, rng)?;
            let heavy_right = self.fetch(&heavy.right_id, heavy.right_pos, !rotating, rng)?;
            // The outer grandchild is on the same side as the heavy child.
            let outer = select(left_heavy, &heavy_left, &heavy_right);
            let inner = select(left_heavy, &heavy_right, &heavy_left);

            let (ll, lr, rr, rl) = match rule {
                Rebalance::Insertion(key) => (
                    left_heavy & key.ct_lt(&left.key),
                    left_heavy & key.ct_gt(&left.key),
                    right_heavy & key.ct_gt(&right.key),
                    right_heavy & key.ct_lt(&right.key),
                ),
                Rebalance::Deletion => (
                    left_heavy & !heavy_right.height.ct_gt(&heavy_left.height),
                    left_heavy & heavy_right.height.ct_gt(&heavy_left.height),
                    right_heavy & !heavy_left.height.ct_gt(&heavy_right.height),
                    right_heavy & heavy_left.height.ct_gt(&heavy_right.height),
                ),
            };
            let single = is_active & (ll | rr);
            let double = is_active & (lr | rl);

            let inner_left = self.fetch(&inner.left_id, inner.left_pos, !double, rng)?;
            let inner_right = self.fetch(&inner.right_id, inner.right_pos, !double, rng)?;

            // z is the unbalanced node, y its heavy child and x the inner grandchild.
            let mut z = top;
            let mut y = heavy;
            let mut x = inner;

            // Single rotation: y rises above z, which adopts y's inner child.
            let (y_inner_id, y_inner_pos) = heavy.child(!left_heavy);
            z.set_child(left_heavy, &y_inner_id, y_inner_pos, single);
            y.set_child(!left_heavy, &top.key, top.pos, single);

            // Double rotation: x rises above both; y and z each adopt the child of x facing them.
            let (x_y_side_id, x_y_side_pos) = inner.child(left_heavy);
            let (x_z_side_id, x_z_side_pos) = inner.child(!left_heavy);
            y.set_child(!left_heavy, &x_y_side_id, x_y_side_pos, double);
            z.set_child(left_heavy, &x_z_side_id, x_z_side_pos, double);
            x.set_child(left_heavy, &heavy.key, heavy.pos, double);
            x.set_child(!left_heavy, &top.key, top.pos, double);

            let other_height = select(left_heavy, &right_height, &left_height);
            let x_y_side_height = select(left_heavy, &inner_left.height, &inner_right.height);
            let x_z_side_height = select(left_heavy, &inner_right.height, &inner_left.height);

            let z_single = 1 + ct_max(inner.height, other_height);
            let y_single = 1 + ct_max(outer.height, z_single);
            let y_double = 1 + ct_max(outer.height, x_y_side_height);
            let z_double = 1 + ct_max(x_z_side_height, other_height);
            let x_double = 1 + ct_max(y_double, z_double);
            z.height.conditional_assign(&z_single, single);
            z.height.conditional_assign(&z_double, double);
            y.height.conditional_assign(&y_single, single);
            y.height.conditional_assign(&y_double, double);
            x.height.conditional_assign(&x_double, double);

            self.cache.put(&z, !is_active);
            self.cache.put(&y, !(single | double));
            self.cache.put(&x, !double);

            let subtree_root = select(double, &x, &select(single, &y, &z));
            below.0.conditional_assign(&subtree_root.key, is_active);
            below.1.conditional_assign(&subtree_root.pos, is_active);
            link |= is_active;
        }

        self.root.conditional_assign(&below.0, link);
        self.root_pos.conditional_assign(&below.1, link);
        Ok(())
    }

    pub(crate) fn root(&self) -> (Bid, Leaf) {
        (self.root, self.root_pos)
    }

    /// Reads node `id` at `position` without moving it. Not oblivious.
    pub(crate) fn peek(&mut self, id: &Bid, position: Leaf) -> Result<Node, OmapError> {
        if self.poisoned {
            return Err(OmapError::PoisonedError);
        }
        self.oram
            .peek(id, position)?
            .ok_or(OmapError::MissingNodeError)
    }

    /// The keys in preorder, each reduced to its low 64 bits. Not oblivious; for diagnostics.
    pub fn preorder_keys(&mut self) -> Result<Vec<u64>, OmapError> {
        let mut result = Vec::new();
        let mut pending = vec![self.root()];
        while let Some((id, pos)) = pending.pop() {
            if id.is_zero() {
                continue;
            }
            let node = self.peek(&id, pos)?;
            result.push(node.key.low_u64());
            pending.push((node.right_id, node.right_pos));
            pending.push((node.left_id, node.left_pos));
        }
        Ok(result)
    }

    /// Renders the tree sideways, right subtrees on top, one key per line. Not oblivious.
    pub fn format_tree(&mut self) -> Result<String, OmapError> {
        let mut output = String::new();
        let (root, root_pos) = self.root();
        self.format_subtree(&root, root_pos, 0, &mut output)?;
        Ok(output)
    }

    fn format_subtree(
        &mut self,
        id: &Bid,
        pos: Leaf,
        indent: usize,
        output: &mut String,
    ) -> Result<(), OmapError> {
        if id.is_zero() {
            return Ok(());
        }
        let node = self.peek(id, pos)?;
        self.format_subtree(&node.right_id, node.right_pos, indent + 4, output)?;
        output.push_str(&format!("{:indent$}{} (h={})\n", "", node.key, node.height, indent = indent));
        self.format_subtree(&node.left_id, node.left_pos, indent + 4, output)
    }

    /// Prints `format_tree` to standard output.
    pub fn print_tree(&mut self) -> Result<(), OmapError> {
        print!("{}", self.format_tree()?);
        Ok(())
    }
}
