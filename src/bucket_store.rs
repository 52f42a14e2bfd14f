// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Untrusted storage for encrypted buckets.

use crate::{
    utils::{bucket_depth, bucket_on_path, try_with_capacity},
    OmapError, TreeIndex,
};
use duplicate::duplicate_item;

/// The untrusted memory holding the bucket tree, one ciphertext per heap index `1..=bucket_count`.
pub trait BucketStore
where
    Self: Sized,
{
    /// Returns a store of `bucket_count` empty slots, each expecting `bucket_byte_size`-byte ciphertexts.
    fn new(bucket_count: u64, bucket_byte_size: usize) -> Result<Self, OmapError>;
    /// Returns the number of buckets stored by `self`.
    fn bucket_count(&self) -> u64;
    /// Returns the size of every stored ciphertext.
    fn bucket_byte_size(&self) -> usize;
    /// Reads the ciphertext stored at `index`.
    fn read_bucket(&mut self, index: TreeIndex) -> Result<Vec<u8>, OmapError>;
    /// Overwrites the ciphertext stored at `index`.
    fn write_bucket(&mut self, index: TreeIndex, ciphertext: Vec<u8>) -> Result<(), OmapError>;

    /// Reads the buckets on the path from the root to the leaf bucket `leaf_index`, root first.
    fn read_path(&mut self, leaf_index: TreeIndex) -> Result<Vec<Vec<u8>>, OmapError> {
        let height = bucket_depth(leaf_index);
        let mut result = Vec::with_capacity(usize::try_from(height + 1)?);
        for depth in 0..=height {
            result.push(self.read_bucket(bucket_on_path(leaf_index, depth, height))?);
        }
        Ok(result)
    }

    /// Writes the buckets on the path from the root to the leaf bucket `leaf_index`, root first.
    fn write_path(
        &mut self,
        leaf_index: TreeIndex,
        ciphertexts: Vec<Vec<u8>>,
    ) -> Result<(), OmapError> {
        let height = bucket_depth(leaf_index);
        if u64::try_from(ciphertexts.len())? != height + 1 {
            return Err(OmapError::BucketIndexError);
        }
        for (depth, ciphertext) in (0..=height).zip(ciphertexts) {
            self.write_bucket(bucket_on_path(leaf_index, depth, height), ciphertext)?;
        }
        Ok(())
    }

    /// Copies an initial layout into the store.
    fn populate(&mut self, buckets: Vec<(TreeIndex, Vec<u8>)>) -> Result<(), OmapError> {
        for (index, ciphertext) in buckets {
            self.write_bucket(index, ciphertext)?;
        }
        Ok(())
    }
}

/// A simple `BucketStore` that keeps its ciphertexts in a Vec.
#[derive(Debug)]
pub struct MemoryBucketStore {
    buckets: Vec<Vec<u8>>,
    bucket_count: u64,
    bucket_byte_size: usize,
}

impl MemoryBucketStore {
    fn slot(&self, index: TreeIndex) -> Result<usize, OmapError> {
        let slot = usize::try_from(index)?;
        if slot == 0 || slot > self.buckets.len() {
            return Err(OmapError::BucketIndexError);
        }
        Ok(slot - 1)
    }
}

impl BucketStore for MemoryBucketStore {
    fn new(bucket_count: u64, bucket_byte_size: usize) -> Result<Self, OmapError> {
        let mut buckets = try_with_capacity(bucket_count)?;
        buckets.resize(usize::try_from(bucket_count)?, Vec::new());
        Ok(Self {
            buckets,
            bucket_count,
            bucket_byte_size,
        })
    }

    fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    fn bucket_byte_size(&self) -> usize {
        self.bucket_byte_size
    }

    fn read_bucket(&mut self, index: TreeIndex) -> Result<Vec<u8>, OmapError> {
        let slot = self.slot(index)?;
        Ok(self.buckets[slot].clone())
    }

    fn write_bucket(&mut self, index: TreeIndex, ciphertext: Vec<u8>) -> Result<(), OmapError> {
        let slot = self.slot(index)?;
        if ciphertext.len() != self.bucket_byte_size {
            return Err(OmapError::BucketIndexError);
        }
        self.buckets[slot] = ciphertext;
        Ok(())
    }
}

/// A `BucketStore` that counts reads and writes, per bucket and per path.
#[derive(Debug)]
pub struct CountAccessesBucketStore {
    data: MemoryBucketStore,
    /// `reads[i]` tracks the total number of reads made to bucket `i + 1`.
    pub reads: Vec<u64>,
    /// `writes[i]` tracks the total number of writes made to bucket `i + 1`.
    pub writes: Vec<u64>,
    /// The number of whole paths read.
    pub path_reads: u64,
    /// The number of whole paths written.
    pub path_writes: u64,
}

impl CountAccessesBucketStore {
    /// Returns the total number of bucket reads.
    pub fn get_read_count(&self) -> u64 {
        self.reads.iter().sum()
    }

    /// Returns the total number of bucket writes.
    pub fn get_write_count(&self) -> u64 {
        self.writes.iter().sum()
    }
}

impl BucketStore for CountAccessesBucketStore {
    fn new(bucket_count: u64, bucket_byte_size: usize) -> Result<Self, OmapError> {
        let data = MemoryBucketStore::new(bucket_count, bucket_byte_size)?;
        let mut reads = try_with_capacity(bucket_count)?;
        reads.resize(usize::try_from(bucket_count)?, 0);
        let mut writes = try_with_capacity(bucket_count)?;
        writes.resize(usize::try_from(bucket_count)?, 0);
        Ok(Self {
            data,
            reads,
            writes,
            path_reads: 0,
            path_writes: 0,
        })
    }

    fn bucket_count(&self) -> u64 {
        self.data.bucket_count()
    }

    fn bucket_byte_size(&self) -> usize {
        self.data.bucket_byte_size()
    }

    fn read_bucket(&mut self, index: TreeIndex) -> Result<Vec<u8>, OmapError> {
        log::debug!("Physical read -- {}", index);

        let slot = self.data.slot(index)?;
        self.reads[slot] += 1;
        self.data.read_bucket(index)
    }

    fn write_bucket(&mut self, index: TreeIndex, ciphertext: Vec<u8>) -> Result<(), OmapError> {
        log::debug!("Physical write -- {}", index);

        let slot = self.data.slot(index)?;
        self.writes[slot] += 1;
        self.data.write_bucket(index, ciphertext)
    }

    fn read_path(&mut self, leaf_index: TreeIndex) -> Result<Vec<Vec<u8>>, OmapError> {
        self.path_reads += 1;
        let height = bucket_depth(leaf_index);
        let mut result = Vec::with_capacity(usize::try_from(height + 1)?);
        for depth in 0..=height {
            result.push(self.read_bucket(bucket_on_path(leaf_index, depth, height))?);
        }
        Ok(result)
    }

    fn write_path(
        &mut self,
        leaf_index: TreeIndex,
        ciphertexts: Vec<Vec<u8>>,
    ) -> Result<(), OmapError> {
        self.path_writes += 1;
        let height = bucket_depth(leaf_index);
        if u64::try_from(ciphertexts.len())? != height + 1 {
            return Err(OmapError::BucketIndexError);
        }
        for (depth, ciphertext) in (0..=height).zip(ciphertexts) {
            self.write_bucket(bucket_on_path(leaf_index, depth, height), ciphertext)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_logger;

    // Runs the same checks against every store type.
    #[duplicate_item(
        test_name                   store_type;
        [memory_store_layout]       [MemoryBucketStore];
        [counting_store_layout]     [CountAccessesBucketStore];
    )]
    #[test]
    fn test_name() {
        init_logger();

        let mut store = store_type::new(7, 3).unwrap();
        assert_eq!(store.bucket_count(), 7);
        assert_eq!(store.bucket_byte_size(), 3);

        for index in 1..=7u64 {
            store.write_bucket(index, vec![index as u8; 3]).unwrap();
        }
        assert_eq!(store.read_bucket(5).unwrap(), vec![5u8; 3]);

        // Leaf bucket 6 lies below 3 and the root.
        let path = store.read_path(6).unwrap();
        assert_eq!(path, vec![vec![1u8; 3], vec![3u8; 3], vec![6u8; 3]]);

        store.write_path(6, vec![vec![9u8; 3]; 3]).unwrap();
        assert_eq!(store.read_bucket(3).unwrap(), vec![9u8; 3]);
        assert_eq!(store.read_bucket(2).unwrap(), vec![2u8; 3]);

        assert!(matches!(store.read_bucket(0), Err(OmapError::BucketIndexError)));
        assert!(matches!(store.read_bucket(8), Err(OmapError::BucketIndexError)));
        assert!(store.write_bucket(1, vec![0u8; 4]).is_err());
        assert!(store.write_path(6, vec![vec![9u8; 3]; 2]).is_err());
    }

    #[test]
    fn counting_store_counts_paths_and_buckets() {
        let mut store = CountAccessesBucketStore::new(15, 1).unwrap();
        store
            .populate((1..=15u64).map(|index| (index, vec![0u8])).collect())
            .unwrap();
        assert_eq!(store.get_write_count(), 15);

        store.read_path(12).unwrap();
        store.read_path(15).unwrap();
        assert_eq!(store.path_reads, 2);
        assert_eq!(store.get_read_count(), 8);
        assert_eq!(store.reads[0], 2);

        store.write_path(9, vec![vec![1u8]; 4]).unwrap();
        assert_eq!(store.path_writes, 1);
        assert_eq!(store.get_write_count(), 19);
    }

    #[duplicate_item(
        test_name                       store_type;
        [oversized_memory_store]        [MemoryBucketStore];
        [oversized_counting_store]      [CountAccessesBucketStore];
    )]
    #[test]
    fn test_name() {
        // Fails cleanly instead of aborting the process.
        assert!(matches!(
            store_type::new(u64::MAX >> 1, 1000),
            Err(OmapError::InvalidConfigurationError)
        ));
    }
}
