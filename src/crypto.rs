// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Authenticated encryption of buckets.
//!
//! A ciphertext is a fresh 12-byte nonce followed by the AES-128-GCM output
//! (plaintext-sized body and 16-byte tag). Every write re-encrypts under a new
//! nonce, so rewriting unchanged contents produces a different ciphertext.
//!
//! The heap index of the bucket is authenticated as associated data, so a ciphertext
//! moved to another bucket fails to decrypt. Replaying an older ciphertext of the
//! same bucket is not detected.

use crate::{OmapError, TreeIndex};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use rand::{CryptoRng, RngCore};

/// The size of the bucket encryption key.
pub const KEY_SIZE: usize = 16;
/// The size of the nonce prepended to each ciphertext.
pub const NONCE_SIZE: usize = 12;
/// The size of the authentication tag.
pub const TAG_SIZE: usize = 16;

/// The secret key under which every bucket is encrypted.
pub type SecretKey = [u8; KEY_SIZE];

/// Encrypts and authenticates buckets under a single secret key.
pub struct BucketCipher {
    cipher: Aes128Gcm,
}

impl BucketCipher {
    /// A cipher keyed by `secret_key`.
    pub fn new(secret_key: &SecretKey) -> Result<Self, OmapError> {
        let cipher = Aes128Gcm::new_from_slice(secret_key)
            .map_err(|_| OmapError::InvalidConfigurationError)?;
        Ok(Self { cipher })
    }

    /// The size of the ciphertext of a `plaintext_size`-byte plaintext.
    pub const fn ciphertext_size(plaintext_size: usize) -> usize {
        NONCE_SIZE + plaintext_size + TAG_SIZE
    }

    /// Encrypts `plaintext`, the contents of bucket `index`, under a fresh random nonce.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        plaintext: &[u8],
        index: TreeIndex,
        rng: &mut R,
    ) -> Result<Vec<u8>, OmapError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let payload = Payload {
            msg: plaintext,
            aad: &index.to_be_bytes(),
        };
        let body = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| OmapError::CryptoError)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + body.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&body);
        Ok(result)
    }

    /// Authenticates and decrypts a ciphertext that `encrypt` produced for bucket `index`.
    pub fn decrypt(&self, ciphertext: &[u8], index: TreeIndex) -> Result<Vec<u8>, OmapError> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(OmapError::CryptoError);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);
        let payload = Payload {
            msg: body,
            aad: &index.to_be_bytes(),
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| OmapError::CryptoError)
    }
}

impl std::fmt::Debug for BucketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BucketCipher")
    }
}
