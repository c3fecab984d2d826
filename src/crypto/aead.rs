// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Authenticated symmetric encryption.
//!
//! AES-256-GCM with a fresh random 96-bit nonce per seal. The associated
//! data binds a ciphertext to its logical context (field name, key id) so
//! a ciphertext copied between fields fails to open.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use zeroize::{Zeroize, ZeroizeOnDrop};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};

use super::{random_bytes, CryptoError};

/// Supported AEAD algorithms.
///
/// A tagged enum rather than a string so ciphertext metadata is
/// exhaustively matched at decrypt time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    Aes256Gcm,
}

impl Algorithm {
    pub fn nonce_len(&self) -> usize {
        match self {
            Algorithm::Aes256Gcm => NONCE_LEN,
        }
    }
}

/// A 256-bit symmetric key. Zeroized on drop; never serialized.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn unbound(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, &self.0).map_err(|_| CryptoError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AeadKey").field(&"[REDACTED]").finish()
    }
}

/// Nonce + ciphertext (tag appended) produced by [`seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key`, binding `aad` into the authentication tag.
pub fn seal(key: &AeadKey, aad: &[u8], plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    let nonce_bytes = random_bytes(NONCE_LEN)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.unbound()?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

    Ok(SealedBox {
        nonce,
        ciphertext: in_out,
    })
}

/// Decrypt a [`SealedBox`]. Fails closed on any tag or AAD mismatch.
pub fn open(key: &AeadKey, aad: &[u8], sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    let mut in_out = sealed.ciphertext.clone();
    let plaintext = key
        .unbound()?
        .open_in_place(
            Nonce::assume_unique_for_key(sealed.nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Open)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        AeadKey::new([42u8; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"field:diagnosis", b"generalized anxiety").unwrap();
        let opened = open(&key, b"field:diagnosis", &sealed).unwrap();
        assert_eq!(opened, b"generalized anxiety");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let key = test_key();
        let a = seal(&key, b"aad", b"same plaintext").unwrap();
        let b = seal(&key, b"aad", b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let key = test_key();
        let mut sealed = seal(&key, b"aad", b"secret").unwrap();
        sealed.ciphertext[0] ^= 0xFF;
        assert!(matches!(open(&key, b"aad", &sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn wrong_aad_fails_closed() {
        let key = test_key();
        let sealed = seal(&key, b"field:diagnosis", b"secret").unwrap();
        assert!(matches!(
            open(&key, b"field:medications", &sealed),
            Err(CryptoError::Open)
        ));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = seal(&test_key(), b"aad", b"secret").unwrap();
        let other = AeadKey::new([43u8; 32]);
        assert!(matches!(open(&other, b"aad", &sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = test_key();
        assert!(!format!("{key:?}").contains("42"));
    }
}
