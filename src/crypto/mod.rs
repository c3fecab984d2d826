// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Cryptography Primitives
//!
//! Leaf module: every other subsystem builds on the primitives here.
//!
//! - `aead` - authenticated symmetric encryption (AES-256-GCM via *ring*)
//! - `keyed_hash` - HMAC-SHA256 signing, verification, and blind-index tokens
//! - `password` - Argon2id hashing for low-entropy secrets
//!
//! Key material never leaves this layer as anything but a [`aead::AeadKey`]
//! or a raw subkey handed to a keyed-hash construction. All randomness comes
//! from the operating system via `ring::rand::SystemRandom`.

pub mod aead;
pub mod keyed_hash;
pub mod password;

use ring::hkdf::{Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};

pub use aead::{Algorithm, AeadKey, SealedBox};
pub use keyed_hash::{blind_token, sign, verify};
pub use password::{HashedSecret, SecretHashError};

/// Domain separation salt for all HKDF derivations in this crate.
const HKDF_DOMAIN: &[u8] = b"haven-core/hkdf/v1";

/// Errors from cryptographic operations.
///
/// Deliberately coarse: callers never learn *why* an open failed, only that
/// the ciphertext is unusable.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,

    #[error("decryption failed or ciphertext was tampered with")]
    Open,

    #[error("key derivation failed")]
    Derive,

    #[error("system random generator unavailable")]
    Rng,

    #[error("malformed key material")]
    InvalidKey,
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut bytes = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CryptoError::Rng)?;
    Ok(bytes)
}

/// Generate an opaque URL-safe token of `len` random bytes.
pub fn random_token(len: usize) -> Result<String, CryptoError> {
    use base64ct::{Base64UrlUnpadded, Encoding};
    Ok(Base64UrlUnpadded::encode_string(&random_bytes(len)?))
}

/// Derive a 32-byte subkey from a master secret for the given context.
///
/// Contexts are free-form byte strings; distinct contexts yield independent
/// keys. This is the only way subsystems obtain key material from the
/// master-secret boundary.
pub fn derive_subkey(master: &[u8], context: &[u8]) -> Result<[u8; 32], CryptoError> {
    let salt = Salt::new(HKDF_SHA256, HKDF_DOMAIN);
    let prk = salt.extract(master);
    let info = [context];
    let okm = prk
        .expand(&info, HKDF_SHA256)
        .map_err(|_| CryptoError::Derive)?;
    let mut out = [0u8; 32];
    okm.fill(&mut out).map_err(|_| CryptoError::Derive)?;
    Ok(out)
}
