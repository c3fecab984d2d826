// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Argon2id hashing for low-entropy secrets.
//!
//! Used for human-verification challenge answers and any other secret a
//! person can type: memory-hard hashing keeps offline brute force
//! expensive even when the stored hash leaks. Verification is
//! constant-time inside the argon2 crate.

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::rngs::OsRng;
use unicode_normalization::UnicodeNormalization;

/// Hashing/verification errors.
#[derive(Debug, thiserror::Error)]
pub enum SecretHashError {
    #[error("secret hashing failed: {0}")]
    HashingFailed(String),

    #[error("invalid secret hash format")]
    InvalidHashFormat,
}

/// An Argon2id hash in PHC string format, safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HashedSecret(String);

impl HashedSecret {
    /// Hash a secret. Input is NFKC-normalized first so visually identical
    /// answers verify regardless of the client's input method.
    pub fn hash(secret: &str) -> Result<Self, SecretHashError> {
        let normalized: String = secret.nfkc().collect();
        let salt = SaltString::generate(OsRng);
        let hash = Argon2::default()
            .hash_password(normalized.as_bytes(), &salt)
            .map_err(|e| SecretHashError::HashingFailed(e.to_string()))?;
        Ok(Self(hash.to_string()))
    }

    /// Reconstruct from a stored PHC string.
    pub fn from_phc_string(s: impl Into<String>) -> Result<Self, SecretHashError> {
        let hash = s.into();
        PasswordHash::new(&hash).map_err(|_| SecretHashError::InvalidHashFormat)?;
        Ok(Self(hash))
    }

    /// The PHC string for storage.
    pub fn as_phc_string(&self) -> &str {
        &self.0
    }

    /// Verify a candidate secret against this hash.
    pub fn verify(&self, candidate: &str) -> bool {
        let normalized: String = candidate.nfkc().collect();
        let parsed = match PasswordHash::new(&self.0) {
            Ok(h) => h,
            Err(_) => return false,
        };
        Argon2::default()
            .verify_password(normalized.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hashed = HashedSecret::hash("seven green apples").unwrap();
        assert!(hashed.verify("seven green apples"));
        assert!(!hashed.verify("eight green apples"));
    }

    #[test]
    fn phc_string_roundtrip() {
        let hashed = HashedSecret::hash("answer-42").unwrap();
        let restored = HashedSecret::from_phc_string(hashed.as_phc_string()).unwrap();
        assert!(restored.verify("answer-42"));
    }

    #[test]
    fn invalid_phc_string_is_rejected() {
        assert!(HashedSecret::from_phc_string("not-a-hash").is_err());
    }

    #[test]
    fn nfkc_normalization_applies_both_ways() {
        // "é" precomposed vs combining form
        let hashed = HashedSecret::hash("caf\u{00e9}").unwrap();
        assert!(hashed.verify("cafe\u{0301}"));
    }
}
