// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Keyed hashing: HMAC-SHA256 signatures and blind-index tokens.
//!
//! Signatures protect audit entries and storage checksums; blind-index
//! tokens allow equality search over ciphertext without ever persisting
//! plaintext. Verification is constant-time.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the scope and the word inside a blind-token MAC input.
/// A byte that survives NFKC and never appears in normalized search words.
const SCOPE_SEPARATOR: u8 = 0x1F;

/// Truncated blind-token length in bytes. 16 bytes keeps the index compact
/// while leaving collisions cryptographically negligible.
const BLIND_TOKEN_LEN: usize = 16;

/// Compute an HMAC-SHA256 signature over `data`.
pub fn sign(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 signature in constant time.
pub fn verify(key: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

/// Compute the blind-index token for one search word within a scope.
///
/// The scope (typically the field name) keys each field's index
/// independently: the same word in two fields yields unrelated tokens.
/// Input is NFKC-normalized and lowercased, so `Café` and `café` yield
/// the same token.
pub fn blind_token(key: &[u8; 32], scope: &str, word: &str) -> String {
    let normalized: String = word.nfkc().collect::<String>().to_lowercase();

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(scope.as_bytes());
    mac.update(&[SCOPE_SEPARATOR]);
    mac.update(normalized.as_bytes());
    let digest = mac.finalize().into_bytes();

    Base64UrlUnpadded::encode_string(&digest[..BLIND_TOKEN_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [9u8; 32];

    #[test]
    fn sign_and_verify() {
        let sig = sign(&KEY, b"audit entry bytes");
        assert!(verify(&KEY, b"audit entry bytes", &sig));
        assert!(!verify(&KEY, b"different bytes", &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let sig = sign(&KEY, b"payload");
        let other = [10u8; 32];
        assert!(!verify(&other, b"payload", &sig));
    }

    #[test]
    fn blind_token_is_deterministic() {
        assert_eq!(
            blind_token(&KEY, "journal_entry", "anxiety"),
            blind_token(&KEY, "journal_entry", "anxiety")
        );
    }

    #[test]
    fn blind_token_is_scope_isolated() {
        assert_ne!(
            blind_token(&KEY, "journal_entry", "anxiety"),
            blind_token(&KEY, "therapy_notes", "anxiety")
        );
    }

    #[test]
    fn blind_token_normalizes_case_and_unicode() {
        assert_eq!(
            blind_token(&KEY, "notes", "Caf\u{00e9}"),
            // U+0065 U+0301 composes to U+00E9 under NFKC
            blind_token(&KEY, "notes", "cafe\u{0301}")
        );
    }
}
