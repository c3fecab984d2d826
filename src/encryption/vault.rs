// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Token vault for field values that must never appear anywhere in the
//! clear: not in logs, not in responses, not in backups of the primary
//! record. The real ciphertext lives here; callers hold only an opaque
//! reference token.

use std::sync::Arc;

use crate::crypto;
use crate::storage::{CoreStorage, StorageError, StorageResult};

use super::engine::EncryptedField;

/// Prefix distinguishing vault tokens from other opaque strings.
const TOKEN_PREFIX: &str = "tok_";

/// Vault of tokenized ciphertext, one entry per token.
pub struct TokenVault {
    storage: Arc<CoreStorage>,
}

impl TokenVault {
    pub fn new(storage: Arc<CoreStorage>) -> Self {
        Self { storage }
    }

    /// Mint a fresh opaque token.
    pub fn mint_token(&self) -> Result<String, crypto::CryptoError> {
        Ok(format!("{TOKEN_PREFIX}{}", crypto::random_token(18)?))
    }

    /// Store ciphertext under a token. Overwrites an existing entry, which
    /// is how re-encryption migrates a vaulted value in place.
    pub fn store(&self, token: &str, field: &EncryptedField) -> StorageResult<()> {
        self.storage
            .write_json(self.storage.paths().vault_entry(token), field)
    }

    /// Fetch the ciphertext behind a token.
    pub fn fetch(&self, token: &str) -> StorageResult<EncryptedField> {
        let path = self.storage.paths().vault_entry(token);
        if !self.storage.exists(&path) {
            return Err(StorageError::NotFound(format!("vault token {token}")));
        }
        self.storage.read_json(path)
    }
}
