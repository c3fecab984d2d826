// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Path constants and utilities for the persistent storage layout.

use std::path::{Path, PathBuf};

/// Default base directory for all persistent core state.
pub const DATA_ROOT: &str = "/var/lib/haven";

/// Storage path utilities for the core's durable state.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DATA_ROOT)
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all persistent data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Session Paths ==========

    /// Directory containing persisted sessions.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Path to a specific persisted session.
    pub fn session(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    // ========== Token Vault Paths ==========

    /// Directory containing token-vault entries.
    pub fn vault_dir(&self) -> PathBuf {
        self.root.join("vault")
    }

    /// Path to one vaulted ciphertext, addressed by its opaque token.
    pub fn vault_entry(&self, token: &str) -> PathBuf {
        self.vault_dir().join(format!("{token}.json"))
    }

    // ========== Blind Index Paths ==========

    /// Directory containing blind-index bucket files.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    /// Path to the blind-index buckets for one field.
    pub fn field_index(&self, field: &str) -> PathBuf {
        self.index_dir().join(format!("{field}.json"))
    }

    // ========== Audit Paths ==========

    /// Directory containing the audit database.
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// Path to the embedded audit database.
    pub fn audit_db(&self) -> PathBuf {
        self.audit_dir().join("audit.redb")
    }

    // ========== Subsystem Metadata Paths ==========

    /// Directory containing subsystem metadata snapshots.
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    /// Path to key-registry metadata (key identities only, never material).
    pub fn key_registry(&self) -> PathBuf {
        self.meta_dir().join("keys.json")
    }

    /// Path to the persisted reputation records.
    pub fn reputation(&self) -> PathBuf {
        self.meta_dir().join("reputation.json")
    }

    /// Path to the persisted token revocation set.
    pub fn revoked_tokens(&self) -> PathBuf {
        self.meta_dir().join("revoked.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_data_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new("/var/lib/haven"));
    }

    #[test]
    fn custom_root_for_testing() {
        let paths = StoragePaths::new("/tmp/test-data");
        assert_eq!(paths.root(), Path::new("/tmp/test-data"));
        assert_eq!(
            paths.session("sess-123"),
            PathBuf::from("/tmp/test-data/sessions/sess-123.json")
        );
    }

    #[test]
    fn session_paths_are_correct() {
        let paths = StoragePaths::default();
        assert_eq!(paths.sessions_dir(), PathBuf::from("/var/lib/haven/sessions"));
        assert_eq!(
            paths.session("s1"),
            PathBuf::from("/var/lib/haven/sessions/s1.json")
        );
    }

    #[test]
    fn vault_and_index_paths_are_correct() {
        let paths = StoragePaths::default();
        assert_eq!(
            paths.vault_entry("tok_abc"),
            PathBuf::from("/var/lib/haven/vault/tok_abc.json")
        );
        assert_eq!(
            paths.field_index("journal_entry"),
            PathBuf::from("/var/lib/haven/index/journal_entry.json")
        );
    }

    #[test]
    fn audit_and_meta_paths_are_correct() {
        let paths = StoragePaths::default();
        assert_eq!(paths.audit_db(), PathBuf::from("/var/lib/haven/audit/audit.redb"));
        assert_eq!(paths.key_registry(), PathBuf::from("/var/lib/haven/meta/keys.json"));
        assert_eq!(paths.reputation(), PathBuf::from("/var/lib/haven/meta/reputation.json"));
        assert_eq!(paths.revoked_tokens(), PathBuf::from("/var/lib/haven/meta/revoked.json"));
    }
}
