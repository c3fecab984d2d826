// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Key Registry
//!
//! Tracks key identities, versions, sensitivity tiers, and the rotation
//! schedule. The registry persists *metadata only*; raw key material is
//! derived on demand from the master-secret handle via HKDF and exists in
//! memory just long enough to seal or open a ciphertext. In production the
//! master secret comes from an external KMS boundary; the registry never
//! writes it to disk.
//!
//! ## Invariants
//!
//! - At most one *active* version per (tier, purpose).
//! - Rotation creates the successor version before deactivating the prior,
//!   so an in-flight encryption never observes a gap.
//! - Deactivated versions remain derivable until their grace-period expiry,
//!   after which ciphertext under them can no longer be decrypted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, AeadKey, Algorithm, CryptoError};
use crate::storage::{CoreStorage, StorageError};

/// Default rotation interval for active keys.
pub const DEFAULT_ROTATION_INTERVAL_DAYS: i64 = 90;

/// Default grace period during which a deactivated key still decrypts.
pub const DEFAULT_GRACE_PERIOD_DAYS: i64 = 30;

/// Sensitivity tier of the data a key protects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Critical,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
            Sensitivity::Critical => "critical",
        }
    }
}

/// What a key is used for. One active key exists per (tier, purpose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum KeyPurpose {
    /// AEAD encryption of field values.
    FieldData,
    /// Keyed hashing for the blind search index.
    SearchIndex,
    /// AEAD encryption of vaulted (tokenized) ciphertext.
    TokenVault,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::FieldData => "field-data",
            KeyPurpose::SearchIndex => "search-index",
            KeyPurpose::TokenVault => "token-vault",
        }
    }

    /// Whether the scheduled sweep rotates this family. Blind-index tokens
    /// do not record a key version, so rotating the search-index key would
    /// orphan every existing bucket; that rotation is a reindexing
    /// migration, not a sweep.
    pub fn rotates_on_schedule(&self) -> bool {
        !matches!(self, KeyPurpose::SearchIndex)
    }
}

/// Stable identifier for the (tier, purpose) key family.
pub fn key_id(tier: Sensitivity, purpose: KeyPurpose) -> String {
    format!("hk-{}-{}", purpose.as_str(), tier.as_str())
}

/// Metadata for one key version. Never contains key material.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KeyMetadata {
    pub key_id: String,
    pub tier: Sensitivity,
    pub purpose: KeyPurpose,
    pub version: u32,
    pub algorithm: Algorithm,
    pub created_at: DateTime<Utc>,
    /// When this version was deactivated by rotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    /// Grace-period expiry; set at deactivation. Past this instant the
    /// version no longer derives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Outcome of one (tier, purpose) rotation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RotationEvent {
    pub key_id: String,
    pub retired_version: u32,
    pub new_version: u32,
}

/// Key registry errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("unknown key {key_id} v{version}")]
    NotFound { key_id: String, version: u32 },

    #[error("key {key_id} v{version} is past its grace period")]
    Expired { key_id: String, version: u32 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The master secret handle. Zeroized on drop; never serialized.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode from standard base64 (the `HAVEN_MASTER_KEY` format).
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Base64::decode_vec(encoded.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random master secret (development / tests).
    pub fn generate() -> Result<Self, CryptoError> {
        let bytes = crypto::random_bytes(32)?;
        let bytes: [u8; 32] = bytes.try_into().expect("requested 32 bytes");
        Ok(Self(bytes))
    }

    /// Derive a named subkey directly from the master secret. Used for the
    /// handful of keys needed before (or outside) the registry: storage
    /// integrity, session-token signing, MFA code MACs, audit-entry
    /// signatures.
    pub fn subkey(&self, context: &[u8]) -> Result<[u8; 32], CryptoError> {
        crypto::derive_subkey(&self.0, context)
    }

    /// Derive the storage-integrity subkey. Needed before the registry
    /// itself can be constructed, since the registry persists through
    /// checksummed storage.
    pub fn storage_integrity_key(&self) -> Result<[u8; 32], CryptoError> {
        self.subkey(b"storage-integrity")
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterSecret").field(&"[REDACTED]").finish()
    }
}

/// Persisted registry snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    keys: Vec<KeyMetadata>,
}

/// Rotation schedule configuration.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub interval: Duration,
    pub grace_period: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::days(DEFAULT_ROTATION_INTERVAL_DAYS),
            grace_period: Duration::days(DEFAULT_GRACE_PERIOD_DAYS),
        }
    }
}

/// The key registry service.
pub struct KeyRegistry {
    master: MasterSecret,
    config: RotationConfig,
    storage: Arc<CoreStorage>,
    // key_id → versions, oldest first. Guarded as one unit: rotation must
    // swap active flags and append atomically with respect to readers.
    keys: RwLock<HashMap<String, Vec<KeyMetadata>>>,
}

impl KeyRegistry {
    /// Construct the registry, loading persisted metadata if present.
    pub fn new(
        master: MasterSecret,
        storage: Arc<CoreStorage>,
        config: RotationConfig,
    ) -> Result<Self, KeyError> {
        let snapshot_path = storage.paths().key_registry();
        let mut keys: HashMap<String, Vec<KeyMetadata>> = HashMap::new();

        if storage.exists(&snapshot_path) {
            let snapshot: RegistrySnapshot = storage.read_json(&snapshot_path)?;
            for meta in snapshot.keys {
                keys.entry(meta.key_id.clone()).or_default().push(meta);
            }
            for versions in keys.values_mut() {
                versions.sort_by_key(|m| m.version);
            }
        }

        Ok(Self {
            master,
            config,
            storage,
            keys: RwLock::new(keys),
        })
    }

    /// Metadata of the active key for (tier, purpose), creating version 1 on
    /// first use of the tier.
    pub fn active(&self, tier: Sensitivity, purpose: KeyPurpose) -> Result<KeyMetadata, KeyError> {
        let id = key_id(tier, purpose);

        {
            let keys = self.keys.read().expect("key registry lock poisoned");
            if let Some(meta) = keys.get(&id).and_then(|v| v.iter().find(|m| m.active)) {
                return Ok(meta.clone());
            }
        }

        let mut keys = self.keys.write().expect("key registry lock poisoned");
        // Re-check under the write lock; another caller may have created it.
        if let Some(meta) = keys.get(&id).and_then(|v| v.iter().find(|m| m.active)) {
            return Ok(meta.clone());
        }

        let next_version = keys
            .get(&id)
            .and_then(|v| v.last())
            .map(|m| m.version + 1)
            .unwrap_or(1);
        let meta = KeyMetadata {
            key_id: id.clone(),
            tier,
            purpose,
            version: next_version,
            algorithm: Algorithm::Aes256Gcm,
            created_at: Utc::now(),
            rotated_at: None,
            expires_at: None,
            active: true,
        };
        keys.entry(id.clone()).or_default().push(meta.clone());
        self.persist(&keys)?;

        info!(key_id = %id, version = meta.version, "Created key version");
        Ok(meta)
    }

    /// Derive the AEAD key for a specific (key_id, version).
    ///
    /// Fails closed: unknown identities and versions past their grace
    /// expiry both error rather than falling back to another key.
    pub fn aead_key_for(&self, key_id: &str, version: u32) -> Result<AeadKey, KeyError> {
        let keys = self.keys.read().expect("key registry lock poisoned");
        let meta = keys
            .get(key_id)
            .and_then(|v| v.iter().find(|m| m.version == version))
            .ok_or_else(|| KeyError::NotFound {
                key_id: key_id.to_string(),
                version,
            })?;

        if let Some(expires_at) = meta.expires_at {
            if Utc::now() > expires_at {
                return Err(KeyError::Expired {
                    key_id: key_id.to_string(),
                    version,
                });
            }
        }

        let context = format!("{key_id}/v{version}");
        let material = crypto::derive_subkey(&self.master.0, context.as_bytes())?;
        Ok(AeadKey::new(material))
    }

    /// Derive the AEAD key for the active (tier, purpose) version.
    pub fn active_aead_key(
        &self,
        tier: Sensitivity,
        purpose: KeyPurpose,
    ) -> Result<(KeyMetadata, AeadKey), KeyError> {
        let meta = self.active(tier, purpose)?;
        let key = self.aead_key_for(&meta.key_id, meta.version)?;
        Ok((meta, key))
    }

    /// Derive a 32-byte MAC key for the active (tier, purpose) version.
    /// Used by the blind index and audit signing.
    pub fn mac_key(&self, tier: Sensitivity, purpose: KeyPurpose) -> Result<[u8; 32], KeyError> {
        let meta = self.active(tier, purpose)?;
        let context = format!("{}/v{}/mac", meta.key_id, meta.version);
        Ok(crypto::derive_subkey(&self.master.0, context.as_bytes())?)
    }

    /// Rotate every (tier, purpose) whose active key has exceeded the
    /// rotation interval, or all of them when `force` is set.
    ///
    /// Idempotent within the interval: a second call performs no rotation.
    pub fn rotate(&self, force: bool) -> Result<Vec<RotationEvent>, KeyError> {
        let now = Utc::now();
        let mut events = Vec::new();

        let mut keys = self.keys.write().expect("key registry lock poisoned");
        for versions in keys.values_mut() {
            let Some(active_idx) = versions.iter().position(|m| m.active) else {
                continue;
            };
            if !versions[active_idx].purpose.rotates_on_schedule() {
                continue;
            }

            let due = force || now - versions[active_idx].created_at >= self.config.interval;
            if !due {
                continue;
            }

            let retired_version = versions[active_idx].version;
            let successor = KeyMetadata {
                key_id: versions[active_idx].key_id.clone(),
                tier: versions[active_idx].tier,
                purpose: versions[active_idx].purpose,
                version: retired_version + 1,
                algorithm: versions[active_idx].algorithm,
                created_at: now,
                rotated_at: None,
                expires_at: None,
                active: true,
            };

            // Successor first, then deactivate: no window without an active key.
            versions.push(successor);
            let prior = &mut versions[active_idx];
            prior.active = false;
            prior.rotated_at = Some(now);
            prior.expires_at = Some(now + self.config.grace_period);

            events.push(RotationEvent {
                key_id: prior.key_id.clone(),
                retired_version,
                new_version: retired_version + 1,
            });
        }

        if !events.is_empty() {
            self.persist(&keys)?;
            for event in &events {
                info!(
                    key_id = %event.key_id,
                    retired = event.retired_version,
                    new = event.new_version,
                    "Rotated key"
                );
            }
        }
        Ok(events)
    }

    /// Drop metadata for versions past their grace expiry. Ciphertext under
    /// them must have been re-encrypted already; it is unrecoverable now.
    pub fn purge_expired(&self) -> Result<usize, KeyError> {
        let now = Utc::now();
        let mut keys = self.keys.write().expect("key registry lock poisoned");

        let mut purged = 0;
        for versions in keys.values_mut() {
            let before = versions.len();
            versions.retain(|m| m.expires_at.is_none_or(|e| e >= now));
            purged += before - versions.len();
        }

        if purged > 0 {
            self.persist(&keys)?;
            info!(count = purged, "Purged expired key versions");
        }
        Ok(purged)
    }

    /// All known key metadata (for inspection and tests).
    pub fn list(&self) -> Vec<KeyMetadata> {
        let keys = self.keys.read().expect("key registry lock poisoned");
        let mut all: Vec<KeyMetadata> = keys.values().flatten().cloned().collect();
        all.sort_by(|a, b| (&a.key_id, a.version).cmp(&(&b.key_id, b.version)));
        all
    }

    fn persist(&self, keys: &HashMap<String, Vec<KeyMetadata>>) -> Result<(), KeyError> {
        let snapshot = RegistrySnapshot {
            keys: keys.values().flatten().cloned().collect(),
        };
        self.storage
            .write_json(self.storage.paths().key_registry(), &snapshot)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_active(&self, tier: Sensitivity, purpose: KeyPurpose, by: Duration) {
        let id = key_id(tier, purpose);
        let mut keys = self.keys.write().expect("key registry lock poisoned");
        if let Some(meta) = keys
            .get_mut(&id)
            .and_then(|v| v.iter_mut().find(|m| m.active))
        {
            meta.created_at -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_registry() -> (TempDir, KeyRegistry) {
        let temp = TempDir::new().unwrap();
        let master = MasterSecret::new([3u8; 32]);
        let integrity = master.storage_integrity_key().unwrap();
        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), integrity);
        storage.initialize().unwrap();
        let registry =
            KeyRegistry::new(master, Arc::new(storage), RotationConfig::default()).unwrap();
        (temp, registry)
    }

    use crate::storage::StoragePaths;

    #[test]
    fn first_use_creates_version_one() {
        let (_temp, registry) = test_registry();
        let meta = registry
            .active(Sensitivity::Critical, KeyPurpose::FieldData)
            .unwrap();
        assert_eq!(meta.version, 1);
        assert!(meta.active);
        assert_eq!(meta.key_id, "hk-field-data-critical");
    }

    #[test]
    fn one_active_key_per_tier_and_purpose() {
        let (_temp, registry) = test_registry();
        registry
            .active(Sensitivity::High, KeyPurpose::FieldData)
            .unwrap();
        registry.rotate(true).unwrap();
        registry.rotate(true).unwrap();

        let active: Vec<_> = registry.list().into_iter().filter(|m| m.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 3);
    }

    #[test]
    fn rotation_is_idempotent_within_interval() {
        let (_temp, registry) = test_registry();
        registry
            .active(Sensitivity::High, KeyPurpose::FieldData)
            .unwrap();

        // Fresh key: not due yet.
        assert!(registry.rotate(false).unwrap().is_empty());
        assert!(registry.rotate(false).unwrap().is_empty());

        registry.backdate_active(
            Sensitivity::High,
            KeyPurpose::FieldData,
            Duration::days(DEFAULT_ROTATION_INTERVAL_DAYS + 1),
        );
        let events = registry.rotate(false).unwrap();
        assert_eq!(events.len(), 1);
        // Immediately after rotating, nothing further is due.
        assert!(registry.rotate(false).unwrap().is_empty());
    }

    #[test]
    fn retired_key_still_derives_within_grace() {
        let (_temp, registry) = test_registry();
        let meta = registry
            .active(Sensitivity::Critical, KeyPurpose::FieldData)
            .unwrap();
        registry.rotate(true).unwrap();

        // v1 is retired but inside its grace period.
        assert!(registry.aead_key_for(&meta.key_id, 1).is_ok());
        // And the successor derives too.
        assert!(registry.aead_key_for(&meta.key_id, 2).is_ok());
    }

    #[test]
    fn search_index_family_is_exempt_from_rotation() {
        let (_temp, registry) = test_registry();
        registry
            .active(Sensitivity::Critical, KeyPurpose::SearchIndex)
            .unwrap();
        registry
            .active(Sensitivity::Critical, KeyPurpose::FieldData)
            .unwrap();

        let events = registry.rotate(true).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key_id, "hk-field-data-critical");

        let index_meta = registry
            .active(Sensitivity::Critical, KeyPurpose::SearchIndex)
            .unwrap();
        assert_eq!(index_meta.version, 1);
    }

    #[test]
    fn unknown_key_fails_closed() {
        let (_temp, registry) = test_registry();
        let err = registry.aead_key_for("hk-field-data-critical", 9).unwrap_err();
        assert!(matches!(err, KeyError::NotFound { .. }));
    }

    #[test]
    fn derivation_is_stable_across_restart() {
        let temp = TempDir::new().unwrap();
        let integrity = MasterSecret::new([3u8; 32]).storage_integrity_key().unwrap();

        let first = {
            let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), integrity);
            storage.initialize().unwrap();
            let registry = KeyRegistry::new(
                MasterSecret::new([3u8; 32]),
                Arc::new(storage),
                RotationConfig::default(),
            )
            .unwrap();
            let meta = registry
                .active(Sensitivity::High, KeyPurpose::FieldData)
                .unwrap();
            let sealed = crate::crypto::aead::seal(
                &registry.aead_key_for(&meta.key_id, meta.version).unwrap(),
                b"aad",
                b"survives restart",
            )
            .unwrap();
            (meta, sealed)
        };

        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), integrity);
        storage.initialize().unwrap();
        let registry = KeyRegistry::new(
            MasterSecret::new([3u8; 32]),
            Arc::new(storage),
            RotationConfig::default(),
        )
        .unwrap();
        let (meta, sealed) = first;
        let key = registry.aead_key_for(&meta.key_id, meta.version).unwrap();
        let opened = crate::crypto::aead::open(&key, b"aad", &sealed).unwrap();
        assert_eq!(opened, b"survives restart");
    }

    #[test]
    fn purge_drops_only_expired_versions() {
        let (_temp, registry) = test_registry();
        registry
            .active(Sensitivity::High, KeyPurpose::FieldData)
            .unwrap();
        registry.rotate(true).unwrap();

        // Nothing past expiry yet.
        assert_eq!(registry.purge_expired().unwrap(), 0);

        // Force the retired version past its grace window.
        {
            let mut keys = registry.keys.write().unwrap();
            for versions in keys.values_mut() {
                for meta in versions.iter_mut() {
                    if !meta.active {
                        meta.expires_at = Some(Utc::now() - Duration::days(1));
                    }
                }
            }
        }
        assert_eq!(registry.purge_expired().unwrap(), 1);

        let remaining = registry.list();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].active);
    }
}
