// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! The field encryption engine.
//!
//! Encrypts, decrypts, tokenizes, and searches individual data fields
//! according to the static [`PolicyTable`]. Ciphertext always carries its
//! originating key identity; decryption is attempted only with that exact
//! key and fails closed on any mismatch. Critical-sensitivity access emits
//! an audit entry naming the field and tier, never the value.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::audit::{AuditDraft, AuditKind, AuditLog, Outcome};
use crate::crypto::{self, aead, Algorithm, CryptoError};
use crate::keys::{KeyError, KeyPurpose, KeyRegistry, RotationEvent, Sensitivity};
use crate::storage::{CoreStorage, StorageError};

use super::blind_index::BlindIndex;
use super::policy::{FieldPolicy, PolicyTable};
use super::vault::TokenVault;

/// One encrypted field value, carrying its full key identity.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EncryptedField {
    /// Stable reference used by the blind index and batch operations.
    pub reference: String,
    /// Logical field this ciphertext belongs to; bound into the AEAD
    /// associated data.
    pub field_name: String,
    pub key_id: String,
    pub key_version: u32,
    pub algorithm: Algorithm,
    /// Base64 nonce.
    pub nonce: String,
    /// Base64 ciphertext with appended tag.
    pub ciphertext: String,
    pub encrypted_at: DateTime<Utc>,
}

/// The engine's output for one field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncryptedValue {
    /// Field has no policy: value passes through unchanged.
    Plaintext { value: String },
    /// Standard authenticated encryption.
    Sealed { field: EncryptedField },
    /// Ciphertext lives in the vault; only the opaque token circulates.
    TokenRef { token: String, field_name: String },
    /// Masked rendition plus a vault token for the true value.
    Masked {
        mask: String,
        token: String,
        field_name: String,
    },
}

/// Field encryption errors. Integrity and key-mismatch failures surface
/// here; the engine never substitutes defaults for broken ciphertext.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("encryption failed for field {0}")]
    Encrypt(String),

    #[error("decryption failed for field {0}: integrity or key mismatch")]
    Decrypt(String),

    #[error("field {0} is not configured for search")]
    NotSearchable(String),

    #[error("value for field {expected} was encrypted as {actual}")]
    FieldMismatch { expected: String, actual: String },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<CryptoError> for FieldError {
    fn from(e: CryptoError) -> Self {
        FieldError::Key(KeyError::Crypto(e))
    }
}

/// The field encryption engine service.
pub struct FieldCipher {
    registry: Arc<KeyRegistry>,
    audit: Arc<AuditLog>,
    policies: PolicyTable,
    vault: TokenVault,
    index: BlindIndex,
}

impl FieldCipher {
    pub fn new(
        registry: Arc<KeyRegistry>,
        storage: Arc<CoreStorage>,
        audit: Arc<AuditLog>,
        policies: PolicyTable,
    ) -> Result<Self, FieldError> {
        let index_key = registry.mac_key(Sensitivity::Critical, KeyPurpose::SearchIndex)?;
        Ok(Self {
            registry,
            audit,
            policies,
            vault: TokenVault::new(storage.clone()),
            index: BlindIndex::new(index_key, storage),
        })
    }

    /// Encrypt one field value according to its policy.
    pub fn encrypt_field(
        &self,
        field: &str,
        value: &str,
        user_id: Option<&str>,
    ) -> Result<EncryptedValue, FieldError> {
        let Some(policy) = self.policies.get(field) else {
            return Ok(EncryptedValue::Plaintext {
                value: value.to_string(),
            });
        };
        let policy = policy.clone();

        let reference = format!("fld_{}", crypto::random_token(12)?);
        let result = self.seal_value(field, value, &policy, reference.clone());

        if policy.sensitivity == Sensitivity::Critical {
            self.audit_phi_access(field, "encrypt", user_id, result.is_ok());
        }
        let sealed = result?;

        if policy.searchable {
            self.index.index(field, value, &reference)?;
        }

        if policy.tokenized {
            let token = self.vault.mint_token()?;
            self.vault.store(&token, &sealed)?;
            return Ok(EncryptedValue::TokenRef {
                token,
                field_name: field.to_string(),
            });
        }

        if let Some(format) = policy.format {
            let token = self.vault.mint_token()?;
            self.vault.store(&token, &sealed)?;
            return Ok(EncryptedValue::Masked {
                mask: format.mask(value),
                token,
                field_name: field.to_string(),
            });
        }

        Ok(EncryptedValue::Sealed { field: sealed })
    }

    /// Decrypt one field value. Any integrity or key-mismatch failure
    /// propagates; there is no silent fallback.
    pub fn decrypt_field(
        &self,
        field: &str,
        value: &EncryptedValue,
        user_id: Option<&str>,
    ) -> Result<String, FieldError> {
        let result = self.open_value(field, value);

        if let Some(policy) = self.policies.get(field) {
            if policy.sensitivity == Sensitivity::Critical {
                self.audit_phi_access(field, "decrypt", user_id, result.is_ok());
            }
        }
        result
    }

    /// Equality search over a searchable field's blind index. Returns the
    /// references of matching encrypted fields; plaintext of non-matching
    /// entries is never reconstructed.
    pub fn search_field(
        &self,
        field: &str,
        term: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<String>, FieldError> {
        let Some(policy) = self.policies.get(field) else {
            return Err(FieldError::NotSearchable(field.to_string()));
        };
        if !policy.searchable {
            return Err(FieldError::NotSearchable(field.to_string()));
        }

        if policy.sensitivity == Sensitivity::Critical {
            self.audit_phi_access(field, "search", user_id, true);
        }
        Ok(self.index.search(field, term)?)
    }

    /// Rotate every key family past its rotation interval (or all, when
    /// forced). Previously encrypted data stays decryptable: ciphertext
    /// carries its key identity and retired versions derive until grace
    /// expiry.
    pub fn rotate_keys(&self, force: bool) -> Result<Vec<RotationEvent>, FieldError> {
        let events = self.registry.rotate(force)?;
        for event in &events {
            self.audit.log(
                AuditDraft::new(AuditKind::KeyRotated)
                    .with_resource("key", event.key_id.clone())
                    .with_detail("retired_version", event.retired_version)
                    .with_detail("new_version", event.new_version),
            );
        }
        Ok(events)
    }

    /// Re-encrypt legacy ciphertext under the active key, preserving the
    /// reference (and vault token, where applicable) so indexes stay valid.
    /// Must run before the legacy key's grace period expires.
    pub fn reencrypt(
        &self,
        field: &str,
        value: &EncryptedValue,
    ) -> Result<EncryptedValue, FieldError> {
        let Some(policy) = self.policies.get(field).cloned() else {
            return Ok(value.clone());
        };

        let reencrypted = match value {
            EncryptedValue::Plaintext { .. } => return Ok(value.clone()),
            EncryptedValue::Sealed { field: sealed } => {
                let plaintext = self.open_sealed(field, sealed)?;
                let fresh = self.seal_value(field, &plaintext, &policy, sealed.reference.clone())?;
                EncryptedValue::Sealed { field: fresh }
            }
            EncryptedValue::TokenRef { token, field_name } => {
                let sealed = self.vault.fetch(token)?;
                let plaintext = self.open_sealed(field, &sealed)?;
                let fresh = self.seal_value(field, &plaintext, &policy, sealed.reference.clone())?;
                self.vault.store(token, &fresh)?;
                EncryptedValue::TokenRef {
                    token: token.clone(),
                    field_name: field_name.clone(),
                }
            }
            EncryptedValue::Masked {
                mask,
                token,
                field_name,
            } => {
                let sealed = self.vault.fetch(token)?;
                let plaintext = self.open_sealed(field, &sealed)?;
                let fresh = self.seal_value(field, &plaintext, &policy, sealed.reference.clone())?;
                self.vault.store(token, &fresh)?;
                EncryptedValue::Masked {
                    mask: mask.clone(),
                    token: token.clone(),
                    field_name: field_name.clone(),
                }
            }
        };

        self.audit.log(
            AuditDraft::new(AuditKind::DataReencrypted)
                .with_resource("field", field)
                .with_detail("tier", policy.sensitivity.as_str()),
        );
        Ok(reencrypted)
    }

    /// Encrypt every configured string field of a JSON object in place.
    /// Unconfigured and non-string values pass through untouched.
    pub fn encrypt_object(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        user_id: Option<&str>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, FieldError> {
        let mut out = serde_json::Map::with_capacity(object.len());
        for (name, value) in object {
            let encrypted = match value.as_str() {
                Some(plain) if self.policies.get(name).is_some() => {
                    let ev = self.encrypt_field(name, plain, user_id)?;
                    serde_json::to_value(ev).map_err(|_| FieldError::Encrypt(name.clone()))?
                }
                _ => value.clone(),
            };
            out.insert(name.clone(), encrypted);
        }
        Ok(out)
    }

    /// Reverse of [`encrypt_object`]: values that deserialize as
    /// [`EncryptedValue`] are decrypted, everything else passes through.
    pub fn decrypt_object(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        user_id: Option<&str>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, FieldError> {
        let mut out = serde_json::Map::with_capacity(object.len());
        for (name, value) in object {
            let decrypted = match serde_json::from_value::<EncryptedValue>(value.clone()) {
                Ok(ev) => serde_json::Value::String(self.decrypt_field(name, &ev, user_id)?),
                Err(_) => value.clone(),
            };
            out.insert(name.clone(), decrypted);
        }
        Ok(out)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// AEAD-seal a plaintext under the active key for the policy's tier.
    fn seal_value(
        &self,
        field: &str,
        plaintext: &str,
        policy: &FieldPolicy,
        reference: String,
    ) -> Result<EncryptedField, FieldError> {
        let purpose = if policy.tokenized {
            KeyPurpose::TokenVault
        } else {
            KeyPurpose::FieldData
        };
        let (meta, key) = self.registry.active_aead_key(policy.sensitivity, purpose)?;

        let aad = field_aad(field, &meta.key_id, meta.version);
        let sealed = aead::seal(&key, aad.as_bytes(), plaintext.as_bytes())
            .map_err(|_| FieldError::Encrypt(field.to_string()))?;

        Ok(EncryptedField {
            reference,
            field_name: field.to_string(),
            key_id: meta.key_id,
            key_version: meta.version,
            algorithm: meta.algorithm,
            nonce: Base64::encode_string(&sealed.nonce),
            ciphertext: Base64::encode_string(&sealed.ciphertext),
            encrypted_at: Utc::now(),
        })
    }

    fn open_value(&self, field: &str, value: &EncryptedValue) -> Result<String, FieldError> {
        match value {
            EncryptedValue::Plaintext { value } => Ok(value.clone()),
            EncryptedValue::Sealed { field: sealed } => self.open_sealed(field, sealed),
            EncryptedValue::TokenRef { token, .. } | EncryptedValue::Masked { token, .. } => {
                let sealed = self.vault.fetch(token)?;
                self.open_sealed(field, &sealed)
            }
        }
    }

    /// Open one sealed field with exactly the key identity it records.
    fn open_sealed(&self, field: &str, sealed: &EncryptedField) -> Result<String, FieldError> {
        if sealed.field_name != field {
            return Err(FieldError::FieldMismatch {
                expected: field.to_string(),
                actual: sealed.field_name.clone(),
            });
        }

        let key = self.registry.aead_key_for(&sealed.key_id, sealed.key_version)?;

        let nonce_bytes = Base64::decode_vec(&sealed.nonce)
            .map_err(|_| FieldError::Decrypt(field.to_string()))?;
        let nonce: [u8; 12] = nonce_bytes
            .try_into()
            .map_err(|_| FieldError::Decrypt(field.to_string()))?;
        let ciphertext = Base64::decode_vec(&sealed.ciphertext)
            .map_err(|_| FieldError::Decrypt(field.to_string()))?;

        let aad = field_aad(field, &sealed.key_id, sealed.key_version);
        let plaintext = aead::open(
            &key,
            aad.as_bytes(),
            &aead::SealedBox { nonce, ciphertext },
        )
        .map_err(|_| FieldError::Decrypt(field.to_string()))?;

        String::from_utf8(plaintext).map_err(|_| FieldError::Decrypt(field.to_string()))
    }

    fn audit_phi_access(&self, field: &str, action: &str, user_id: Option<&str>, ok: bool) {
        let mut draft = AuditDraft::new(AuditKind::PhiAccessed)
            .with_resource("field", field)
            .with_action(action)
            .with_detail("tier", Sensitivity::Critical.as_str())
            .with_outcome(if ok { Outcome::Success } else { Outcome::Failure });
        if let Some(user_id) = user_id {
            draft = draft.with_user(user_id);
        }
        self.audit.log(draft);
    }
}

/// Associated data binding ciphertext to its field and key identity.
fn field_aad(field: &str, key_id: &str, version: u32) -> String {
    format!("{field}|{key_id}|v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditQuery};
    use crate::keys::{MasterSecret, RotationConfig};
    use crate::storage::StoragePaths;
    use tempfile::TempDir;

    fn test_cipher() -> (TempDir, FieldCipher, Arc<AuditLog>) {
        let temp = TempDir::new().unwrap();
        let master = MasterSecret::new([11u8; 32]);
        let integrity = master.storage_integrity_key().unwrap();
        let signing = master.subkey(b"audit-signing").unwrap();
        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), integrity);
        storage.initialize().unwrap();
        let storage = Arc::new(storage);
        let registry = Arc::new(
            KeyRegistry::new(master, storage.clone(), RotationConfig::default()).unwrap(),
        );
        let audit = Arc::new(
            AuditLog::new(signing, &storage.paths().audit_db(), AuditConfig::default()).unwrap(),
        );
        let cipher =
            FieldCipher::new(registry, storage, audit.clone(), PolicyTable::default()).unwrap();
        (temp, cipher, audit)
    }

    #[test]
    fn configured_field_roundtrips() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("diagnosis", "generalized anxiety disorder", Some("user-1"))
            .unwrap();
        assert!(matches!(encrypted, EncryptedValue::Sealed { .. }));

        let decrypted = cipher
            .decrypt_field("diagnosis", &encrypted, Some("user-1"))
            .unwrap();
        assert_eq!(decrypted, "generalized anxiety disorder");
    }

    #[test]
    fn unconfigured_field_passes_through() {
        let (_temp, cipher, _) = test_cipher();
        let result = cipher
            .encrypt_field("favorite_color", "teal", None)
            .unwrap();
        assert!(matches!(
            &result,
            EncryptedValue::Plaintext { value } if value == "teal"
        ));
    }

    #[test]
    fn ciphertext_never_contains_plaintext() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("crisis_notes", "patient reported ideation", None)
            .unwrap();
        let json = serde_json::to_string(&encrypted).unwrap();
        assert!(!json.contains("ideation"));
    }

    #[test]
    fn tokenized_field_returns_opaque_reference() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("insurance_member_id", "XZ-99-1234-AB", None)
            .unwrap();

        let EncryptedValue::TokenRef { token, field_name } = &encrypted else {
            panic!("expected token reference");
        };
        assert!(token.starts_with("tok_"));
        assert_eq!(field_name, "insurance_member_id");
        assert!(!token.contains("1234"));

        let decrypted = cipher
            .decrypt_field("insurance_member_id", &encrypted, None)
            .unwrap();
        assert_eq!(decrypted, "XZ-99-1234-AB");
    }

    #[test]
    fn format_preserving_field_keeps_shape() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("phone_number", "(555) 867-5309", None)
            .unwrap();

        let EncryptedValue::Masked { mask, .. } = &encrypted else {
            panic!("expected masked value");
        };
        assert_eq!(mask, "(***) ***-5309");

        let decrypted = cipher.decrypt_field("phone_number", &encrypted, None).unwrap();
        assert_eq!(decrypted, "(555) 867-5309");
    }

    #[test]
    fn searchable_field_matches_indexed_words() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("journal_entry", "anxiety journal", Some("user-7"))
            .unwrap();
        let EncryptedValue::Sealed { field } = &encrypted else {
            panic!("expected sealed value");
        };

        let hits = cipher
            .search_field("journal_entry", "anxiety", Some("user-7"))
            .unwrap();
        assert_eq!(hits, vec![field.reference.clone()]);

        let misses = cipher
            .search_field("journal_entry", "joyful", Some("user-7"))
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn search_on_unsearchable_field_is_rejected() {
        let (_temp, cipher, _) = test_cipher();
        assert!(matches!(
            cipher.search_field("diagnosis", "anything", None),
            Err(FieldError::NotSearchable(_))
        ));
    }

    #[test]
    fn decryption_survives_key_rotation() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("diagnosis", "major depressive disorder", None)
            .unwrap();

        let events = cipher.rotate_keys(true).unwrap();
        assert!(!events.is_empty());

        // Old ciphertext decrypts under its recorded (retired) key.
        let decrypted = cipher.decrypt_field("diagnosis", &encrypted, None).unwrap();
        assert_eq!(decrypted, "major depressive disorder");

        // New ciphertext uses the successor version.
        let fresh = cipher.encrypt_field("diagnosis", "updated", None).unwrap();
        let (EncryptedValue::Sealed { field: old }, EncryptedValue::Sealed { field: new }) =
            (&encrypted, &fresh)
        else {
            panic!("expected sealed values");
        };
        assert!(new.key_version > old.key_version);
    }

    #[test]
    fn rotate_twice_within_interval_is_a_no_op() {
        let (_temp, cipher, _) = test_cipher();
        cipher.encrypt_field("diagnosis", "seed the key family", None).unwrap();

        assert!(cipher.rotate_keys(false).unwrap().is_empty());
        assert!(cipher.rotate_keys(false).unwrap().is_empty());
    }

    #[test]
    fn reencrypt_moves_ciphertext_to_active_key() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("safety_plan", "call sister, then hotline", None)
            .unwrap();
        cipher.rotate_keys(true).unwrap();

        let migrated = cipher.reencrypt("safety_plan", &encrypted).unwrap();
        let (EncryptedValue::Sealed { field: old }, EncryptedValue::Sealed { field: new }) =
            (&encrypted, &migrated)
        else {
            panic!("expected sealed values");
        };
        assert_eq!(new.reference, old.reference);
        assert!(new.key_version > old.key_version);
        assert_eq!(
            cipher.decrypt_field("safety_plan", &migrated, None).unwrap(),
            "call sister, then hotline"
        );
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher
            .encrypt_field("diagnosis", "ptsd", None)
            .unwrap();
        let EncryptedValue::Sealed { field } = encrypted else {
            panic!("expected sealed value");
        };

        let mut tampered = field.clone();
        let mut raw = Base64::decode_vec(&tampered.ciphertext).unwrap();
        raw[0] ^= 0xFF;
        tampered.ciphertext = Base64::encode_string(&raw);

        let result = cipher.decrypt_field(
            "diagnosis",
            &EncryptedValue::Sealed { field: tampered },
            None,
        );
        assert!(matches!(result, Err(FieldError::Decrypt(_))));
    }

    #[test]
    fn ciphertext_bound_to_its_field() {
        let (_temp, cipher, _) = test_cipher();
        let encrypted = cipher.encrypt_field("diagnosis", "ocd", None).unwrap();

        let result = cipher.decrypt_field("medications", &encrypted, None);
        assert!(matches!(result, Err(FieldError::FieldMismatch { .. })));
    }

    #[test]
    fn critical_access_is_audited_without_the_value() {
        let (_temp, cipher, audit) = test_cipher();
        cipher
            .encrypt_field("diagnosis", "bipolar II", Some("user-3"))
            .unwrap();

        let entries = audit
            .query(&AuditQuery {
                kind: Some(AuditKind::PhiAccessed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_id.as_deref(), Some("diagnosis"));
        assert_eq!(entries[0].user_id.as_deref(), Some("user-3"));
        let serialized = serde_json::to_string(&entries[0]).unwrap();
        assert!(!serialized.contains("bipolar"));
    }

    #[test]
    fn object_forms_roundtrip() {
        let (_temp, cipher, _) = test_cipher();
        let record = serde_json::json!({
            "diagnosis": "adjustment disorder",
            "journal_entry": "slept badly",
            "mood_score": 4,
            "favorite_color": "teal"
        });
        let object = record.as_object().unwrap();

        let encrypted = cipher.encrypt_object(object, Some("user-5")).unwrap();
        assert!(encrypted["diagnosis"].is_object());
        assert_eq!(encrypted["mood_score"], 4);
        assert_eq!(encrypted["favorite_color"], "teal");

        let decrypted = cipher.decrypt_object(&encrypted, Some("user-5")).unwrap();
        assert_eq!(decrypted["diagnosis"], "adjustment disorder");
        assert_eq!(decrypted["journal_entry"], "slept badly");
        assert_eq!(decrypted["mood_score"], 4);
    }
}
