// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Audit Log
//!
//! Tamper-evident record of every security-relevant occurrence. Entries are
//! signed with a keyed hash over their canonical serialization, buffered in
//! memory, and flushed to the embedded store on an interval or size bound.
//! Critical events and anything touching security, emergency, crisis, or
//! protected-health-information categories bypass the buffer and persist
//! immediately.
//!
//! `log()` never returns an error: observability failure must not be able
//! to take down the operation being observed. Failures are reported on the
//! internal diagnostic channel (`tracing::error!`) instead.

pub mod store;

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::keyed_hash;

pub use store::{AuditStore, AuditStoreError};

/// Regulatory retention window for audit entries.
pub const DEFAULT_RETENTION_DAYS: i64 = 7 * 365;

/// Buffered entries are flushed once the buffer reaches this size.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64;

/// Hard cap on rows materialized by a single query.
const QUERY_SCAN_CAP: usize = 10_000;

/// Kinds of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    // Session events
    LoginSuccess,
    LoginFailure,
    Logout,
    SessionRenewed,
    SessionElevated,
    SessionTerminated,
    SessionEvicted,
    MfaChallengeIssued,
    MfaVerified,

    // Encryption events
    KeyRotated,
    DataReencrypted,

    // Abuse events
    RateLimitExceeded,
    IdentityBlocked,
    IdentityUnblocked,
    ChallengeIssued,
    ChallengeVerified,
    AttackSignatureDetected,
    DecoyEndpointAccessed,

    // Health-data and crisis events
    PhiAccessed,
    CrisisSessionStarted,
    CrisisSessionEnded,
    EmergencyAccess,

    // System events
    IntegrityCheckFailed,
    RetentionPurge,
    LogsExported,
}

impl AuditKind {
    /// Events that must reach durable storage immediately, bypassing the
    /// batch buffer.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            AuditKind::AttackSignatureDetected
                | AuditKind::DecoyEndpointAccessed
                | AuditKind::IdentityBlocked
                | AuditKind::IntegrityCheckFailed
                | AuditKind::PhiAccessed
                | AuditKind::CrisisSessionStarted
                | AuditKind::CrisisSessionEnded
                | AuditKind::EmergencyAccess
        )
    }
}

/// Entry severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
}

/// A signed, immutable audit entry.
///
/// The signature covers the canonical serialization of every other field;
/// once signed, any mutation is detectable via [`AuditLog::verify_integrity`].
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub outcome: Outcome,
    pub severity: Severity,
    /// Free-form details. Values must never contain plaintext of regulated
    /// fields; callers log field names and tiers, not content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// HMAC-SHA256 over the canonical serialization of all fields above.
    pub signature: String,
}

impl AuditEntry {
    /// Canonical bytes covered by the signature: every field except the
    /// signature itself, in declared order. `details` maps serialize with
    /// sorted keys, so the encoding is deterministic.
    fn canonical_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Unsigned<'a> {
            id: &'a str,
            timestamp: i64,
            kind: &'a AuditKind,
            user_id: &'a Option<String>,
            session_id: &'a Option<String>,
            resource_type: &'a Option<String>,
            resource_id: &'a Option<String>,
            action: &'a Option<String>,
            outcome: &'a Outcome,
            severity: &'a Severity,
            details: &'a Option<Value>,
        }

        serde_json::to_vec(&Unsigned {
            id: &self.id,
            timestamp: self.timestamp.timestamp_millis(),
            kind: &self.kind,
            user_id: &self.user_id,
            session_id: &self.session_id,
            resource_type: &self.resource_type,
            resource_id: &self.resource_id,
            action: &self.action,
            outcome: &self.outcome,
            severity: &self.severity,
            details: &self.details,
        })
        .expect("canonical audit serialization cannot fail")
    }
}

/// An unsigned entry under construction.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    kind: AuditKind,
    user_id: Option<String>,
    session_id: Option<String>,
    resource_type: Option<String>,
    resource_id: Option<String>,
    action: Option<String>,
    outcome: Outcome,
    severity: Severity,
    details: serde_json::Map<String, Value>,
}

impl AuditDraft {
    pub fn new(kind: AuditKind) -> Self {
        Self {
            kind,
            user_id: None,
            session_id: None,
            resource_type: None,
            resource_id: None,
            action: None,
            outcome: Outcome::Success,
            severity: Severity::Info,
            details: serde_json::Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Query filters. All optional; unset filters match everything.
#[derive(Debug, Clone, Default, Deserialize, ToSchema, utoipa::IntoParams)]
pub struct AuditQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub kind: Option<AuditKind>,
    pub min_severity: Option<Severity>,
    pub resource_id: Option<String>,
    /// Page size; defaults to 100.
    pub limit: Option<usize>,
    /// Entries to skip (newest-first ordering).
    pub offset: Option<usize>,
}

/// Export serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] AuditStoreError),
}

/// Audit log configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub flush_threshold: usize,
    pub retention: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

/// The audit log service.
pub struct AuditLog {
    signing_key: [u8; 32],
    store: AuditStore,
    buffer: Mutex<Vec<AuditEntry>>,
    config: AuditConfig,
}

impl AuditLog {
    /// Open the audit store. The signing key is a stable master-derived
    /// subkey, not a rotating registry family: entries must stay
    /// verifiable for the full retention window, across every rotation in
    /// between.
    pub fn new(
        signing_key: [u8; 32],
        db_path: &std::path::Path,
        config: AuditConfig,
    ) -> Result<Self, AuditError> {
        let store = AuditStore::open(db_path)?;
        Ok(Self {
            signing_key,
            store,
            buffer: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Record an event. Infallible by contract: internal failures are
    /// traced, never propagated.
    pub fn log(&self, draft: AuditDraft) {
        let entry = self.sign(draft);

        if entry.kind.is_immediate() || entry.severity == Severity::Critical {
            if let Err(e) = self.store.append(&entry) {
                error!(entry_id = %entry.id, error = %e, "Failed to persist audit entry");
            }
            return;
        }

        let overflow = {
            let mut buffer = self.buffer.lock().expect("audit buffer lock poisoned");
            buffer.push(entry);
            buffer.len() >= self.config.flush_threshold
        };
        if overflow {
            if let Err(e) = self.flush() {
                error!(error = %e, "Failed to flush audit buffer");
            }
        }
    }

    /// Build and sign the final entry from a draft.
    fn sign(&self, draft: AuditDraft) -> AuditEntry {
        let mut entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind: draft.kind,
            user_id: draft.user_id,
            session_id: draft.session_id,
            resource_type: draft.resource_type,
            resource_id: draft.resource_id,
            action: draft.action,
            outcome: draft.outcome,
            severity: draft.severity,
            details: if draft.details.is_empty() {
                None
            } else {
                Some(Value::Object(draft.details))
            },
            signature: String::new(),
        };

        let digest = keyed_hash::sign(&self.signing_key, &entry.canonical_bytes());
        entry.signature = {
            use base64ct::{Base64, Encoding};
            Base64::encode_string(&digest)
        };
        entry
    }

    /// Drain the buffer into durable storage. Returns how many entries
    /// were written.
    pub fn flush(&self) -> Result<usize, AuditError> {
        let batch: Vec<AuditEntry> = {
            let mut buffer = self.buffer.lock().expect("audit buffer lock poisoned");
            std::mem::take(&mut *buffer)
        };
        self.store.append_batch(&batch)?;
        Ok(batch.len())
    }

    /// Query entries, newest-first, paginated.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        // Buffered entries must be visible to forensic queries.
        self.flush()?;

        let start_ms = query.start.map(|t| t.timestamp_millis()).unwrap_or(0);
        let end_ms = query
            .end
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let scanned = match &query.session_id {
            Some(session_id) => self.store.scan_session(session_id, QUERY_SCAN_CAP)?,
            None => self.store.scan_range(start_ms, end_ms, QUERY_SCAN_CAP)?,
        };

        let limit = query.limit.unwrap_or(100);
        let offset = query.offset.unwrap_or(0);

        Ok(scanned
            .into_iter()
            .filter(|e| {
                let ts = e.timestamp.timestamp_millis();
                ts >= start_ms
                    && ts <= end_ms
                    && query
                        .user_id
                        .as_ref()
                        .is_none_or(|u| e.user_id.as_ref() == Some(u))
                    && query.kind.is_none_or(|k| e.kind == k)
                    && query.min_severity.is_none_or(|s| e.severity >= s)
                    && query
                        .resource_id
                        .as_ref()
                        .is_none_or(|r| e.resource_id.as_ref() == Some(r))
            })
            .skip(offset)
            .take(limit)
            .collect())
    }

    /// Fetch one durable entry by id (flushing the buffer first).
    pub fn get(&self, entry_id: &str) -> Result<Option<AuditEntry>, AuditError> {
        self.flush()?;
        Ok(self.store.get(entry_id)?)
    }

    /// Recompute the signature over all fields except the stored signature
    /// and compare. Any mismatch indicates tampering.
    pub fn verify_integrity(&self, entry: &AuditEntry) -> bool {
        use base64ct::{Base64, Encoding};
        let Ok(stored) = Base64::decode_vec(&entry.signature) else {
            return false;
        };
        keyed_hash::verify(&self.signing_key, &entry.canonical_bytes(), &stored)
    }

    /// Serialize entries in a date range for compliance reporting.
    pub fn export(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        format: ExportFormat,
    ) -> Result<String, AuditError> {
        let entries = self.query(&AuditQuery {
            start: Some(start),
            end: Some(end),
            limit: Some(QUERY_SCAN_CAP),
            ..Default::default()
        })?;

        self.log(
            AuditDraft::new(AuditKind::LogsExported)
                .with_detail("entry_count", entries.len())
                .with_detail("format", format!("{format:?}").to_lowercase()),
        );

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)
                .expect("audit entries serialize to JSON")),
            ExportFormat::Csv => Ok(to_csv(&entries)),
        }
    }

    /// Purge entries older than the retention window.
    pub fn purge_expired(&self) -> Result<usize, AuditError> {
        let cutoff = Utc::now() - self.config.retention;
        let purged = self.store.purge_before(cutoff.timestamp_millis())?;
        if purged > 0 {
            self.log(
                AuditDraft::new(AuditKind::RetentionPurge).with_detail("purged_entries", purged),
            );
        }
        Ok(purged)
    }

    /// Total number of durable entries (buffered entries excluded).
    pub fn stored_len(&self) -> Result<u64, AuditError> {
        Ok(self.store.len()?)
    }
}

fn to_csv(entries: &[AuditEntry]) -> String {
    let mut out = String::from(
        "id,timestamp,kind,user_id,session_id,resource_type,resource_id,action,outcome,severity,details,signature\n",
    );
    for e in entries {
        let timestamp = e.timestamp.to_rfc3339();
        let kind = serde_json::to_string(&e.kind).unwrap_or_default();
        let outcome = serde_json::to_string(&e.outcome).unwrap_or_default();
        let severity = serde_json::to_string(&e.severity).unwrap_or_default();
        let details = e
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        let row: [&str; 12] = [
            e.id.as_str(),
            timestamp.as_str(),
            kind.trim_matches('"'),
            e.user_id.as_deref().unwrap_or(""),
            e.session_id.as_deref().unwrap_or(""),
            e.resource_type.as_deref().unwrap_or(""),
            e.resource_id.as_deref().unwrap_or(""),
            e.action.as_deref().unwrap_or(""),
            outcome.trim_matches('"'),
            severity.trim_matches('"'),
            details.as_str(),
            e.signature.as_str(),
        ];
        let row = row.map(csv_escape).join(",");
        out.push_str(&row);
        out.push('\n');
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterSecret;
    use crate::storage::{CoreStorage, StoragePaths};
    use tempfile::TempDir;

    fn test_audit() -> (TempDir, AuditLog) {
        let temp = TempDir::new().unwrap();
        let master = MasterSecret::new([5u8; 32]);
        let integrity = master.storage_integrity_key().unwrap();
        let signing = master.subkey(b"audit-signing").unwrap();
        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), integrity);
        storage.initialize().unwrap();
        let audit = AuditLog::new(
            signing,
            &storage.paths().audit_db(),
            AuditConfig::default(),
        )
        .unwrap();
        (temp, audit)
    }

    #[test]
    fn log_and_query_roundtrip() {
        let (_temp, audit) = test_audit();

        audit.log(
            AuditDraft::new(AuditKind::LoginSuccess)
                .with_user("user-1")
                .with_session("sess-1"),
        );
        audit.log(
            AuditDraft::new(AuditKind::Logout)
                .with_user("user-1")
                .with_session("sess-1"),
        );

        let entries = audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].kind, AuditKind::Logout);
        assert_eq!(entries[1].kind, AuditKind::LoginSuccess);
    }

    #[test]
    fn critical_entries_bypass_the_buffer() {
        let (_temp, audit) = test_audit();

        audit.log(
            AuditDraft::new(AuditKind::DecoyEndpointAccessed).with_severity(Severity::Critical),
        );
        // Durable without an intervening flush.
        assert_eq!(audit.stored_len().unwrap(), 1);

        audit.log(AuditDraft::new(AuditKind::SessionRenewed));
        // Routine entry only buffered so far.
        assert_eq!(audit.stored_len().unwrap(), 1);
        audit.flush().unwrap();
        assert_eq!(audit.stored_len().unwrap(), 2);
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let (_temp, audit) = test_audit();

        audit.log(
            AuditDraft::new(AuditKind::PhiAccessed)
                .with_user("user-9")
                .with_resource("field", "diagnosis")
                .with_detail("tier", "critical"),
        );

        let entries = audit.query(&AuditQuery::default()).unwrap();
        let entry = &entries[0];
        assert!(audit.verify_integrity(entry));

        let mut forged = entry.clone();
        forged.user_id = Some("user-1".to_string());
        assert!(!audit.verify_integrity(&forged));

        let mut clipped = entry.clone();
        clipped.severity = Severity::Info;
        assert!(!audit.verify_integrity(&clipped));
    }

    #[test]
    fn any_flipped_signature_byte_fails_verification() {
        let (_temp, audit) = test_audit();
        audit.log(AuditDraft::new(AuditKind::KeyRotated));

        let entry = &audit.query(&AuditQuery::default()).unwrap()[0];
        use base64ct::{Base64, Encoding};
        let mut sig = Base64::decode_vec(&entry.signature).unwrap();
        for i in 0..sig.len() {
            sig[i] ^= 0x01;
            let mut forged = entry.clone();
            forged.signature = Base64::encode_string(&sig);
            assert!(!audit.verify_integrity(&forged), "byte {i} not detected");
            sig[i] ^= 0x01;
        }
    }

    #[test]
    fn signatures_verify_after_reopen() {
        let temp = TempDir::new().unwrap();
        let master = MasterSecret::new([5u8; 32]);
        let integrity = master.storage_integrity_key().unwrap();
        let signing = master.subkey(b"audit-signing").unwrap();
        let mut storage = CoreStorage::new(StoragePaths::new(temp.path()), integrity);
        storage.initialize().unwrap();
        let db_path = storage.paths().audit_db();

        {
            let audit = AuditLog::new(signing, &db_path, AuditConfig::default()).unwrap();
            audit.log(AuditDraft::new(AuditKind::PhiAccessed).with_user("user-1"));
        }

        // Same derivation, fresh process: old entries still verify.
        let reopened = AuditLog::new(signing, &db_path, AuditConfig::default()).unwrap();
        let entries = reopened.query(&AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(reopened.verify_integrity(&entries[0]));
    }

    #[test]
    fn query_filters_apply() {
        let (_temp, audit) = test_audit();

        audit.log(AuditDraft::new(AuditKind::LoginSuccess).with_user("alice"));
        audit.log(AuditDraft::new(AuditKind::LoginFailure).with_user("mallory"));
        audit.log(
            AuditDraft::new(AuditKind::RateLimitExceeded)
                .with_user("mallory")
                .with_severity(Severity::Warning),
        );

        let mallory = audit
            .query(&AuditQuery {
                user_id: Some("mallory".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(mallory.len(), 2);

        let warnings = audit
            .query(&AuditQuery {
                min_severity: Some(Severity::Warning),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, AuditKind::RateLimitExceeded);
    }

    #[test]
    fn session_entries_are_ordered_newest_first() {
        let (_temp, audit) = test_audit();
        for kind in [
            AuditKind::LoginSuccess,
            AuditKind::SessionRenewed,
            AuditKind::SessionTerminated,
        ] {
            audit.log(AuditDraft::new(kind).with_session("sess-42"));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        audit.log(AuditDraft::new(AuditKind::LoginSuccess).with_session("other"));

        let entries = audit
            .query(&AuditQuery {
                session_id: Some("sess-42".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, AuditKind::SessionTerminated);
        assert_eq!(entries[2].kind, AuditKind::LoginSuccess);
        assert!(entries[0].timestamp >= entries[1].timestamp);
    }

    #[test]
    fn export_produces_csv_with_header() {
        let (_temp, audit) = test_audit();
        audit.log(AuditDraft::new(AuditKind::LoginSuccess).with_user("u, with comma"));

        let csv = audit
            .export(
                Utc::now() - Duration::hours(1),
                Utc::now() + Duration::hours(1),
                ExportFormat::Csv,
            )
            .unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,timestamp,kind"));
        assert!(csv.contains("\"u, with comma\""));
    }

    #[test]
    fn purge_respects_retention_window() {
        let (_temp, audit) = test_audit();
        audit.log(AuditDraft::new(AuditKind::LoginSuccess));
        audit.flush().unwrap();

        // Everything is inside the 7-year window.
        assert_eq!(audit.purge_expired().unwrap(), 0);
        assert_eq!(audit.stored_len().unwrap(), 1);
    }
}
