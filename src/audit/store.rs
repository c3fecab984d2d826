// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Embedded audit database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `entries`: entry_id → serialized AuditEntry
//! - `time_index`: composite key (!timestamp|entry_id) → entry_id
//! - `session_index`: composite key (session_id|!timestamp|entry_id) → entry_id
//!
//! Timestamps are stored inverted (bitwise NOT, big-endian) so a forward
//! range scan yields newest-first ordering.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::AuditEntry;

/// Primary table: entry_id → serialized AuditEntry (JSON bytes).
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Index: `!timestamp_be|entry_id` → entry_id, for newest-first time scans.
const TIME_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("time_index");

/// Index: `session_id|!timestamp_be|entry_id` → entry_id, for per-session
/// forensic reconstruction.
const SESSION_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("session_index");

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type AuditStoreResult<T> = Result<T, AuditStoreError>;

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Invert a millisecond timestamp so ascending key order is newest-first.
fn invert_ts(timestamp_ms: i64) -> [u8; 8] {
    (!(timestamp_ms as u64)).to_be_bytes()
}

/// Build the time-index key: `!timestamp_be | entry_id`.
fn make_time_key(timestamp_ms: i64, entry_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 1 + entry_id.len());
    key.extend_from_slice(&invert_ts(timestamp_ms));
    key.push(b'|');
    key.extend_from_slice(entry_id.as_bytes());
    key
}

/// Build the session-index key: `session_id | !timestamp_be | entry_id`.
fn make_session_key(session_id: &str, timestamp_ms: i64, entry_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(session_id.len() + 1 + 8 + 1 + entry_id.len());
    key.extend_from_slice(session_id.as_bytes());
    key.push(b'|');
    key.extend_from_slice(&invert_ts(timestamp_ms));
    key.push(b'|');
    key.extend_from_slice(entry_id.as_bytes());
    key
}

/// Prefix for range-scanning one session's index entries.
fn make_session_prefix(session_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(session_id.len() + 1);
    prefix.extend_from_slice(session_id.as_bytes());
    prefix.push(b'|');
    prefix
}

/// Upper bound for a session prefix scan.
fn make_session_prefix_end(session_id: &str) -> Vec<u8> {
    let mut end = make_session_prefix(session_id);
    end.extend_from_slice(&[0xFF; 20]);
    end
}

// =============================================================================
// AuditStore
// =============================================================================

/// Append-only embedded store for signed audit entries.
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> AuditStoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES)?;
            let _ = write_txn.open_table(TIME_INDEX)?;
            let _ = write_txn.open_table(SESSION_INDEX)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append one signed entry and its index rows.
    pub fn append(&self, entry: &AuditEntry) -> AuditStoreResult<()> {
        let json = serde_json::to_vec(entry)?;
        let ts = entry.timestamp.timestamp_millis();

        let write_txn = self.db.begin_write()?;
        {
            let mut entries = write_txn.open_table(ENTRIES)?;
            entries.insert(entry.id.as_str(), json.as_slice())?;

            let mut time_idx = write_txn.open_table(TIME_INDEX)?;
            time_idx.insert(make_time_key(ts, &entry.id).as_slice(), entry.id.as_str())?;

            if let Some(session_id) = &entry.session_id {
                let mut session_idx = write_txn.open_table(SESSION_INDEX)?;
                session_idx.insert(
                    make_session_key(session_id, ts, &entry.id).as_slice(),
                    entry.id.as_str(),
                )?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Append a batch in one transaction (buffer flush path).
    pub fn append_batch(&self, batch: &[AuditEntry]) -> AuditStoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let mut time_idx = write_txn.open_table(TIME_INDEX)?;
            let mut session_idx = write_txn.open_table(SESSION_INDEX)?;

            for entry in batch {
                let json = serde_json::to_vec(entry)?;
                let ts = entry.timestamp.timestamp_millis();
                entries.insert(entry.id.as_str(), json.as_slice())?;
                time_idx.insert(make_time_key(ts, &entry.id).as_slice(), entry.id.as_str())?;
                if let Some(session_id) = &entry.session_id {
                    session_idx.insert(
                        make_session_key(session_id, ts, &entry.id).as_slice(),
                        entry.id.as_str(),
                    )?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a single entry by id.
    pub fn get(&self, entry_id: &str) -> AuditStoreResult<Option<AuditEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        match table.get(entry_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Newest-first scan of entries with `start ≤ timestamp ≤ end`.
    ///
    /// `max` bounds how many rows are materialized; filtering above this
    /// layer applies offset/limit pagination.
    pub fn scan_range(
        &self,
        start_ms: i64,
        end_ms: i64,
        max: usize,
    ) -> AuditStoreResult<Vec<AuditEntry>> {
        let read_txn = self.db.begin_read()?;
        let time_idx = read_txn.open_table(TIME_INDEX)?;
        let entries = read_txn.open_table(ENTRIES)?;

        // Inverted timestamps: newest (largest ts) sorts first.
        let lower = invert_ts(end_ms).to_vec();
        let mut upper = invert_ts(start_ms).to_vec();
        upper.extend_from_slice(&[0xFF; 20]);

        let mut results = Vec::new();
        for item in time_idx.range(lower.as_slice()..upper.as_slice())? {
            let (_, id) = item?;
            if let Some(value) = entries.get(id.value())? {
                results.push(serde_json::from_slice(value.value())?);
            }
            if results.len() >= max {
                break;
            }
        }
        Ok(results)
    }

    /// Newest-first scan of one session's entries.
    pub fn scan_session(&self, session_id: &str, max: usize) -> AuditStoreResult<Vec<AuditEntry>> {
        let read_txn = self.db.begin_read()?;
        let session_idx = read_txn.open_table(SESSION_INDEX)?;
        let entries = read_txn.open_table(ENTRIES)?;

        let prefix = make_session_prefix(session_id);
        let prefix_end = make_session_prefix_end(session_id);

        let mut results = Vec::new();
        for item in session_idx.range(prefix.as_slice()..prefix_end.as_slice())? {
            let (_, id) = item?;
            if let Some(value) = entries.get(id.value())? {
                results.push(serde_json::from_slice(value.value())?);
            }
            if results.len() >= max {
                break;
            }
        }
        Ok(results)
    }

    /// Delete all entries older than `cutoff_ms`. Returns how many were
    /// removed. Used only by retention purging; entries inside the
    /// retention window are never touched.
    pub fn purge_before(&self, cutoff_ms: i64) -> AuditStoreResult<usize> {
        // ts < cutoff ⇔ !ts > !cutoff: scan from just past the cutoff key.
        let mut lower = invert_ts(cutoff_ms).to_vec();
        lower.extend_from_slice(&[0xFF; 20]);

        let doomed: Vec<(Vec<u8>, String)> = {
            let read_txn = self.db.begin_read()?;
            let time_idx = read_txn.open_table(TIME_INDEX)?;
            let mut doomed = Vec::new();
            for item in time_idx.range(lower.as_slice()..)? {
                let (key, id) = item?;
                doomed.push((key.value().to_vec(), id.value().to_string()));
            }
            doomed
        };

        if doomed.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut entries = write_txn.open_table(ENTRIES)?;
            let mut time_idx = write_txn.open_table(TIME_INDEX)?;
            let mut session_idx = write_txn.open_table(SESSION_INDEX)?;

            for (time_key, id) in &doomed {
                let removed = entries.remove(id.as_str())?;
                time_idx.remove(time_key.as_slice())?;

                if let Some(value) = removed {
                    let entry: AuditEntry = serde_json::from_slice(value.value())?;
                    if let Some(session_id) = &entry.session_id {
                        session_idx.remove(
                            make_session_key(
                                session_id,
                                entry.timestamp.timestamp_millis(),
                                &entry.id,
                            )
                            .as_slice(),
                        )?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(doomed.len())
    }

    /// Total number of stored entries.
    pub fn len(&self) -> AuditStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        Ok(table.len()?)
    }
}
