// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Persistent Storage Module
//!
//! Cache-plus-durable-store backing for the security core. In-memory maps
//! are an index, never the system of record: every mutation writes through
//! this layer before the operation is considered committed, so a process
//! restart cannot silently lose a termination or a key rotation.
//!
//! ## Storage Layout
//!
//! ```text
//! /var/lib/haven/
//!   sessions/{session_id}.json   # Persisted sessions (sensitive attrs encrypted)
//!   vault/{token}.json           # Tokenized field ciphertext
//!   index/{field}.json           # Blind-index buckets per field
//!   audit/audit.redb             # Embedded audit database (append-only)
//!   meta/keys.json               # Key registry metadata (never key material)
//!   meta/reputation.json         # Abuse reputation records
//!   meta/revoked.json            # Token revocation set
//! ```
//!
//! Every JSON/byte file carries an HMAC-SHA256 sidecar (`.sum`) verified on
//! load; the audit database carries per-entry signatures instead.

pub mod paths;
pub mod store;

pub use paths::StoragePaths;
pub use store::{CoreStorage, StorageError, StorageResult};
