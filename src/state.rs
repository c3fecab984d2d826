// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Application state: every subsystem explicitly constructed and wired at
//! startup, lifecycle tied to the process rather than first access. Tests
//! get clean isolation by building a fresh state over a temp directory.

use std::path::Path;
use std::sync::Arc;

use crate::abuse::{AbuseConfig, RateLimiter};
use crate::audit::{AuditConfig, AuditLog};
use crate::encryption::{FieldCipher, PolicyTable};
use crate::error::CoreError;
use crate::keys::{KeyRegistry, MasterSecret, RotationConfig};
use crate::session::{SessionConfig, SessionManager, TokenService};
use crate::storage::{CoreStorage, StoragePaths};

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<CoreStorage>,
    pub registry: Arc<KeyRegistry>,
    pub audit: Arc<AuditLog>,
    pub limiter: Arc<RateLimiter>,
    pub fields: Arc<FieldCipher>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Construct every subsystem in dependency order, leaves first.
    pub fn bootstrap(data_dir: &Path, master: MasterSecret) -> Result<Self, CoreError> {
        let integrity_key = master.storage_integrity_key()?;
        let token_key = master.subkey(b"session-tokens")?;
        let mfa_key = master.subkey(b"mfa-codes")?;
        let audit_key = master.subkey(b"audit-signing")?;

        let mut storage = CoreStorage::new(StoragePaths::new(data_dir), integrity_key);
        storage.initialize()?;
        storage.health_check()?;
        let storage = Arc::new(storage);

        let registry = Arc::new(KeyRegistry::new(
            master,
            storage.clone(),
            RotationConfig::default(),
        )?);
        let audit = Arc::new(AuditLog::new(
            audit_key,
            &storage.paths().audit_db(),
            AuditConfig::default(),
        )?);
        let limiter = Arc::new(RateLimiter::new(
            AbuseConfig::default(),
            storage.clone(),
            audit.clone(),
        )?);
        let fields = Arc::new(FieldCipher::new(
            registry.clone(),
            storage.clone(),
            audit.clone(),
            PolicyTable::default(),
        )?);
        let tokens = TokenService::new(&token_key, storage.clone())?;
        let sessions = Arc::new(SessionManager::new(
            SessionConfig::default(),
            tokens,
            limiter.clone(),
            fields.clone(),
            audit.clone(),
            storage.clone(),
            mfa_key,
        )?);

        Ok(Self {
            storage,
            registry,
            audit,
            limiter,
            fields,
            sessions,
        })
    }
}
