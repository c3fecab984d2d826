// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Session Lifecycle Manager
//!
//! Top-level orchestrator for authentication state. Consults the rate
//! limiter on creation, the field encryption engine for sensitive session
//! attributes at rest, and writes every transition to the audit log.
//!
//! State machine: `Active → (idle timeout | absolute timeout | explicit
//! logout | risk threshold) → Terminated`. `MfaPending` is a sub-state of
//! Active entered when elevation is requested without proof; `Suspicious`
//! is an overlay flag that lowers the forced-termination threshold rather
//! than blocking on its own.

pub mod tier;
pub mod token;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::abuse::{DenyReason, RateLimitRequest, RateLimiter};
use crate::audit::{AuditDraft, AuditKind, AuditLog, Outcome, Severity};
use crate::crypto::{self, keyed_hash};
use crate::encryption::{EncryptedValue, FieldCipher};
use crate::error::CoreError;
use crate::storage::{CoreStorage, StorageError};

pub use tier::SecurityTier;
pub use token::{AccessClaims, TokenPair, TokenService};

/// How a session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    Password,
    Sso,
    /// Crisis/emergency access: never blocked by auth friction.
    Emergency,
    Recovery,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Logout,
    IdleTimeout,
    AbsoluteTimeout,
    RiskThreshold,
    Evicted,
    AdminAction,
}

/// What the client must do to proceed after a failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAction {
    Mfa,
    Reauthenticate,
}

/// Mutable overlay flags on an active session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct SessionFlags {
    pub suspicious: bool,
    pub requires_reauth: bool,
    pub read_only: bool,
}

/// One authenticated (or emergency/anonymous) client context.
///
/// Exclusively owned by the [`SessionManager`]; other components only see
/// derived fields passed explicitly. Deliberately not serializable: the
/// persisted form is [`StoredSession`], which encrypts the sensitive
/// attributes first.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub origin: String,
    /// User-agent + device fingerprint hash.
    pub client_signature: String,
    pub tier: SecurityTier,
    pub mfa_verified: bool,
    pub mfa_pending: bool,
    pub permissions: Vec<String>,
    pub tokens: TokenPair,
    pub flags: SessionFlags,
    pub risk_events: u32,
    pub login_method: LoginMethod,
    pub device_id: Option<String>,
}

/// Token-free view of a session, safe to return from listings.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tier: SecurityTier,
    pub mfa_verified: bool,
    pub mfa_pending: bool,
    pub flags: SessionFlags,
    pub login_method: LoginMethod,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            created_at: s.created_at,
            last_activity: s.last_activity,
            expires_at: s.expires_at,
            tier: s.tier,
            mfa_verified: s.mfa_verified,
            mfa_pending: s.mfa_pending,
            flags: s.flags,
            login_method: s.login_method,
        }
    }
}

/// Durable form of a session: sensitive attributes are encrypted through
/// the field engine before they touch disk.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    origin: EncryptedValue,
    client_signature: EncryptedValue,
    tier: SecurityTier,
    mfa_verified: bool,
    mfa_pending: bool,
    permissions: Vec<String>,
    tokens: TokenPair,
    flags: SessionFlags,
    risk_events: u32,
    login_method: LoginMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
}

/// Inputs to [`SessionManager::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSessionParams<'a> {
    pub user_id: &'a str,
    pub origin: &'a str,
    pub client_signature: &'a str,
    pub login_method: LoginMethod,
    pub mfa_verified: bool,
    pub device_id: Option<&'a str>,
    /// The client intends to touch maximum-tier resources.
    pub sensitive_scope: bool,
}

/// Per-request context offered to validation for binding checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext<'a> {
    pub origin: Option<&'a str>,
    pub client_signature: Option<&'a str>,
}

/// Result of a validation pass.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    pub risk_score: u8,
}

impl ValidationOutcome {
    fn valid(risk_score: u8) -> Self {
        Self {
            valid: true,
            reason: None,
            required_action: None,
            risk_score,
        }
    }

    fn invalid(reason: &str, action: Option<RequiredAction>, risk_score: u8) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
            required_action: action,
            risk_score,
        }
    }
}

/// An MFA code issued for out-of-band delivery.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MfaChallenge {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingMfa {
    code_mac: [u8; 32],
    expires_at: DateTime<Utc>,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Concurrent sessions per user; oldest is evicted on overflow.
    pub max_sessions_per_user: usize,
    /// Risk events that force termination.
    pub risk_termination_threshold: u32,
    /// Lower threshold once the session is flagged suspicious.
    pub suspicious_termination_threshold: u32,
    /// Sessions inside this margin of expiry renew silently on validation.
    pub renewal_margin: Duration,
    /// Risk score contributed by an origin-address mismatch.
    pub origin_mismatch_score: u8,
    /// Risk score contributed by a client-signature mismatch.
    pub signature_mismatch_score: u8,
    pub mfa_code_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            risk_termination_threshold: 3,
            suspicious_termination_threshold: 2,
            renewal_margin: Duration::minutes(5),
            origin_mismatch_score: 40,
            signature_mismatch_score: 25,
            mfa_code_ttl: Duration::minutes(5),
        }
    }
}

/// The session lifecycle service.
pub struct SessionManager {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Session>>,
    tokens: TokenService,
    limiter: Arc<RateLimiter>,
    fields: Arc<FieldCipher>,
    audit: Arc<AuditLog>,
    storage: Arc<CoreStorage>,
    pending_mfa: Mutex<HashMap<String, PendingMfa>>,
    mfa_key: [u8; 32],
}

impl SessionManager {
    /// Construct the manager and restore persisted sessions. Snapshots that
    /// fail integrity verification are skipped and reported; expired ones
    /// are deleted.
    pub fn new(
        config: SessionConfig,
        tokens: TokenService,
        limiter: Arc<RateLimiter>,
        fields: Arc<FieldCipher>,
        audit: Arc<AuditLog>,
        storage: Arc<CoreStorage>,
        mfa_key: [u8; 32],
    ) -> Result<Self, CoreError> {
        let manager = Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            tokens,
            limiter,
            fields,
            audit,
            storage,
            pending_mfa: Mutex::new(HashMap::new()),
            mfa_key,
        };
        manager.restore_persisted()?;
        Ok(manager)
    }

    fn restore_persisted(&self) -> Result<(), CoreError> {
        let dir = self.storage.paths().sessions_dir();
        let ids = self.storage.list_files(&dir, "json").map_err(CoreError::from)?;
        let now = Utc::now();

        let mut restored = 0usize;
        for id in ids {
            let path = self.storage.paths().session(&id);
            let stored: StoredSession = match self.storage.read_json(&path) {
                Ok(s) => s,
                Err(StorageError::IntegrityViolation(msg)) => {
                    warn!(session_id = %id, "Persisted session failed integrity check; skipping");
                    self.audit.log(
                        AuditDraft::new(AuditKind::IntegrityCheckFailed)
                            .with_resource("session", id.clone())
                            .with_severity(Severity::Critical)
                            .with_outcome(Outcome::Failure)
                            .with_detail("error", msg),
                    );
                    continue;
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to restore session; skipping");
                    continue;
                }
            };

            if stored.expires_at <= now {
                let _ = self.storage.delete(&path);
                continue;
            }

            match self.decrypt_stored(stored) {
                Ok(session) => {
                    self.sessions
                        .write()
                        .expect("session lock poisoned")
                        .insert(session.id.clone(), session);
                    restored += 1;
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to decrypt session attributes; skipping");
                }
            }
        }

        if restored > 0 {
            info!(count = restored, "Restored persisted sessions");
        }
        Ok(())
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a session after the rate limiter admits the originating
    /// identity. Enforces the per-user concurrency ceiling and writes a
    /// login audit entry.
    pub fn create_session(&self, params: CreateSessionParams<'_>) -> Result<Session, CoreError> {
        // Emergency logins ride the crisis endpoint class, which carries a
        // deliberately generous ceiling.
        let endpoint = match params.login_method {
            LoginMethod::Emergency => "/v1/crisis/sessions",
            _ => "/v1/sessions",
        };
        let decision = self.limiter.check(&RateLimitRequest {
            endpoint,
            identity: params.origin,
            user_id: Some(params.user_id),
            user_agent: None,
        });
        if !decision.allowed {
            self.audit.log(
                AuditDraft::new(AuditKind::LoginFailure)
                    .with_user(params.user_id)
                    .with_severity(Severity::Warning)
                    .with_outcome(Outcome::Failure)
                    .with_detail("reason", format!("{:?}", decision.reason)),
            );
            return Err(match decision.reason {
                Some(
                    DenyReason::Blocked | DenyReason::DecoyEndpoint | DenyReason::AttackSignature,
                ) => CoreError::Blocked {
                    retry_after_secs: decision.retry_after_secs.unwrap_or(3600),
                },
                _ => CoreError::RateLimited {
                    retry_after_secs: decision.retry_after_secs.unwrap_or(60),
                },
            });
        }

        let tier = select_tier(&params)?;
        self.enforce_session_ceiling(params.user_id)?;

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let tokens = self
            .tokens
            .issue(params.user_id, &id, tier, tier.absolute_timeout())?;

        let session = Session {
            id: id.clone(),
            user_id: params.user_id.to_string(),
            created_at: now,
            last_activity: now,
            expires_at: now + tier.absolute_timeout(),
            origin: params.origin.to_string(),
            client_signature: params.client_signature.to_string(),
            tier,
            mfa_verified: params.mfa_verified,
            mfa_pending: false,
            permissions: default_permissions(tier),
            tokens,
            flags: SessionFlags::default(),
            risk_events: 0,
            login_method: params.login_method,
            device_id: params.device_id.map(str::to_string),
        };

        self.persist(&session)?;
        self.sessions
            .write()
            .expect("session lock poisoned")
            .insert(id.clone(), session.clone());

        let kind = match params.login_method {
            LoginMethod::Emergency => AuditKind::EmergencyAccess,
            _ => AuditKind::LoginSuccess,
        };
        self.audit.log(
            AuditDraft::new(kind)
                .with_user(params.user_id)
                .with_session(id)
                .with_detail("tier", tier.as_str())
                .with_detail("login_method", format!("{:?}", params.login_method).to_lowercase()),
        );

        Ok(session)
    }

    /// Evict the user's oldest sessions until a slot is free.
    fn enforce_session_ceiling(&self, user_id: &str) -> Result<(), CoreError> {
        loop {
            let oldest: Option<String> = {
                let sessions = self.sessions.read().expect("session lock poisoned");
                let mut owned: Vec<&Session> =
                    sessions.values().filter(|s| s.user_id == user_id).collect();
                if owned.len() < self.config.max_sessions_per_user {
                    return Ok(());
                }
                owned.sort_by_key(|s| s.created_at);
                owned.first().map(|s| s.id.clone())
            };

            match oldest {
                Some(id) => self.terminate_session(&id, TerminationReason::Evicted)?,
                None => return Ok(()),
            }
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate a session for one request. Checks, in order: existence,
    /// absolute expiry, idle timeout, the MFA requirement, and tier
    /// bindings. A session close to expiry renews before this returns.
    pub fn validate_session(
        &self,
        session_id: &str,
        ctx: RequestContext<'_>,
    ) -> Result<ValidationOutcome, CoreError> {
        let now = Utc::now();

        // Existence, expiry, idle timeout, and binding checks happen under
        // one short-lived write lock; renewal side effects follow after.
        let (outcome, terminate, renew) = {
            let mut sessions = self.sessions.write().expect("session lock poisoned");
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(ValidationOutcome::invalid("unknown or revoked session", None, 0));
            };

            if now > session.expires_at {
                (
                    ValidationOutcome::invalid("session expired", None, 0),
                    Some(TerminationReason::AbsoluteTimeout),
                    false,
                )
            } else if now - session.last_activity > session.tier.idle_timeout() {
                (
                    ValidationOutcome::invalid("idle timeout exceeded", None, 0),
                    Some(TerminationReason::IdleTimeout),
                    false,
                )
            } else if session.tier.requires_mfa() && !session.mfa_verified {
                (
                    ValidationOutcome::invalid(
                        "multi-factor verification required",
                        Some(RequiredAction::Mfa),
                        0,
                    ),
                    None,
                    false,
                )
            } else {
                let risk_score = binding_risk(&self.config, session, &ctx);
                if risk_score > 0 {
                    let threshold = if session.flags.suspicious {
                        self.config.suspicious_termination_threshold
                    } else {
                        self.config.risk_termination_threshold
                    };
                    session.risk_events += 1;
                    session.flags.suspicious = true;

                    if session.risk_events >= threshold {
                        (
                            ValidationOutcome::invalid(
                                "risk threshold exceeded",
                                Some(RequiredAction::Reauthenticate),
                                risk_score,
                            ),
                            Some(TerminationReason::RiskThreshold),
                            false,
                        )
                    } else {
                        session.last_activity = now;
                        let renew = session.expires_at - now <= self.config.renewal_margin;
                        (ValidationOutcome::valid(risk_score), None, renew)
                    }
                } else {
                    session.last_activity = now;
                    let renew = session.expires_at - now <= self.config.renewal_margin;
                    (ValidationOutcome::valid(0), None, renew)
                }
            }
        };

        if let Some(reason) = terminate {
            self.terminate_session(session_id, reason)?;
            return Ok(outcome);
        }

        // Silent renewal applies before the caller sees success, so the
        // caller never races a token that is about to rotate.
        if renew {
            self.renew_session(session_id)?;
        } else if outcome.valid {
            if let Some(session) = self
                .sessions
                .read()
                .expect("session lock poisoned")
                .get(session_id)
            {
                self.persist(session)?;
            }
        }

        Ok(outcome)
    }

    /// Verify a bearer access token, then validate its session.
    pub fn validate_token(
        &self,
        access_token: &str,
        ctx: RequestContext<'_>,
    ) -> Result<ValidationOutcome, CoreError> {
        let claims = self.tokens.verify_access(access_token)?;
        self.validate_session(&claims.sid, ctx)
    }

    // =========================================================================
    // Renewal / termination / elevation
    // =========================================================================

    /// Extend a session's expiry; tiers that mandate token rotation get a
    /// fresh pair while the prior access token joins the revocation set.
    pub fn renew_session(&self, session_id: &str) -> Result<Session, CoreError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(CoreError::AuthenticationRequired("unknown session".into()));
        };

        session.expires_at = now + session.tier.absolute_timeout();
        session.last_activity = now;

        let rotated = session.tier.rotates_tokens();
        if rotated {
            self.tokens.revoke(&session.tokens.access_jti)?;
            session.tokens = self.tokens.issue(
                &session.user_id,
                &session.id,
                session.tier,
                session.tier.absolute_timeout(),
            )?;
        }

        let snapshot = session.clone();
        drop(sessions);

        self.persist(&snapshot)?;
        self.audit.log(
            AuditDraft::new(AuditKind::SessionRenewed)
                .with_user(snapshot.user_id.clone())
                .with_session(session_id)
                .with_detail("rotated_tokens", rotated),
        );
        Ok(snapshot)
    }

    /// Revoke tokens, drop the session, and log the termination with its
    /// lifetime duration.
    pub fn terminate_session(
        &self,
        session_id: &str,
        reason: TerminationReason,
    ) -> Result<(), CoreError> {
        let removed = {
            let mut sessions = self.sessions.write().expect("session lock poisoned");
            sessions.remove(session_id)
        };
        let Some(session) = removed else {
            return Err(CoreError::AuthenticationRequired("unknown session".into()));
        };

        self.tokens.revoke(&session.tokens.access_jti)?;
        self.storage
            .delete(self.storage.paths().session(session_id))
            .or_else(ignore_not_found)
            .map_err(CoreError::from)?;
        self.pending_mfa
            .lock()
            .expect("mfa lock poisoned")
            .remove(session_id);

        let kind = match reason {
            TerminationReason::Logout => AuditKind::Logout,
            TerminationReason::Evicted => AuditKind::SessionEvicted,
            _ => AuditKind::SessionTerminated,
        };
        let duration = (Utc::now() - session.created_at).num_seconds();
        self.audit.log(
            AuditDraft::new(kind)
                .with_user(session.user_id.clone())
                .with_session(session_id)
                .with_detail("reason", format!("{reason:?}"))
                .with_detail("duration_secs", duration),
        );
        Ok(())
    }

    /// Issue an MFA code for a session, entering the MfaPending sub-state.
    /// The code is returned once for out-of-band delivery; only its MAC is
    /// retained.
    pub fn request_mfa(&self, session_id: &str) -> Result<MfaChallenge, CoreError> {
        let user_id = {
            let mut sessions = self.sessions.write().expect("session lock poisoned");
            let Some(session) = sessions.get_mut(session_id) else {
                return Err(CoreError::AuthenticationRequired("unknown session".into()));
            };
            session.mfa_pending = true;
            session.user_id.clone()
        };

        let code = mfa_code()?;
        let expires_at = Utc::now() + self.config.mfa_code_ttl;
        self.pending_mfa.lock().expect("mfa lock poisoned").insert(
            session_id.to_string(),
            PendingMfa {
                code_mac: keyed_hash::sign(&self.mfa_key, code.as_bytes()),
                expires_at,
            },
        );

        self.audit.log(
            AuditDraft::new(AuditKind::MfaChallengeIssued)
                .with_user(user_id)
                .with_session(session_id),
        );
        Ok(MfaChallenge { code, expires_at })
    }

    fn consume_mfa_proof(&self, session_id: &str, proof: &str) -> bool {
        let mut pending = self.pending_mfa.lock().expect("mfa lock poisoned");
        let Some(entry) = pending.get(session_id) else {
            return false;
        };
        if entry.expires_at < Utc::now() {
            pending.remove(session_id);
            return false;
        }
        let ok = keyed_hash::verify(&self.mfa_key, proof.as_bytes(), &entry.code_mac);
        if ok {
            pending.remove(session_id);
        }
        ok
    }

    /// Upgrade a session's tier. The target tier's MFA requirement must be
    /// satisfied, either by the session's existing verification or by
    /// `mfa_proof`.
    /// Expiry is clamped to the stricter tier's absolute timeout.
    pub fn elevate_session(
        &self,
        session_id: &str,
        target: SecurityTier,
        mfa_proof: Option<&str>,
    ) -> Result<Session, CoreError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(CoreError::AuthenticationRequired("unknown session".into()));
        };

        if target <= session.tier {
            return Ok(session.clone());
        }

        if target.requires_mfa() && !session.mfa_verified {
            let proof_ok = mfa_proof.is_some_and(|p| self.consume_mfa_proof(session_id, p));
            if !proof_ok {
                session.mfa_pending = true;
                let snapshot = session.clone();
                drop(sessions);
                self.persist(&snapshot)?;
                return Err(CoreError::MfaRequired);
            }
            session.mfa_verified = true;
            session.mfa_pending = false;
            self.audit.log(
                AuditDraft::new(AuditKind::MfaVerified)
                    .with_user(session.user_id.clone())
                    .with_session(session_id),
            );
        }

        let from = session.tier;
        session.tier = target;
        session.expires_at = session.expires_at.min(now + target.absolute_timeout());
        session.permissions = default_permissions(target);

        // Tier is baked into the token claims: rotate the pair.
        self.tokens.revoke(&session.tokens.access_jti)?;
        session.tokens = self.tokens.issue(
            &session.user_id,
            &session.id,
            target,
            (session.expires_at - now).max(Duration::zero()),
        )?;

        let snapshot = session.clone();
        drop(sessions);

        self.persist(&snapshot)?;
        self.audit.log(
            AuditDraft::new(AuditKind::SessionElevated)
                .with_user(snapshot.user_id.clone())
                .with_session(session_id)
                .with_detail("from", from.as_str())
                .with_detail("to", target.as_str()),
        );
        Ok(snapshot)
    }

    // =========================================================================
    // Queries and maintenance
    // =========================================================================

    /// Snapshot of one session.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Token-free summaries of a user's active sessions, newest first.
    pub fn get_user_sessions(&self, user_id: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(SessionSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Terminate sessions past their absolute or idle limits. Takes a
    /// short-lived lock per session rather than holding one across the
    /// whole sweep.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(String, TerminationReason)> = {
            let sessions = self.sessions.read().expect("session lock poisoned");
            sessions
                .values()
                .filter_map(|s| {
                    if now > s.expires_at {
                        Some((s.id.clone(), TerminationReason::AbsoluteTimeout))
                    } else if now - s.last_activity > s.tier.idle_timeout() {
                        Some((s.id.clone(), TerminationReason::IdleTimeout))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut swept = 0;
        for (id, reason) in expired {
            if self.terminate_session(&id, reason).is_ok() {
                swept += 1;
            }
        }
        swept
    }

    /// Prune revocation-set entries older than the longest token lifetime.
    pub fn prune_revoked_tokens(&self) -> Result<usize, CoreError> {
        let max_lifetime = SecurityTier::Basic.absolute_timeout() + Duration::hours(1);
        Ok(self.tokens.prune(max_lifetime)?)
    }

    /// Proactively rotate token pairs older than `max_age` on tiers that
    /// mandate rotation, without extending the session. Replayed prior
    /// tokens fail once their `jti` lands in the revocation set.
    pub fn push_token_rotation(&self, max_age: Duration) -> Result<usize, CoreError> {
        let now = Utc::now();
        let due: Vec<String> = {
            let sessions = self.sessions.read().expect("session lock poisoned");
            sessions
                .values()
                .filter(|s| s.tier.rotates_tokens() && now - s.tokens.issued_at > max_age)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut rotated = 0;
        for id in due {
            let snapshot = {
                let mut sessions = self.sessions.write().expect("session lock poisoned");
                let Some(session) = sessions.get_mut(&id) else {
                    continue;
                };
                self.tokens.revoke(&session.tokens.access_jti)?;
                session.tokens = self.tokens.issue(
                    &session.user_id,
                    &session.id,
                    session.tier,
                    (session.expires_at - now).max(Duration::zero()),
                )?;
                session.clone()
            };
            self.persist(&snapshot)?;
            rotated += 1;
        }
        Ok(rotated)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn persist(&self, session: &Session) -> Result<(), CoreError> {
        let stored = self.encrypt_stored(session)?;
        self.storage
            .write_json(self.storage.paths().session(&session.id), &stored)
            .map_err(CoreError::from)
    }

    fn encrypt_stored(&self, session: &Session) -> Result<StoredSession, CoreError> {
        Ok(StoredSession {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            expires_at: session.expires_at,
            origin: self
                .fields
                .encrypt_field("session_origin", &session.origin, Some(&session.user_id))?,
            client_signature: self.fields.encrypt_field(
                "session_client_signature",
                &session.client_signature,
                Some(&session.user_id),
            )?,
            tier: session.tier,
            mfa_verified: session.mfa_verified,
            mfa_pending: session.mfa_pending,
            permissions: session.permissions.clone(),
            tokens: session.tokens.clone(),
            flags: session.flags,
            risk_events: session.risk_events,
            login_method: session.login_method,
            device_id: session.device_id.clone(),
        })
    }

    fn decrypt_stored(&self, stored: StoredSession) -> Result<Session, CoreError> {
        Ok(Session {
            origin: self.fields.decrypt_field(
                "session_origin",
                &stored.origin,
                Some(&stored.user_id),
            )?,
            client_signature: self.fields.decrypt_field(
                "session_client_signature",
                &stored.client_signature,
                Some(&stored.user_id),
            )?,
            id: stored.id,
            user_id: stored.user_id,
            created_at: stored.created_at,
            last_activity: stored.last_activity,
            expires_at: stored.expires_at,
            tier: stored.tier,
            mfa_verified: stored.mfa_verified,
            mfa_pending: stored.mfa_pending,
            permissions: stored.permissions,
            tokens: stored.tokens,
            flags: stored.flags,
            risk_events: stored.risk_events,
            login_method: stored.login_method,
            device_id: stored.device_id,
        })
    }

    #[cfg(test)]
    pub(crate) fn adjust_for_test(&self, session_id: &str, f: impl FnOnce(&mut Session)) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            f(session);
        }
    }
}

/// Tier selection from creation context.
fn select_tier(params: &CreateSessionParams<'_>) -> Result<SecurityTier, CoreError> {
    if params.login_method == LoginMethod::Emergency {
        return Ok(SecurityTier::Basic);
    }
    if params.sensitive_scope {
        if params.mfa_verified {
            return Ok(SecurityTier::Maximum);
        }
        return Err(CoreError::MfaRequired);
    }
    if params.mfa_verified {
        return Ok(SecurityTier::Elevated);
    }
    Ok(SecurityTier::Basic)
}

fn default_permissions(tier: SecurityTier) -> Vec<String> {
    let perms: &[&str] = match tier {
        SecurityTier::Basic => &["records:read"],
        SecurityTier::Elevated => &["records:read", "records:write"],
        SecurityTier::Maximum => &["records:read", "records:write", "records:sensitive"],
    };
    perms.iter().map(|p| p.to_string()).collect()
}

/// Risk contributed by tier-binding mismatches. Address mismatches weigh
/// more than signature mismatches.
fn binding_risk(
    config: &SessionConfig,
    session: &Session,
    ctx: &RequestContext<'_>,
) -> u8 {
    let mut score = 0u8;
    if session.tier.binds_origin() {
        if let Some(origin) = ctx.origin {
            if origin != session.origin {
                score = score.saturating_add(config.origin_mismatch_score);
            }
        }
    }
    if session.tier.binds_client_signature() {
        if let Some(signature) = ctx.client_signature {
            if signature != session.client_signature {
                score = score.saturating_add(config.signature_mismatch_score);
            }
        }
    }
    score
}

fn ignore_not_found(e: StorageError) -> Result<(), StorageError> {
    match e {
        StorageError::NotFound(_) => Ok(()),
        StorageError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => Err(other),
    }
}

/// Six-digit MFA code from the system RNG.
fn mfa_code() -> Result<String, CoreError> {
    let bytes = crypto::random_bytes(4)
        .map_err(|_| CoreError::Internal("rng unavailable".into()))?;
    let n = u32::from_be_bytes(bytes.try_into().expect("requested 4 bytes"));
    Ok(format!("{:06}", n % 1_000_000))
}
