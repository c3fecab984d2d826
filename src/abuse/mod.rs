// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Rate Limiter / Abuse Detector
//!
//! Gates every inbound operation by identity and endpoint before any other
//! subsystem runs. Endpoint classes carry distinct ceilings: authentication
//! endpoints are strict, crisis endpoints intentionally allow *higher*
//! throughput so a person in crisis is never throttled, and everything else
//! takes the general default.
//!
//! Escalation: violations raise the identity's reputation score; the score
//! decays toward zero while the identity behaves. Crossing the challenge
//! threshold demands human verification; crossing the block threshold (or
//! repeating violations) earns a timed block. Attack signatures and decoy
//! endpoints skip the ladder entirely and block for days.
//!
//! The checker fails closed: an internal error rejects the request.

pub mod signatures;
pub mod windows;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::audit::{AuditDraft, AuditKind, AuditLog, Outcome, Severity};
use crate::crypto::{self, CryptoError, HashedSecret, SecretHashError};
use crate::storage::{CoreStorage, StorageError};

pub use windows::{WindowStatus, WindowTable};

/// Sliding-window ceiling for one endpoint class.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl LimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Endpoint classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    Authentication,
    Crisis,
    General,
}

/// Abuse-detection configuration.
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    pub auth_limit: LimitPolicy,
    pub crisis_limit: LimitPolicy,
    pub general_limit: LimitPolicy,
    pub auth_prefixes: Vec<String>,
    pub crisis_prefixes: Vec<String>,
    /// Routes that serve no legitimate purpose; any hit is conclusive.
    pub decoy_endpoints: Vec<String>,
    pub window_capacity: usize,
    /// Score added per violation.
    pub violation_weight: f64,
    /// Score at which human verification is demanded.
    pub challenge_threshold: f64,
    /// Score at which a timed block is applied.
    pub block_threshold: f64,
    /// Violations that trigger a timed block regardless of score.
    pub repeat_violation_limit: u32,
    pub violation_block: Duration,
    /// Block applied on attack signatures and decoy hits.
    pub signature_block: Duration,
    /// Score credited back on a successful challenge.
    pub challenge_credit: f64,
    pub decay_per_hour: f64,
    /// Reputation records idle this long with a low score are forgotten.
    pub stale_after: Duration,
    pub stale_score: f64,
    pub challenge_ttl: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            auth_limit: LimitPolicy::new(5, Duration::minutes(15)),
            crisis_limit: LimitPolicy::new(120, Duration::minutes(1)),
            general_limit: LimitPolicy::new(60, Duration::minutes(1)),
            auth_prefixes: vec!["/v1/sessions".to_string()],
            crisis_prefixes: vec!["/v1/crisis".to_string()],
            decoy_endpoints: vec![
                "/wp-login.php".to_string(),
                "/admin.php".to_string(),
                "/.env".to_string(),
                "/v1/internal/export-all".to_string(),
            ],
            window_capacity: 4096,
            violation_weight: 15.0,
            challenge_threshold: 40.0,
            block_threshold: 80.0,
            repeat_violation_limit: 6,
            violation_block: Duration::hours(1),
            signature_block: Duration::hours(72),
            challenge_credit: 25.0,
            decay_per_hour: 2.0,
            stale_after: Duration::hours(24),
            stale_score: 10.0,
            challenge_ttl: Duration::minutes(10),
        }
    }
}

/// Per-network-identity abuse score.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReputationRecord {
    pub identity: String,
    /// 0–100; rises on abuse, decays while idle.
    pub score: f64,
    pub last_seen: DateTime<Utc>,
    pub violation_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub challenge_required: bool,
}

impl ReputationRecord {
    fn new(identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            score: 0.0,
            last_seen: now,
            violation_count: 0,
            blocked_until: None,
            block_reason: None,
            challenge_required: false,
        }
    }

    /// Score after decay since `last_seen`.
    fn effective_score(&self, now: DateTime<Utc>, decay_per_hour: f64) -> f64 {
        let hours = (now - self.last_seen).num_minutes() as f64 / 60.0;
        (self.score - decay_per_hour * hours.max(0.0)).max(0.0)
    }

    /// Apply decay and advance `last_seen`.
    fn touch(&mut self, now: DateTime<Utc>, decay_per_hour: f64) {
        self.score = self.effective_score(now, decay_per_hour);
        self.last_seen = now;
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
            self.block_reason = None;
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blocked,
    RateExceeded,
    AttackSignature,
    DecoyEndpoint,
    ChallengeRequired,
    Internal,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl Decision {
    fn allowed(remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at: Some(reset_at),
            retry_after_secs: None,
            reason: None,
        }
    }

    fn denied(reason: DenyReason, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at: None,
            retry_after_secs: retry_after.map(|d| d.num_seconds().max(0) as u64),
            reason: Some(reason),
        }
    }
}

/// One inbound request, as seen by the gate.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRequest<'a> {
    pub endpoint: &'a str,
    pub identity: &'a str,
    pub user_id: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// A pending human-verification challenge. The answer is returned once at
/// issue time for out-of-band delivery; only its hash is retained.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChallengeTicket {
    pub challenge_id: String,
    pub answer: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingChallenge {
    challenge_id: String,
    answer_hash: HashedSecret,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AbuseError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Hash(#[from] SecretHashError),
}

/// Counts from one cleanup sweep.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CleanupStats {
    pub windows_dropped: usize,
    pub blocks_cleared: usize,
    pub reputation_dropped: usize,
    pub challenges_dropped: usize,
}

/// The rate limiter / abuse detector service.
pub struct RateLimiter {
    config: AbuseConfig,
    windows: WindowTable,
    reputation: RwLock<HashMap<String, ReputationRecord>>,
    challenges: Mutex<HashMap<String, PendingChallenge>>,
    audit: Arc<AuditLog>,
    storage: Arc<CoreStorage>,
}

impl RateLimiter {
    /// Construct the limiter, loading persisted reputation records.
    pub fn new(
        config: AbuseConfig,
        storage: Arc<CoreStorage>,
        audit: Arc<AuditLog>,
    ) -> Result<Self, AbuseError> {
        let path = storage.paths().reputation();
        let reputation: HashMap<String, ReputationRecord> = if storage.exists(&path) {
            storage.read_json(&path)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            windows: WindowTable::new(config.window_capacity),
            config,
            reputation: RwLock::new(reputation),
            challenges: Mutex::new(HashMap::new()),
            audit,
            storage,
        })
    }

    /// Classify an endpoint into its limit class.
    pub fn classify(&self, endpoint: &str) -> EndpointClass {
        if self
            .config
            .auth_prefixes
            .iter()
            .any(|p| endpoint.starts_with(p.as_str()))
        {
            EndpointClass::Authentication
        } else if self
            .config
            .crisis_prefixes
            .iter()
            .any(|p| endpoint.starts_with(p.as_str()))
        {
            EndpointClass::Crisis
        } else {
            EndpointClass::General
        }
    }

    fn policy_for(&self, class: EndpointClass) -> &LimitPolicy {
        match class {
            EndpointClass::Authentication => &self.config.auth_limit,
            EndpointClass::Crisis => &self.config.crisis_limit,
            EndpointClass::General => &self.config.general_limit,
        }
    }

    /// Gate one request. Never panics, never blocks for long, and fails
    /// closed: internal errors deny the request.
    pub fn check(&self, req: &RateLimitRequest<'_>) -> Decision {
        match self.check_inner(req) {
            Ok(decision) => decision,
            Err(e) => {
                error!(identity = %req.identity, error = %e, "Rate-limit check failed; rejecting");
                Decision::denied(DenyReason::Internal, Some(Duration::seconds(60)))
            }
        }
    }

    fn check_inner(&self, req: &RateLimitRequest<'_>) -> Result<Decision, AbuseError> {
        let now = Utc::now();

        // Decoy endpoints: conclusive, block for days.
        if self
            .config
            .decoy_endpoints
            .iter()
            .any(|d| req.endpoint.starts_with(d.as_str()))
        {
            self.apply_block(req.identity, self.config.signature_block, "decoy endpoint", now)?;
            self.audit.log(
                AuditDraft::new(AuditKind::DecoyEndpointAccessed)
                    .with_resource("endpoint", req.endpoint)
                    .with_severity(Severity::Critical)
                    .with_outcome(Outcome::Failure)
                    .with_detail("identity", req.identity),
            );
            return Ok(Decision::denied(
                DenyReason::DecoyEndpoint,
                Some(self.config.signature_block),
            ));
        }

        // Standing block?
        if let Some(until) = self.blocked_until(req.identity, now) {
            return Ok(Decision::denied(DenyReason::Blocked, Some(until - now)));
        }

        // Known attack signatures: conclusive, block for days.
        if let Some(signature) = signatures::detect(req.endpoint, req.user_agent) {
            self.apply_block(req.identity, self.config.signature_block, signature, now)?;
            self.audit.log(
                AuditDraft::new(AuditKind::AttackSignatureDetected)
                    .with_resource("endpoint", req.endpoint)
                    .with_severity(Severity::Critical)
                    .with_outcome(Outcome::Failure)
                    .with_detail("signature", signature)
                    .with_detail("identity", req.identity),
            );
            return Ok(Decision::denied(
                DenyReason::AttackSignature,
                Some(self.config.signature_block),
            ));
        }

        // Pending human verification gates everything else.
        if self.challenge_required(req.identity) {
            return Ok(Decision::denied(DenyReason::ChallengeRequired, None));
        }

        // Sliding window for the composite key.
        let class = self.classify(req.endpoint);
        let policy = self.policy_for(class);
        let key = format!(
            "{}|{}|{}",
            req.identity,
            req.user_id.unwrap_or("-"),
            req.endpoint
        );
        let status = self
            .windows
            .increment(&key, policy.max_requests, policy.window, now);

        if status.allowed {
            return Ok(Decision::allowed(status.remaining, status.reset_at));
        }

        self.register_violation(req.identity, now)?;
        self.audit.log(
            AuditDraft::new(AuditKind::RateLimitExceeded)
                .with_resource("endpoint", req.endpoint)
                .with_severity(Severity::Warning)
                .with_outcome(Outcome::Failure)
                .with_detail("identity", req.identity)
                .with_detail("class", format!("{class:?}").to_lowercase()),
        );
        Ok(Decision::denied(
            DenyReason::RateExceeded,
            Some(status.reset_at - now),
        ))
    }

    fn blocked_until(&self, identity: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let reputation = self.reputation.read().expect("reputation lock poisoned");
        reputation
            .get(identity)
            .and_then(|r| r.blocked_until)
            .filter(|until| *until > now)
    }

    fn challenge_required(&self, identity: &str) -> bool {
        let reputation = self.reputation.read().expect("reputation lock poisoned");
        reputation
            .get(identity)
            .is_some_and(|r| r.challenge_required)
    }

    /// Raise the identity's score and escalate if thresholds are crossed.
    fn register_violation(&self, identity: &str, now: DateTime<Utc>) -> Result<(), AbuseError> {
        let mut reputation = self.reputation.write().expect("reputation lock poisoned");
        let record = reputation
            .entry(identity.to_string())
            .or_insert_with(|| ReputationRecord::new(identity, now));

        record.touch(now, self.config.decay_per_hour);
        record.score = (record.score + self.config.violation_weight).min(100.0);
        record.violation_count += 1;

        if record.score >= self.config.block_threshold
            || record.violation_count >= self.config.repeat_violation_limit
        {
            record.blocked_until = Some(now + self.config.violation_block);
            record.block_reason = Some("repeated rate-limit violations".to_string());
            warn!(identity = %identity, score = record.score, "Identity blocked for repeated violations");
            self.audit.log(
                AuditDraft::new(AuditKind::IdentityBlocked)
                    .with_severity(Severity::Error)
                    .with_outcome(Outcome::Failure)
                    .with_detail("identity", identity)
                    .with_detail("reason", "repeated rate-limit violations"),
            );
        } else if record.score >= self.config.challenge_threshold {
            record.challenge_required = true;
        }

        self.persist_locked(&reputation)
    }

    fn apply_block(
        &self,
        identity: &str,
        duration: Duration,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AbuseError> {
        let mut reputation = self.reputation.write().expect("reputation lock poisoned");
        let record = reputation
            .entry(identity.to_string())
            .or_insert_with(|| ReputationRecord::new(identity, now));
        record.touch(now, self.config.decay_per_hour);
        record.score = 100.0;
        record.violation_count += 1;
        record.blocked_until = Some(now + duration);
        record.block_reason = Some(reason.to_string());
        self.persist_locked(&reputation)
    }

    /// Administratively block an identity.
    pub fn block_identity(
        &self,
        identity: &str,
        duration: Duration,
        reason: &str,
    ) -> Result<(), AbuseError> {
        self.apply_block(identity, duration, reason, Utc::now())?;
        self.audit.log(
            AuditDraft::new(AuditKind::IdentityBlocked)
                .with_severity(Severity::Error)
                .with_detail("identity", identity)
                .with_detail("reason", reason)
                .with_detail("duration_secs", duration.num_seconds()),
        );
        Ok(())
    }

    /// Lift a block. Returns false if the identity was not blocked.
    pub fn unblock_identity(&self, identity: &str) -> Result<bool, AbuseError> {
        let mut reputation = self.reputation.write().expect("reputation lock poisoned");
        let Some(record) = reputation.get_mut(identity) else {
            return Ok(false);
        };
        if record.blocked_until.is_none() {
            return Ok(false);
        }
        record.blocked_until = None;
        record.block_reason = None;
        self.persist_locked(&reputation)?;
        drop(reputation);

        self.audit.log(
            AuditDraft::new(AuditKind::IdentityUnblocked).with_detail("identity", identity),
        );
        Ok(true)
    }

    /// Demand human verification from an identity. The returned ticket
    /// carries the expected answer exactly once, for out-of-band delivery;
    /// the limiter retains only an Argon2id hash.
    pub fn require_challenge(&self, identity: &str) -> Result<ChallengeTicket, AbuseError> {
        let now = Utc::now();
        let answer = challenge_code()?;
        let ticket = ChallengeTicket {
            challenge_id: Uuid::new_v4().to_string(),
            answer: answer.clone(),
            expires_at: now + self.config.challenge_ttl,
        };

        {
            let mut challenges = self.challenges.lock().expect("challenge lock poisoned");
            challenges.insert(
                identity.to_string(),
                PendingChallenge {
                    challenge_id: ticket.challenge_id.clone(),
                    answer_hash: HashedSecret::hash(&answer)?,
                    expires_at: ticket.expires_at,
                },
            );
        }

        {
            let mut reputation = self.reputation.write().expect("reputation lock poisoned");
            let record = reputation
                .entry(identity.to_string())
                .or_insert_with(|| ReputationRecord::new(identity, now));
            record.challenge_required = true;
            self.persist_locked(&reputation)?;
        }

        self.audit.log(
            AuditDraft::new(AuditKind::ChallengeIssued)
                .with_resource("challenge", ticket.challenge_id.clone())
                .with_detail("identity", identity),
        );
        Ok(ticket)
    }

    /// Resolve a pending challenge. Success clears the requirement and
    /// credits the identity's score.
    pub fn verify_challenge(&self, identity: &str, answer: &str) -> Result<bool, AbuseError> {
        let now = Utc::now();
        let verified = {
            let mut challenges = self.challenges.lock().expect("challenge lock poisoned");
            match challenges.get(identity) {
                None => false,
                Some(pending) if pending.expires_at < now => {
                    challenges.remove(identity);
                    false
                }
                Some(pending) => {
                    let ok = pending.answer_hash.verify(answer);
                    if ok {
                        challenges.remove(identity);
                    }
                    ok
                }
            }
        };

        if verified {
            let mut reputation = self.reputation.write().expect("reputation lock poisoned");
            if let Some(record) = reputation.get_mut(identity) {
                record.challenge_required = false;
                record.touch(now, self.config.decay_per_hour);
                record.score = (record.score - self.config.challenge_credit).max(0.0);
                self.persist_locked(&reputation)?;
            }
        }

        self.audit.log(
            AuditDraft::new(AuditKind::ChallengeVerified)
                .with_outcome(if verified {
                    Outcome::Success
                } else {
                    Outcome::Failure
                })
                .with_detail("identity", identity),
        );
        Ok(verified)
    }

    /// Current reputation for an identity, decay applied.
    pub fn reputation_of(&self, identity: &str) -> Option<ReputationRecord> {
        let reputation = self.reputation.read().expect("reputation lock poisoned");
        reputation.get(identity).map(|r| {
            let mut snapshot = r.clone();
            snapshot.score = r.effective_score(Utc::now(), self.config.decay_per_hour);
            snapshot
        })
    }

    /// Periodic sweep: expired windows, expired blocks, stale low-score
    /// reputation records, expired challenges.
    pub fn cleanup(&self) -> Result<CleanupStats, AbuseError> {
        let now = Utc::now();
        let mut stats = CleanupStats {
            // A window is dead once it is idle past the longest policy window.
            windows_dropped: self.windows.cleanup(self.longest_window(), now),
            ..Default::default()
        };

        {
            let mut reputation = self.reputation.write().expect("reputation lock poisoned");
            for record in reputation.values_mut() {
                if record.blocked_until.is_some_and(|until| until <= now) {
                    record.blocked_until = None;
                    record.block_reason = None;
                    stats.blocks_cleared += 1;
                }
            }

            let before = reputation.len();
            let decay = self.config.decay_per_hour;
            let stale_after = self.config.stale_after;
            let stale_score = self.config.stale_score;
            reputation.retain(|_, r| {
                r.blocked_until.is_some()
                    || r.challenge_required
                    || now - r.last_seen < stale_after
                    || r.effective_score(now, decay) > stale_score
            });
            stats.reputation_dropped = before - reputation.len();
            self.persist_locked(&reputation)?;
        }

        {
            let mut challenges = self.challenges.lock().expect("challenge lock poisoned");
            let before = challenges.len();
            challenges.retain(|_, c| c.expires_at >= now);
            stats.challenges_dropped = before - challenges.len();
        }

        Ok(stats)
    }

    fn longest_window(&self) -> Duration {
        [
            self.config.auth_limit.window,
            self.config.crisis_limit.window,
            self.config.general_limit.window,
        ]
        .into_iter()
        .max()
        .unwrap_or_else(|| Duration::minutes(15))
    }

    fn persist_locked(
        &self,
        reputation: &HashMap<String, ReputationRecord>,
    ) -> Result<(), AbuseError> {
        self.storage
            .write_json(self.storage.paths().reputation(), reputation)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_seen(&self, identity: &str, by: Duration) {
        let mut reputation = self.reputation.write().expect("reputation lock poisoned");
        if let Some(record) = reputation.get_mut(identity) {
            record.last_seen -= by;
        }
    }
}

/// Six-digit verification code from the system RNG.
fn challenge_code() -> Result<String, CryptoError> {
    let bytes = crypto::random_bytes(4)?;
    let n = u32::from_be_bytes(bytes.try_into().expect("requested 4 bytes"));
    Ok(format!("{:06}", n % 1_000_000))
}
