// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Session token issuance, verification, and revocation.
//!
//! Access tokens are HS256 JWTs carrying the session id, owning user, and
//! tier; refresh tokens are opaque random strings held only by the session
//! record. Rotation revokes the prior access token's `jti`, so a replayed
//! token fails verification even while its `exp` is still in the future.
//! The revocation set is persisted write-through and pruned once entries
//! outlive the longest possible token lifetime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, CryptoError};
use crate::storage::{CoreStorage, StorageError};

use super::tier::SecurityTier;

/// Clock skew tolerance for token verification (60 seconds).
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// Refresh tokens carry 32 bytes of entropy.
const REFRESH_TOKEN_BYTES: usize = 32;

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Owning user id.
    pub sub: String,
    /// Session id.
    pub sid: String,
    pub tier: SecurityTier,
    /// Token id, tracked by the revocation set.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// An access/refresh token pair bound to one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// The access token's `jti`, kept for revocation on rotation.
    pub access_jti: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token issuance failed: {0}")]
    Issue(String),

    #[error("token is malformed or its signature is invalid")]
    Invalid,

    #[error("token has expired")]
    Expired,

    #[error("token has been revoked")]
    Revoked,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persisted revocation set: jti → revocation instant.
type RevocationSet = HashMap<String, DateTime<Utc>>;

/// Issues, verifies, and revokes session tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    revoked: RwLock<RevocationSet>,
    storage: Arc<CoreStorage>,
}

impl TokenService {
    /// Construct from the token-signing subkey, loading the persisted
    /// revocation set.
    pub fn new(secret: &[u8; 32], storage: Arc<CoreStorage>) -> Result<Self, TokenError> {
        let path = storage.paths().revoked_tokens();
        let revoked: RevocationSet = if storage.exists(&path) {
            storage.read_json(&path)?
        } else {
            RevocationSet::new()
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = CLOCK_SKEW_LEEWAY;

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            revoked: RwLock::new(revoked),
            storage,
        })
    }

    /// Issue a fresh token pair for a session.
    pub fn issue(
        &self,
        user_id: &str,
        session_id: &str,
        tier: SecurityTier,
        ttl: Duration,
    ) -> Result<TokenPair, TokenError> {
        let now = Utc::now();
        let jti = Uuid::new_v4().to_string();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            tier,
            jti: jti.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Issue(e.to_string()))?;
        let refresh_token = crypto::random_token(REFRESH_TOKEN_BYTES)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_jti: jti,
            issued_at: now,
        })
    }

    /// Verify an access token: signature, expiry, and revocation.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let data =
            decode::<AccessClaims>(token, &self.decoding, &self.validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                    _ => TokenError::Invalid,
                }
            })?;

        if self.is_revoked(&data.claims.jti) {
            return Err(TokenError::Revoked);
        }
        Ok(data.claims)
    }

    /// Add a token id to the revocation set.
    pub fn revoke(&self, jti: &str) -> Result<(), TokenError> {
        let mut revoked = self.revoked.write().expect("revocation lock poisoned");
        revoked.insert(jti.to_string(), Utc::now());
        self.persist_locked(&revoked)
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked
            .read()
            .expect("revocation lock poisoned")
            .contains_key(jti)
    }

    /// Drop revocations older than `max_age`. Tokens that old have expired
    /// on their own; keeping their `jti` only grows the set.
    pub fn prune(&self, max_age: Duration) -> Result<usize, TokenError> {
        let cutoff = Utc::now() - max_age;
        let mut revoked = self.revoked.write().expect("revocation lock poisoned");
        let before = revoked.len();
        revoked.retain(|_, revoked_at| *revoked_at >= cutoff);
        let dropped = before - revoked.len();
        if dropped > 0 {
            self.persist_locked(&revoked)?;
        }
        Ok(dropped)
    }

    fn persist_locked(&self, revoked: &RevocationSet) -> Result<(), TokenError> {
        self.storage
            .write_json(self.storage.paths().revoked_tokens(), revoked)?;
        Ok(())
    }
}
