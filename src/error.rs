// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Error taxonomy and HTTP mapping.
//!
//! [`CoreError`] is the crate-wide taxonomy; subsystem errors fold into it
//! at the service boundary. Cryptographic and integrity failures never
//! degrade silently; they surface here rather than as defaults. The HTTP
//! mapping keeps internal detail out of responses: auth failures carry an
//! actionable `error_code`, rate limits carry a retry-after hint, and
//! everything else is a generic failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::abuse::AbuseError;
use crate::audit::AuditError;
use crate::encryption::FieldError;
use crate::keys::KeyError;
use crate::session::token::TokenError;
use crate::storage::StorageError;

/// Crate-wide error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("session has expired")]
    SessionExpired,

    #[error("request rejected by risk policy")]
    RiskRejected { risk_score: u8 },

    #[error("multi-factor verification required")]
    MfaRequired,

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("identity is blocked")]
    Blocked { retry_after_secs: u64 },

    #[error("encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("decryption failure: {0}")]
    DecryptionFailure(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FieldError> for CoreError {
    fn from(e: FieldError) -> Self {
        match e {
            FieldError::Encrypt(field) => CoreError::EncryptionFailure(field),
            FieldError::Decrypt(field) => CoreError::DecryptionFailure(field),
            FieldError::FieldMismatch { expected, .. } => CoreError::DecryptionFailure(expected),
            FieldError::NotSearchable(field) => {
                CoreError::InvalidRequest(format!("field {field} is not searchable"))
            }
            FieldError::Key(e) => e.into(),
            FieldError::Storage(e) => e.into(),
        }
    }
}

impl From<KeyError> for CoreError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::NotFound { key_id, .. } | KeyError::Expired { key_id, .. } => {
                CoreError::DecryptionFailure(format!("key {key_id} unavailable"))
            }
            KeyError::Crypto(_) => CoreError::EncryptionFailure("cryptographic failure".into()),
            KeyError::Storage(e) => e.into(),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::IntegrityViolation(msg) => CoreError::IntegrityViolation(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<TokenError> for CoreError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => CoreError::SessionExpired,
            TokenError::Invalid | TokenError::Revoked => {
                CoreError::AuthenticationRequired("invalid or revoked token".into())
            }
            TokenError::Issue(msg) => CoreError::Internal(msg),
            TokenError::Crypto(_) => CoreError::Internal("token key failure".into()),
            TokenError::Storage(e) => e.into(),
        }
    }
}

impl From<AbuseError> for CoreError {
    fn from(e: AbuseError) -> Self {
        match e {
            AbuseError::Storage(e) => e.into(),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<AuditError> for CoreError {
    fn from(e: AuditError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<crate::crypto::CryptoError> for CoreError {
    fn from(e: crate::crypto::CryptoError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl CoreError {
    /// Stable machine-readable code for API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::AuthenticationRequired(_) => "authentication_required",
            CoreError::SessionExpired => "session_expired",
            CoreError::RiskRejected { .. } => "risk_rejected",
            CoreError::MfaRequired => "mfa_required",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::Blocked { .. } => "blocked",
            CoreError::EncryptionFailure(_) => "encryption_failure",
            CoreError::DecryptionFailure(_) => "decryption_failure",
            CoreError::IntegrityViolation(_) => "integrity_violation",
            CoreError::QuotaExceeded(_) => "quota_exceeded",
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::AuthenticationRequired(_)
            | CoreError::SessionExpired
            | CoreError::MfaRequired => StatusCode::UNAUTHORIZED,
            CoreError::RiskRejected { .. } | CoreError::Blocked { .. } => StatusCode::FORBIDDEN,
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::QuotaExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            CoreError::EncryptionFailure(_)
            | CoreError::DecryptionFailure(_)
            | CoreError::IntegrityViolation(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message clients may see. Internal failure classes collapse to a
    /// generic message so no internal detail leaks.
    fn public_message(&self) -> String {
        match self {
            CoreError::AuthenticationRequired(_) => "Sign in to continue".to_string(),
            CoreError::SessionExpired => "Session has expired; sign in again".to_string(),
            CoreError::RiskRejected { .. } => {
                "Request rejected; re-authentication required".to_string()
            }
            CoreError::MfaRequired => "Multi-factor verification required".to_string(),
            CoreError::RateLimited { .. } => "Too many requests; slow down".to_string(),
            CoreError::Blocked { .. } => "Access temporarily blocked".to_string(),
            CoreError::InvalidRequest(msg) => msg.clone(),
            CoreError::QuotaExceeded(_) => "Storage quota exceeded".to_string(),
            CoreError::EncryptionFailure(_)
            | CoreError::DecryptionFailure(_)
            | CoreError::IntegrityViolation(_)
            | CoreError::Internal(_) => "Internal error".to_string(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            CoreError::RateLimited { retry_after_secs }
            | CoreError::Blocked { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();
        let body = Json(ErrorBody {
            error: self.public_message(),
            error_code: self.error_code().to_string(),
            retry_after_secs: retry_after,
        });
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
