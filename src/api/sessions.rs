// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::CoreError,
    session::{
        CreateSessionParams, LoginMethod, MfaChallenge, RequestContext, SecurityTier, Session,
        SessionSummary, TerminationReason, ValidationOutcome,
    },
    state::AppState,
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub user_id: String,
    /// Originating network address, as resolved by the edge.
    pub origin: String,
    /// User-agent + device fingerprint hash.
    pub client_signature: String,
    pub login_method: LoginMethod,
    #[serde(default)]
    pub mfa_verified: bool,
    #[serde(default)]
    pub device_id: Option<String>,
    /// The client intends to touch maximum-tier resources.
    #[serde(default)]
    pub sensitive_scope: bool,
}

/// Created or refreshed session, including the token pair. The only
/// surface that ever returns tokens.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub session: SessionSummary,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            access_token: session.tokens.access_token.clone(),
            refresh_token: session.tokens.refresh_token.clone(),
            expires_at: session.expires_at,
            session: SessionSummary::from(&session),
        }
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ValidateSessionRequest {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub client_signature: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidateTokenRequest {
    pub access_token: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub client_signature: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ElevateSessionRequest {
    pub target_tier: SecurityTier,
    #[serde(default)]
    pub mfa_proof: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct TerminateQuery {
    /// Defaults to `logout`.
    pub reason: Option<TerminationReason>,
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    tag = "Sessions",
    responses(
        (status = 201, body = SessionResponse),
        (status = 401, description = "MFA required for the requested scope"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), CoreError> {
    let session = state.sessions.create_session(CreateSessionParams {
        user_id: &request.user_id,
        origin: &request.origin,
        client_signature: &request.client_signature,
        login_method: request.login_method,
        mfa_verified: request.mfa_verified,
        device_id: request.device_id.as_deref(),
        sensitive_scope: request.sensitive_scope,
    })?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(session))))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/validate",
    params(("session_id" = String, Path, description = "Session to validate")),
    request_body = ValidateSessionRequest,
    tag = "Sessions",
    responses((status = 200, body = ValidationOutcome))
)]
pub async fn validate_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ValidateSessionRequest>,
) -> Result<Json<ValidationOutcome>, CoreError> {
    let outcome = state.sessions.validate_session(
        &session_id,
        RequestContext {
            origin: request.origin.as_deref(),
            client_signature: request.client_signature.as_deref(),
        },
    )?;
    Ok(Json(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/validate-token",
    request_body = ValidateTokenRequest,
    tag = "Sessions",
    responses(
        (status = 200, body = ValidationOutcome),
        (status = 401, description = "Token invalid, expired, or revoked")
    )
)]
pub async fn validate_token(
    State(state): State<AppState>,
    Json(request): Json<ValidateTokenRequest>,
) -> Result<Json<ValidationOutcome>, CoreError> {
    let outcome = state.sessions.validate_token(
        &request.access_token,
        RequestContext {
            origin: request.origin.as_deref(),
            client_signature: request.client_signature.as_deref(),
        },
    )?;
    Ok(Json(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/renew",
    params(("session_id" = String, Path, description = "Session to renew")),
    tag = "Sessions",
    responses((status = 200, body = SessionResponse))
)]
pub async fn renew_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionResponse>, CoreError> {
    let session = state.sessions.renew_session(&session_id)?;
    Ok(Json(SessionResponse::from(session)))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(
        ("session_id" = String, Path, description = "Session to terminate"),
        TerminateQuery
    ),
    tag = "Sessions",
    responses((status = 204))
)]
pub async fn terminate_session(
    Path(session_id): Path<String>,
    Query(query): Query<TerminateQuery>,
    State(state): State<AppState>,
) -> Result<StatusCode, CoreError> {
    state
        .sessions
        .terminate_session(&session_id, query.reason.unwrap_or(TerminationReason::Logout))?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/elevate",
    params(("session_id" = String, Path, description = "Session to elevate")),
    request_body = ElevateSessionRequest,
    tag = "Sessions",
    responses(
        (status = 200, body = SessionResponse),
        (status = 401, description = "MFA proof missing or invalid")
    )
)]
pub async fn elevate_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ElevateSessionRequest>,
) -> Result<Json<SessionResponse>, CoreError> {
    let session = state.sessions.elevate_session(
        &session_id,
        request.target_tier,
        request.mfa_proof.as_deref(),
    )?;
    Ok(Json(SessionResponse::from(session)))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/mfa",
    params(("session_id" = String, Path, description = "Session requesting MFA")),
    tag = "Sessions",
    responses((status = 200, body = MfaChallenge))
)]
pub async fn request_mfa(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MfaChallenge>, CoreError> {
    Ok(Json(state.sessions.request_mfa(&session_id)?))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/user/{user_id}",
    params(("user_id" = String, Path, description = "Owning user")),
    tag = "Sessions",
    responses((status = 200, body = [SessionSummary]))
)]
pub async fn list_user_sessions(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, CoreError> {
    Ok(Json(state.sessions.get_user_sessions(&user_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterSecret;
    use tempfile::TempDir;

    fn test_state() -> (TempDir, AppState) {
        let temp = TempDir::new().unwrap();
        let state = AppState::bootstrap(temp.path(), MasterSecret::new([29u8; 32])).unwrap();
        (temp, state)
    }

    fn create_request(user: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            user_id: user.to_string(),
            origin: "203.0.113.50".to_string(),
            client_signature: "ua-hash".to_string(),
            login_method: LoginMethod::Password,
            mfa_verified: false,
            device_id: None,
            sensitive_scope: false,
        }
    }

    #[tokio::test]
    async fn create_then_validate() {
        let (_temp, state) = test_state();
        let (status, Json(created)) =
            create_session(State(state.clone()), Json(create_request("user-1")))
                .await
                .expect("session creation succeeds");
        assert_eq!(status, StatusCode::CREATED);
        assert!(!created.access_token.is_empty());

        let Json(outcome) = validate_session(
            Path(created.session.id.clone()),
            State(state),
            Json(ValidateSessionRequest::default()),
        )
        .await
        .unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn terminate_then_validate_is_invalid() {
        let (_temp, state) = test_state();
        let (_, Json(created)) =
            create_session(State(state.clone()), Json(create_request("user-1")))
                .await
                .unwrap();

        let status = terminate_session(
            Path(created.session.id.clone()),
            Query(TerminateQuery { reason: None }),
            State(state.clone()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let Json(outcome) = validate_session(
            Path(created.session.id),
            State(state),
            Json(ValidateSessionRequest::default()),
        )
        .await
        .unwrap();
        assert!(!outcome.valid);
    }

    #[tokio::test]
    async fn list_user_sessions_excludes_tokens() {
        let (_temp, state) = test_state();
        create_session(State(state.clone()), Json(create_request("user-7")))
            .await
            .unwrap();

        let Json(sessions) = list_user_sessions(Path("user-7".to_string()), State(state))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        let json = serde_json::to_string(&sessions).unwrap();
        assert!(!json.contains("access_token"));
    }
}
