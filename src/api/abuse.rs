// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    abuse::{ChallengeTicket, Decision, RateLimitRequest, ReputationRecord},
    error::CoreError,
    state::AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckRequest {
    pub endpoint: String,
    pub identity: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BlockRequest {
    pub identity: String,
    pub duration_secs: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChallengeRequest {
    pub identity: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyChallengeRequest {
    pub identity: String,
    pub answer: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyChallengeResponse {
    pub verified: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UnblockResponse {
    pub unblocked: bool,
}

#[utoipa::path(
    post,
    path = "/v1/abuse/check",
    request_body = CheckRequest,
    tag = "Abuse",
    responses((status = 200, body = Decision))
)]
pub async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Json<Decision> {
    Json(state.limiter.check(&RateLimitRequest {
        endpoint: &request.endpoint,
        identity: &request.identity,
        user_id: request.user_id.as_deref(),
        user_agent: request.user_agent.as_deref(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/abuse/block",
    request_body = BlockRequest,
    tag = "Abuse",
    responses((status = 204))
)]
pub async fn block_identity(
    State(state): State<AppState>,
    Json(request): Json<BlockRequest>,
) -> Result<StatusCode, CoreError> {
    state.limiter.block_identity(
        &request.identity,
        Duration::seconds(request.duration_secs.max(0)),
        &request.reason,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/v1/abuse/block/{identity}",
    params(("identity" = String, Path, description = "Identity to unblock")),
    tag = "Abuse",
    responses((status = 200, body = UnblockResponse))
)]
pub async fn unblock_identity(
    Path(identity): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<UnblockResponse>, CoreError> {
    let unblocked = state.limiter.unblock_identity(&identity)?;
    Ok(Json(UnblockResponse { unblocked }))
}

#[utoipa::path(
    post,
    path = "/v1/abuse/challenge",
    request_body = ChallengeRequest,
    tag = "Abuse",
    responses((status = 200, body = ChallengeTicket))
)]
pub async fn require_challenge(
    State(state): State<AppState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeTicket>, CoreError> {
    Ok(Json(state.limiter.require_challenge(&request.identity)?))
}

#[utoipa::path(
    post,
    path = "/v1/abuse/challenge/verify",
    request_body = VerifyChallengeRequest,
    tag = "Abuse",
    responses((status = 200, body = VerifyChallengeResponse))
)]
pub async fn verify_challenge(
    State(state): State<AppState>,
    Json(request): Json<VerifyChallengeRequest>,
) -> Result<Json<VerifyChallengeResponse>, CoreError> {
    let verified = state
        .limiter
        .verify_challenge(&request.identity, &request.answer)?;
    Ok(Json(VerifyChallengeResponse { verified }))
}

#[utoipa::path(
    get,
    path = "/v1/abuse/reputation/{identity}",
    params(("identity" = String, Path, description = "Identity to inspect")),
    tag = "Abuse",
    responses((status = 200, body = Option<ReputationRecord>))
)]
pub async fn get_reputation(
    Path(identity): Path<String>,
    State(state): State<AppState>,
) -> Json<Option<ReputationRecord>> {
    Json(state.limiter.reputation_of(&identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterSecret;
    use tempfile::TempDir;

    fn test_state() -> (TempDir, AppState) {
        let temp = TempDir::new().unwrap();
        let state = AppState::bootstrap(temp.path(), MasterSecret::new([41u8; 32])).unwrap();
        (temp, state)
    }

    #[tokio::test]
    async fn block_then_check_denies() {
        let (_temp, state) = test_state();
        block_identity(
            State(state.clone()),
            Json(BlockRequest {
                identity: "203.0.113.80".to_string(),
                duration_secs: 3600,
                reason: "manual review".to_string(),
            }),
        )
        .await
        .unwrap();

        let Json(decision) = check(
            State(state.clone()),
            Json(CheckRequest {
                endpoint: "/v1/fields/encrypt".to_string(),
                identity: "203.0.113.80".to_string(),
                user_id: None,
                user_agent: None,
            }),
        )
        .await;
        assert!(!decision.allowed);

        let Json(response) =
            unblock_identity(Path("203.0.113.80".to_string()), State(state)).await.unwrap();
        assert!(response.unblocked);
    }

    #[tokio::test]
    async fn challenge_flow_via_handlers() {
        let (_temp, state) = test_state();
        let Json(ticket) = require_challenge(
            State(state.clone()),
            Json(ChallengeRequest {
                identity: "203.0.113.81".to_string(),
            }),
        )
        .await
        .unwrap();

        let Json(result) = verify_challenge(
            State(state),
            Json(VerifyChallengeRequest {
                identity: "203.0.113.81".to_string(),
                answer: ticket.answer,
            }),
        )
        .await
        .unwrap();
        assert!(result.verified);
    }
}
