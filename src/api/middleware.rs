// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Rate-limit gate middleware.
//!
//! Runs before routing resolves, so decoy paths and scanner probes are
//! screened even when no route matches. The originating identity comes
//! from `X-Forwarded-For` (first hop) with `X-Real-IP` as fallback;
//! with neither header the request is gated under a shared identity
//! rather than passed through.

use axum::{
    extract::{Request, State},
    http::{header::USER_AGENT, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::abuse::{DenyReason, RateLimitRequest};
use crate::error::CoreError;
use crate::state::AppState;

/// Paths exempt from the gate: operational surfaces that must stay
/// reachable and are never decoys.
const EXEMPT_PREFIXES: &[&str] = &["/health", "/docs", "/api-doc"];

pub async fn rate_limit_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    if EXEMPT_PREFIXES.iter().any(|p| endpoint.starts_with(p)) {
        return next.run(request).await;
    }

    let identity = client_identity(&request);
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let decision = state.limiter.check(&RateLimitRequest {
        endpoint: &endpoint,
        identity: &identity,
        user_id: None,
        user_agent: user_agent.as_deref(),
    });

    if decision.allowed {
        return next.run(request).await;
    }

    match decision.reason {
        Some(DenyReason::Blocked | DenyReason::DecoyEndpoint | DenyReason::AttackSignature) => {
            CoreError::Blocked {
                retry_after_secs: decision.retry_after_secs.unwrap_or(3600),
            }
            .into_response()
        }
        Some(DenyReason::ChallengeRequired) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "Complete the verification challenge to continue",
                "error_code": "challenge_required",
            })),
        )
            .into_response(),
        _ => CoreError::RateLimited {
            retry_after_secs: decision.retry_after_secs.unwrap_or(60),
        }
        .into_response(),
    }
}

/// Originating network identity for rate limiting.
fn client_identity(request: &Request) -> String {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}
