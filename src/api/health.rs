// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{error::CoreError, state::AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Total durable audit entries, as a cheap liveness probe of the store.
    pub audit_entries: u64,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, CoreError> {
    state.storage.health_check()?;
    let audit_entries = state.audit.stored_len()?;
    Ok(Json(HealthResponse {
        status: "ok",
        audit_entries,
    }))
}
