// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    audit::{AuditDraft, AuditEntry, AuditKind, AuditQuery, ExportFormat, Outcome, Severity},
    error::CoreError,
    state::AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogEventRequest {
    pub kind: AuditKind,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub severity: Option<Severity>,
    /// Free-form details; must never contain regulated plaintext.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ExportQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub format: ExportFormat,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub entry_id: String,
    pub verified: bool,
}

#[utoipa::path(
    post,
    path = "/v1/audit/log",
    request_body = LogEventRequest,
    tag = "Audit",
    responses((status = 202, description = "Event accepted"))
)]
pub async fn log_event(
    State(state): State<AppState>,
    Json(request): Json<LogEventRequest>,
) -> StatusCode {
    let mut draft = AuditDraft::new(request.kind);
    if let Some(user_id) = request.user_id {
        draft = draft.with_user(user_id);
    }
    if let Some(session_id) = request.session_id {
        draft = draft.with_session(session_id);
    }
    if let (Some(resource_type), Some(resource_id)) = (request.resource_type, request.resource_id)
    {
        draft = draft.with_resource(resource_type, resource_id);
    }
    if let Some(action) = request.action {
        draft = draft.with_action(action);
    }
    if let Some(outcome) = request.outcome {
        draft = draft.with_outcome(outcome);
    }
    if let Some(severity) = request.severity {
        draft = draft.with_severity(severity);
    }
    if let Some(details) = request.details {
        for (key, value) in details {
            draft = draft.with_detail(key, value);
        }
    }

    // log() is infallible by contract; failures land on the diagnostic
    // channel rather than on the caller.
    state.audit.log(draft);
    StatusCode::ACCEPTED
}

#[utoipa::path(
    get,
    path = "/v1/audit",
    params(AuditQuery),
    tag = "Audit",
    responses((status = 200, body = [AuditEntry]))
)]
pub async fn query_entries(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, CoreError> {
    Ok(Json(state.audit.query(&query)?))
}

#[utoipa::path(
    get,
    path = "/v1/audit/export",
    params(ExportQuery),
    tag = "Audit",
    responses((status = 200, description = "Serialized compliance report"))
)]
pub async fn export_entries(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let report = state.audit.export(query.start, query.end, query.format)?;
    let content_type = match query.format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], report))
}

#[utoipa::path(
    get,
    path = "/v1/audit/{entry_id}/verify",
    params(("entry_id" = String, Path, description = "Entry to verify")),
    tag = "Audit",
    responses(
        (status = 200, body = VerifyResponse),
        (status = 500, description = "Entry not found")
    )
)]
pub async fn verify_entry(
    Path(entry_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<VerifyResponse>, CoreError> {
    let Some(entry) = state.audit.get(&entry_id)? else {
        return Err(CoreError::Internal(format!("audit entry {entry_id} not found")));
    };

    let verified = state.audit.verify_integrity(&entry);
    if !verified {
        state.audit.log(
            AuditDraft::new(AuditKind::IntegrityCheckFailed)
                .with_resource("audit_entry", entry_id.clone())
                .with_severity(Severity::Critical)
                .with_outcome(Outcome::Failure),
        );
    }
    Ok(Json(VerifyResponse { entry_id, verified }))
}
