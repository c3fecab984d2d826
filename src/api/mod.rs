// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::AppState;

pub mod abuse;
pub mod audit;
pub mod fields;
pub mod health;
pub mod middleware;
pub mod sessions;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        // Sessions
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/validate-token", post(sessions::validate_token))
        .route(
            "/sessions/{session_id}/validate",
            post(sessions::validate_session),
        )
        .route("/sessions/{session_id}/renew", post(sessions::renew_session))
        .route(
            "/sessions/{session_id}/elevate",
            post(sessions::elevate_session),
        )
        .route("/sessions/{session_id}/mfa", post(sessions::request_mfa))
        .route("/sessions/{session_id}", delete(sessions::terminate_session))
        .route("/sessions/user/{user_id}", get(sessions::list_user_sessions))
        // Field encryption
        .route("/fields/encrypt", post(fields::encrypt_field))
        .route("/fields/decrypt", post(fields::decrypt_field))
        .route("/fields/encrypt-object", post(fields::encrypt_object))
        .route("/fields/decrypt-object", post(fields::decrypt_object))
        .route("/fields/search", post(fields::search_field))
        .route("/fields/rotate-keys", post(fields::rotate_keys))
        // Audit
        .route("/audit/log", post(audit::log_event))
        .route("/audit", get(audit::query_entries))
        .route("/audit/export", get(audit::export_entries))
        .route("/audit/{entry_id}/verify", get(audit::verify_entry))
        // Abuse
        .route("/abuse/check", post(abuse::check))
        .route("/abuse/block", post(abuse::block_identity))
        .route("/abuse/block/{identity}", delete(abuse::unblock_identity))
        .route("/abuse/challenge", post(abuse::require_challenge))
        .route("/abuse/challenge/verify", post(abuse::verify_challenge))
        .route("/abuse/reputation/{identity}", get(abuse::get_reputation));

    let api = Router::new()
        .nest("/v1", v1_routes)
        .route("/health", get(health::health))
        .with_state(state.clone());

    Router::new()
        .merge(api)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // The gate wraps routing itself, so decoy paths are screened even
        // though no route matches them.
        .layer(from_fn_with_state(state, middleware::rate_limit_gate))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CorsLayer::permissive()),
        )
}

#[derive(OpenApi)]
#[openapi(
    paths(
        sessions::create_session,
        sessions::validate_session,
        sessions::validate_token,
        sessions::renew_session,
        sessions::terminate_session,
        sessions::elevate_session,
        sessions::request_mfa,
        sessions::list_user_sessions,
        fields::encrypt_field,
        fields::decrypt_field,
        fields::encrypt_object,
        fields::decrypt_object,
        fields::search_field,
        fields::rotate_keys,
        audit::log_event,
        audit::query_entries,
        audit::export_entries,
        audit::verify_entry,
        abuse::check,
        abuse::block_identity,
        abuse::unblock_identity,
        abuse::require_challenge,
        abuse::verify_challenge,
        abuse::get_reputation,
        health::health
    ),
    components(
        schemas(
            sessions::CreateSessionRequest,
            sessions::SessionResponse,
            sessions::ValidateSessionRequest,
            sessions::ValidateTokenRequest,
            sessions::ElevateSessionRequest,
            fields::EncryptFieldRequest,
            fields::DecryptFieldRequest,
            fields::DecryptFieldResponse,
            fields::ObjectRequest,
            fields::ObjectResponse,
            fields::SearchFieldRequest,
            fields::SearchFieldResponse,
            fields::RotateKeysRequest,
            audit::LogEventRequest,
            audit::VerifyResponse,
            abuse::CheckRequest,
            abuse::BlockRequest,
            abuse::ChallengeRequest,
            abuse::VerifyChallengeRequest,
            abuse::VerifyChallengeResponse,
            abuse::UnblockResponse,
            health::HealthResponse,
            crate::session::SessionSummary,
            crate::session::ValidationOutcome,
            crate::session::MfaChallenge,
            crate::session::SessionFlags,
            crate::session::LoginMethod,
            crate::session::SecurityTier,
            crate::session::TerminationReason,
            crate::session::RequiredAction,
            crate::encryption::EncryptedValue,
            crate::encryption::EncryptedField,
            crate::audit::AuditEntry,
            crate::audit::AuditKind,
            crate::audit::Severity,
            crate::audit::Outcome,
            crate::audit::ExportFormat,
            crate::abuse::Decision,
            crate::abuse::DenyReason,
            crate::abuse::ChallengeTicket,
            crate::abuse::ReputationRecord,
            crate::keys::RotationEvent,
            crate::keys::Sensitivity,
            crate::keys::KeyPurpose,
            crate::crypto::Algorithm
        )
    ),
    tags(
        (name = "Sessions", description = "Session lifecycle"),
        (name = "Fields", description = "Field-level encryption"),
        (name = "Audit", description = "Tamper-evident audit log"),
        (name = "Abuse", description = "Rate limiting and abuse detection"),
        (name = "Health", description = "Service health")
    )
)]
struct ApiDoc;
