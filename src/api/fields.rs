// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    encryption::EncryptedValue,
    error::CoreError,
    keys::RotationEvent,
    state::AppState,
};

/// Ceiling on fields per batch object; larger payloads belong in chunked
/// ingestion, not one request.
const MAX_OBJECT_FIELDS: usize = 128;

#[derive(Debug, Deserialize, ToSchema)]
pub struct EncryptFieldRequest {
    pub field: String,
    pub value: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DecryptFieldRequest {
    pub field: String,
    pub value: EncryptedValue,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecryptFieldResponse {
    pub value: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ObjectRequest {
    /// Record object; configured string fields are transformed, everything
    /// else passes through.
    #[schema(value_type = Object)]
    pub object: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ObjectResponse {
    #[schema(value_type = Object)]
    pub object: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchFieldRequest {
    pub field: String,
    pub term: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SearchFieldResponse {
    /// References of encrypted fields whose plaintext contained the term.
    pub references: Vec<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RotateKeysRequest {
    /// Rotate every key family regardless of age.
    #[serde(default)]
    pub force: bool,
}

#[utoipa::path(
    post,
    path = "/v1/fields/encrypt",
    request_body = EncryptFieldRequest,
    tag = "Fields",
    responses((status = 200, body = EncryptedValue))
)]
pub async fn encrypt_field(
    State(state): State<AppState>,
    Json(request): Json<EncryptFieldRequest>,
) -> Result<Json<EncryptedValue>, CoreError> {
    let encrypted =
        state
            .fields
            .encrypt_field(&request.field, &request.value, request.user_id.as_deref())?;
    Ok(Json(encrypted))
}

#[utoipa::path(
    post,
    path = "/v1/fields/decrypt",
    request_body = DecryptFieldRequest,
    tag = "Fields",
    responses(
        (status = 200, body = DecryptFieldResponse),
        (status = 500, description = "Integrity or key mismatch")
    )
)]
pub async fn decrypt_field(
    State(state): State<AppState>,
    Json(request): Json<DecryptFieldRequest>,
) -> Result<Json<DecryptFieldResponse>, CoreError> {
    let value =
        state
            .fields
            .decrypt_field(&request.field, &request.value, request.user_id.as_deref())?;
    Ok(Json(DecryptFieldResponse { value }))
}

#[utoipa::path(
    post,
    path = "/v1/fields/encrypt-object",
    request_body = ObjectRequest,
    tag = "Fields",
    responses((status = 200, body = ObjectResponse))
)]
pub async fn encrypt_object(
    State(state): State<AppState>,
    Json(request): Json<ObjectRequest>,
) -> Result<Json<ObjectResponse>, CoreError> {
    if request.object.len() > MAX_OBJECT_FIELDS {
        return Err(CoreError::QuotaExceeded(format!(
            "object exceeds {MAX_OBJECT_FIELDS} fields"
        )));
    }
    let object = state
        .fields
        .encrypt_object(&request.object, request.user_id.as_deref())?;
    Ok(Json(ObjectResponse { object }))
}

#[utoipa::path(
    post,
    path = "/v1/fields/decrypt-object",
    request_body = ObjectRequest,
    tag = "Fields",
    responses((status = 200, body = ObjectResponse))
)]
pub async fn decrypt_object(
    State(state): State<AppState>,
    Json(request): Json<ObjectRequest>,
) -> Result<Json<ObjectResponse>, CoreError> {
    if request.object.len() > MAX_OBJECT_FIELDS {
        return Err(CoreError::QuotaExceeded(format!(
            "object exceeds {MAX_OBJECT_FIELDS} fields"
        )));
    }
    let object = state
        .fields
        .decrypt_object(&request.object, request.user_id.as_deref())?;
    Ok(Json(ObjectResponse { object }))
}

#[utoipa::path(
    post,
    path = "/v1/fields/search",
    request_body = SearchFieldRequest,
    tag = "Fields",
    responses(
        (status = 200, body = SearchFieldResponse),
        (status = 400, description = "Field is not configured for search")
    )
)]
pub async fn search_field(
    State(state): State<AppState>,
    Json(request): Json<SearchFieldRequest>,
) -> Result<Json<SearchFieldResponse>, CoreError> {
    let references =
        state
            .fields
            .search_field(&request.field, &request.term, request.user_id.as_deref())?;
    Ok(Json(SearchFieldResponse { references }))
}

#[utoipa::path(
    post,
    path = "/v1/fields/rotate-keys",
    request_body = RotateKeysRequest,
    tag = "Fields",
    responses((status = 200, body = [RotationEvent]))
)]
pub async fn rotate_keys(
    State(state): State<AppState>,
    Json(request): Json<RotateKeysRequest>,
) -> Result<Json<Vec<RotationEvent>>, CoreError> {
    Ok(Json(state.fields.rotate_keys(request.force)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterSecret;
    use tempfile::TempDir;

    fn test_state() -> (TempDir, AppState) {
        let temp = TempDir::new().unwrap();
        let state = AppState::bootstrap(temp.path(), MasterSecret::new([31u8; 32])).unwrap();
        (temp, state)
    }

    #[tokio::test]
    async fn encrypt_decrypt_via_handlers() {
        let (_temp, state) = test_state();
        let Json(encrypted) = encrypt_field(
            State(state.clone()),
            Json(EncryptFieldRequest {
                field: "diagnosis".to_string(),
                value: "panic disorder".to_string(),
                user_id: Some("user-1".to_string()),
            }),
        )
        .await
        .unwrap();

        let Json(decrypted) = decrypt_field(
            State(state),
            Json(DecryptFieldRequest {
                field: "diagnosis".to_string(),
                value: encrypted,
                user_id: Some("user-1".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(decrypted.value, "panic disorder");
    }

    #[tokio::test]
    async fn oversized_object_is_quota_rejected() {
        let (_temp, state) = test_state();
        let mut object = serde_json::Map::new();
        for i in 0..(MAX_OBJECT_FIELDS + 1) {
            object.insert(format!("field_{i}"), serde_json::json!("v"));
        }

        let result = encrypt_object(
            State(state),
            Json(ObjectRequest {
                object,
                user_id: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(CoreError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn search_finds_indexed_entries() {
        let (_temp, state) = test_state();
        encrypt_field(
            State(state.clone()),
            Json(EncryptFieldRequest {
                field: "journal_entry".to_string(),
                value: "anxiety journal".to_string(),
                user_id: None,
            }),
        )
        .await
        .unwrap();

        let Json(hits) = search_field(
            State(state.clone()),
            Json(SearchFieldRequest {
                field: "journal_entry".to_string(),
                term: "anxiety".to_string(),
                user_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(hits.references.len(), 1);

        let Json(misses) = search_field(
            State(state),
            Json(SearchFieldRequest {
                field: "journal_entry".to_string(),
                term: "joyful".to_string(),
                user_id: None,
            }),
        )
        .await
        .unwrap();
        assert!(misses.references.is_empty());
    }
}
