//! Axum request handlers for all service endpoints.
//!
//! Facade calls block (secret fetches, AEAD work), so every handler runs
//! them on Tokio's blocking pool. The execution context is the named
//! context from the configured header, or a fresh one that lives only for
//! the request.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{
    protocol::{
        BatchRequest, BatchResponse, DecryptFieldRequest, DecryptFieldResponse,
        EncryptFieldRequest, EncryptFieldResponse, ErrorResponse, HealthResponse, RecordRequest,
        RecordResponse, RotateRequest, RotateResponse, SessionInfoResponse,
    },
    ServiceError,
};
use serde_json::{Map, Value};
use tracing::warn;

use super::{error::ApiError, state::AppState};
use crate::facade::EncryptionFacade;
use crate::pii::{decrypt_record as decrypt_pii, encrypt_record as encrypt_pii};
use crate::session::SessionContext;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `POST /fields/encrypt` — encrypt one field value.
pub async fn encrypt_field(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EncryptFieldRequest>,
) -> ApiResult<EncryptFieldResponse> {
    let resp = with_context(&state, &headers, move |facade, ctx| {
        let token = facade.encrypt_field(ctx, &req.tenant_id, &req.plaintext)?;
        Ok(EncryptFieldResponse {
            token: token.to_token_string(),
            derivation_version: token.derivation_version,
        })
    })
    .await?;
    Ok(Json(resp))
}

/// `POST /fields/decrypt` — decrypt one token, under `derivation_version`
/// when given and the current version otherwise.
///
/// After a rotation, tokens sealed earlier only open when the client sends
/// the `derivation_version` it got back from `/fields/encrypt`.
pub async fn decrypt_field(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DecryptFieldRequest>,
) -> ApiResult<DecryptFieldResponse> {
    let resp = with_context(&state, &headers, move |facade, ctx| {
        let plaintext = match req.derivation_version {
            Some(version) => {
                facade.decrypt_field_versioned(ctx, &req.tenant_id, &req.token, version)?
            }
            None => facade.decrypt_field(ctx, &req.tenant_id, &req.token)?,
        };
        Ok(DecryptFieldResponse { plaintext })
    })
    .await?;
    Ok(Json(resp))
}

/// `POST /fields/encrypt-batch` — encrypt a map of named string values.
pub async fn encrypt_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> ApiResult<BatchResponse> {
    let fields = string_fields(req.fields)?;
    let resp = with_context(&state, &headers, move |facade, ctx| {
        let sealed = facade.encrypt_fields(ctx, &req.tenant_id, fields)?;
        let derivation_version = sealed
            .first()
            .map_or_else(|| facade.current_version(), |(_, t)| t.derivation_version);
        let fields = sealed
            .into_iter()
            .map(|(name, token)| (name, Value::String(token.to_token_string())))
            .collect();
        Ok(BatchResponse {
            fields,
            derivation_version,
        })
    })
    .await?;
    Ok(Json(resp))
}

/// `POST /fields/decrypt-batch` — decrypt a map of named tokens. Like
/// `/fields/decrypt`, it needs `derivation_version` for tokens sealed before
/// a rotation.
pub async fn decrypt_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> ApiResult<BatchResponse> {
    let fields = string_fields(req.fields)?;
    let resp = with_context(&state, &headers, move |facade, ctx| {
        let version = req
            .derivation_version
            .unwrap_or_else(|| facade.current_version());
        let opened = facade.decrypt_fields_versioned(ctx, &req.tenant_id, fields, version)?;
        let fields = opened
            .into_iter()
            .map(|(name, plaintext)| (name, Value::String(plaintext)))
            .collect();
        Ok(BatchResponse {
            fields,
            derivation_version: version,
        })
    })
    .await?;
    Ok(Json(resp))
}

/// `POST /records/encrypt` — encrypt the configured PII fields of a record.
pub async fn encrypt_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordRequest>,
) -> ApiResult<RecordResponse> {
    let paths = state.pii_fields.clone();
    let resp = with_context(&state, &headers, move |facade, ctx| {
        let mut record = req.record;
        let fields_transformed = encrypt_pii(facade, ctx, &req.tenant_id, &mut record, &paths)?;
        Ok(RecordResponse {
            record,
            fields_transformed,
            derivation_version: facade.current_version(),
        })
    })
    .await?;
    Ok(Json(resp))
}

/// `POST /records/decrypt` — decrypt the configured PII fields of a record.
pub async fn decrypt_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordRequest>,
) -> ApiResult<RecordResponse> {
    let paths = state.pii_fields.clone();
    let resp = with_context(&state, &headers, move |facade, ctx| {
        let version = req
            .derivation_version
            .unwrap_or_else(|| facade.current_version());
        let mut record = req.record;
        let fields_transformed =
            decrypt_pii(facade, ctx, &req.tenant_id, &mut record, &paths, Some(version))?;
        Ok(RecordResponse {
            record,
            fields_transformed,
            derivation_version: version,
        })
    })
    .await?;
    Ok(Json(resp))
}

/// `GET /sessions/:tenant_id` — the named context's session for a tenant.
///
/// Only named contexts hold sessions between requests; without the context
/// header, or for a context never used, this is `404`.
pub async fn session_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> ApiResult<SessionInfoResponse> {
    let not_found =
        || ApiError::from(ServiceError::NotFound(format!("no session for {tenant_id}")));
    let name = context_name(&headers, &state.context_header_name)?.ok_or_else(not_found)?;
    let ctx = state.contexts.get(&name).ok_or_else(not_found)?;
    let facade = state.facade.clone();
    let tenant = tenant_id.clone();
    let info = tokio::task::spawn_blocking(move || facade.session_info(&ctx.lock(), &tenant))
        .await
        .map_err(join_failed)?
        .ok_or_else(not_found)?;
    Ok(Json(SessionInfoResponse {
        tenant_id: info.tenant_id,
        state: info.state.as_str().to_owned(),
        created_at: info.created_at,
        expires_at: info.expires_at,
        operation_count: info.operation_count,
        operation_limit: info.operation_limit,
        derivation_version: info.derivation_version,
        key_id: info.key_id,
    }))
}

/// `POST /sessions/:tenant_id/invalidate` — expire a tenant's sessions in
/// every context.
pub async fn invalidate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    with_context(&state, &headers, move |facade, ctx| {
        facade.invalidate_session(ctx, &tenant_id)?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /keys/rotate` — seal new tokens under a newer derivation version.
pub async fn rotate(
    State(state): State<AppState>,
    Json(req): Json<RotateRequest>,
) -> ApiResult<RotateResponse> {
    let previous_version = state
        .facade
        .rotate_to(req.derivation_version)
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
    Ok(Json(RotateResponse {
        previous_version,
        derivation_version: req.derivation_version,
    }))
}

/// `DELETE /contexts/:context_id` — release a named context and its sessions.
pub async fn release_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.contexts.remove(&context_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::NotFound(format!("no context {context_id}")).into())
    }
}

/// `GET /health` — liveness and readiness check.
///
/// Returns `200 OK` when the root secret can be fetched right now.
/// Returns `503 Service Unavailable` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let deriver = state.facade.registry().deriver().clone();
    let secret_ready = match tokio::task::spawn_blocking(move || deriver.probe()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "health probe: root secret unavailable");
            false
        }
        Err(e) => {
            warn!(error = %e, "health probe task failed");
            false
        }
    };

    let (status_code, status_str) = if secret_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        secret_ready,
        derivation_version: state.facade.current_version(),
        open_contexts: state.contexts.len(),
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

/// Run `op` on the blocking pool against the request's execution context.
async fn with_context<T, F>(state: &AppState, headers: &HeaderMap, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&EncryptionFacade, &mut SessionContext) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let shared = match context_name(headers, &state.context_header_name)? {
        Some(name) => Some(state.contexts.get_or_open(&name, &state.facade)?),
        None => None,
    };
    let facade = state.facade.clone();

    tokio::task::spawn_blocking(move || match shared {
        Some(ctx) => op(&facade, &mut ctx.lock()),
        None => op(&facade, &mut facade.open_context()),
    })
    .await
    .map_err(join_failed)?
}

fn join_failed(e: tokio::task::JoinError) -> ApiError {
    warn!(error = %e, "blocking task failed");
    ServiceError::Internal("worker task failed".into()).into()
}

/// Value of the context header, if present.
fn context_name(headers: &HeaderMap, header_name: &str) -> Result<Option<String>, ApiError> {
    match headers.get(header_name) {
        Some(v) => match v.to_str() {
            Ok(s) => Ok(Some(s.to_owned())),
            Err(_) => Err(ServiceError::BadRequest(format!(
                "{header_name} header contains non-ASCII characters"
            ))
            .into()),
        },
        None => Ok(None),
    }
}

/// Batch values must all be strings.
fn string_fields(fields: Map<String, Value>) -> Result<Vec<(String, String)>, ApiError> {
    fields
        .into_iter()
        .map(|(name, value)| match value {
            Value::String(s) => Ok((name, s)),
            _ => Err(ApiError::from(ServiceError::BadRequest(format!(
                "field {name} must be a string"
            )))),
        })
        .collect()
}
