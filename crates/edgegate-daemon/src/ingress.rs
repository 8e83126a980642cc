//! The CI ingress: HMAC-authenticated run triggering, plus the public
//! signing-key endpoint verifiers use.
//!
//! Request handling order mirrors the security checks' cost and
//! sensitivity: header shape first, then workspace resolution, then the
//! timestamp window, then the signature (constant time), and only then
//! the nonce spend - so a replayed request still had a valid signature,
//! and `REPLAY` is meaningful.
//!
//! CI callers receive `202 Accepted` with the run id on success; pass or
//! fail is polled from the run record, never returned inline.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use edgegate_core::audit::AuditEvent;
use edgegate_core::ciauth::{
    self, CiAuthError, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER, WORKSPACE_HEADER,
};
use edgegate_core::envelope::MasterKeyRing;
use edgegate_core::ids::{ArtifactId, WorkspaceId};
use edgegate_core::signing::SigningKeyManager;

use crate::db::{DbError, RunTrigger, Store};

/// Request body limit. CI trigger bodies are a few hundred bytes.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Shared state for the ingress router.
pub struct IngressState {
    /// Run and configuration storage.
    pub db: Store,
    /// Master keys for opening the per-workspace CI secret.
    pub masters: Arc<MasterKeyRing>,
    /// Signing keys served to verifiers.
    pub signer: Arc<SigningKeyManager>,
}

/// Builds the ingress router.
pub fn router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route("/v1/ci/github/run", post(ci_run))
        .route("/v1/ci/status", get(ci_status))
        .route("/v1/ci/runs/:run_id", get(ci_run_status))
        .route("/v1/signing-keys/:key_id", get(signing_key))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Ingress failures, each with its HTTP mapping.
#[derive(Debug, thiserror::Error)]
enum IngressError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("{0}")]
    Auth(CiAuthError),

    #[error("request timestamp outside the accepted window")]
    StaleTimestamp,

    #[error("invalid request signature")]
    InvalidSignature,

    #[error("nonce has already been used")]
    Replay,

    #[error("unknown workspace")]
    UnknownWorkspace,

    #[error("referenced entity not found")]
    NotFound,

    #[error("invalid request body: {0}")]
    BadBody(String),

    #[error("internal error")]
    Internal,
}

impl IngressError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::MissingHeader(_) | Self::BadBody(_) | Self::Auth(_) => StatusCode::BAD_REQUEST,
            Self::StaleTimestamp | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::Replay => StatusCode::CONFLICT,
            Self::UnknownWorkspace | Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader(_) | Self::Auth(_) | Self::BadBody(_) => "BAD_REQUEST",
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::Replay => "REPLAY",
            Self::UnknownWorkspace => "UNKNOWN_WORKSPACE",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code(), "detail": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<CiAuthError> for IngressError {
    fn from(e: CiAuthError) -> Self {
        match e {
            CiAuthError::StaleTimestamp => Self::StaleTimestamp,
            CiAuthError::InvalidSignature => Self::InvalidSignature,
            other => Self::Auth(other),
        }
    }
}

/// Body of `POST /v1/ci/github/run`.
#[derive(Debug, Deserialize)]
struct CiRunRequest {
    /// Pipeline name within the workspace.
    pipeline: String,
    /// The model artifact to test.
    model_artifact_id: ArtifactId,
}

async fn ci_run(
    State(state): State<Arc<IngressState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IngressError> {
    let workspace_id = authenticate(&state, &headers, &body)?;

    let request: CiRunRequest =
        serde_json::from_slice(&body).map_err(|e| IngressError::BadBody(e.to_string()))?;

    let pipeline = state
        .db
        .get_pipeline_by_name(workspace_id, &request.pipeline)
        .map_err(|e| match e {
            DbError::NotFound => IngressError::NotFound,
            _ => IngressError::Internal,
        })?;

    let run = state
        .db
        .create_run(
            workspace_id,
            pipeline.id,
            request.model_artifact_id,
            RunTrigger::Ci,
        )
        .map_err(|_| IngressError::Internal)?;

    info!(
        workspace_id = %workspace_id,
        run_id = %run.id,
        pipeline = %request.pipeline,
        "CI run accepted"
    );
    let _ = state.db.append_audit(&AuditEvent::ci_request(
        workspace_id,
        true,
        &format!("run {} enqueued", run.id),
    ));

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run.id, "state": "queued" })),
    )
        .into_response())
}

async fn ci_status(
    State(state): State<Arc<IngressState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IngressError> {
    let workspace_id = authenticate(&state, &headers, &body)?;
    Ok((
        StatusCode::OK,
        Json(json!({ "ok": true, "workspace_id": workspace_id })),
    )
        .into_response())
}

/// Run status for CI pollers: enough to derive an exit code, nothing
/// more. Gate detail and metrics stay on the workspace-scoped surface.
async fn ci_run_status(
    State(state): State<Arc<IngressState>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IngressError> {
    let workspace_id = authenticate(&state, &headers, &body)?;
    let run_id: edgegate_core::ids::RunId =
        run_id.parse().map_err(|_| IngressError::NotFound)?;

    let run = state
        .db
        .get_run(workspace_id, run_id)
        .map_err(|_| IngressError::NotFound)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "run_id": run.id,
            "state": run.state,
            "error_code": run.error_code,
            "error_detail": run.error_detail,
            "bundle_artifact_id": run.bundle_artifact_id,
        })),
    )
        .into_response())
}

async fn signing_key(
    State(state): State<Arc<IngressState>>,
    Path(key_id): Path<String>,
) -> Result<Response, IngressError> {
    let record = state
        .signer
        .record(&key_id)
        .map_err(|_| IngressError::NotFound)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "key_id": record.key_id,
            "algo": "ed25519",
            "public_key": record.public_key_hex,
            "created_at": record.created_at,
            "revoked_at": record.revoked_at,
        })),
    )
        .into_response())
}

/// Full CI authentication: headers, workspace, window, signature, nonce.
fn authenticate(
    state: &IngressState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WorkspaceId, IngressError> {
    let header = |name: &'static str| -> Result<&str, IngressError> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or(IngressError::MissingHeader(name))
    };

    let workspace_raw = header(WORKSPACE_HEADER)?;
    let timestamp = header(TIMESTAMP_HEADER)?;
    let nonce = header(NONCE_HEADER)?;
    let signature = header(SIGNATURE_HEADER)?;

    let workspace_id: WorkspaceId = workspace_raw
        .parse()
        .map_err(|_| IngressError::UnknownWorkspace)?;
    state
        .db
        .get_workspace(workspace_id)
        .map_err(|_| IngressError::UnknownWorkspace)?;

    // The stored secret is envelope-sealed; it exists in plaintext only
    // for the duration of this verification.
    let sealed = state
        .db
        .get_ci_secret(workspace_id)
        .map_err(|_| IngressError::InvalidSignature)?;
    let secret = state
        .masters
        .open(&sealed)
        .map_err(|_| IngressError::Internal)?;

    let parsed_ts =
        ciauth::verify_request(&secret, timestamp, nonce, signature, body, Utc::now()).map_err(
            |e| {
                let _ = state.db.append_audit(&AuditEvent::ci_request(
                    workspace_id,
                    false,
                    &e.to_string(),
                ));
                IngressError::from(e)
            },
        )?;

    state
        .db
        .spend_nonce(workspace_id, nonce, ciauth::nonce_expiry(parsed_ts))
        .map_err(|e| match e {
            DbError::Replay => {
                let _ = state.db.append_audit(&AuditEvent::ci_request(
                    workspace_id,
                    false,
                    "nonce replay",
                ));
                IngressError::Replay
            }
            _ => IngressError::Internal,
        })?;

    Ok(workspace_id)
}
