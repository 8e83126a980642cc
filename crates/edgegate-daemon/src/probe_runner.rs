//! Drives a ProbeSuite run for a workspace and installs the result.
//!
//! Probe runs reuse the worker dependency bundle: the sealed token is
//! opened the same way, the same backend factory builds the client, and
//! the produced documents land in the artifact store with the workspace's
//! capabilities record updated atomically.

use thiserror::Error;
use tracing::info;

use edgegate_core::audit::{Actor, AuditEvent};
use edgegate_core::cas::{ArtifactKind, ArtifactStore, CasError};
use edgegate_core::envelope::{BackendToken, EnvelopeError};
use edgegate_core::ids::{ArtifactId, WorkspaceId};
use edgegate_core::probe::{builtin_fixtures, ProbeConfig, ProbeSuite};

use crate::db::{CapabilitiesRow, DbError};
use crate::runs::worker::WorkerDeps;

/// Errors from probe execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProbeRunError {
    /// The workspace has no active integration.
    #[error("workspace has no active backend integration")]
    NoIntegration,

    /// The sealed token could not be opened.
    #[error("integration token could not be decrypted: {0}")]
    TokenUnsealable(#[from] EnvelopeError),

    /// Persistence failure.
    #[error(transparent)]
    Db(DbError),

    /// Artifact storage failure.
    #[error(transparent)]
    Cas(#[from] CasError),
}

impl From<DbError> for ProbeRunError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => Self::NoIntegration,
            other => Self::Db(other),
        }
    }
}

/// Runs the probe suite and installs the new capabilities record.
///
/// Payloads from the previous probe run (if any) are fed back in so that
/// metric paths observed consistently across runs become stable.
///
/// # Errors
///
/// Returns [`ProbeRunError`] when the workspace cannot be probed at all;
/// individual capability failures are recorded, not raised.
pub fn run_probe(
    deps: &WorkerDeps,
    workspace_id: WorkspaceId,
    config: ProbeConfig,
) -> Result<CapabilitiesRow, ProbeRunError> {
    let integration = deps.db.get_active_integration(workspace_id)?;
    let token_bytes = deps.masters.open(&integration.sealed_token)?;
    let token = BackendToken::from_bytes(&token_bytes)
        .map_err(|_| ProbeRunError::TokenUnsealable(EnvelopeError::DecryptFailed))?;
    let backend = (deps.backend_factory)(&token);

    let previous = previous_payloads(deps, workspace_id);

    let suite = ProbeSuite::new(deps.artifacts.as_ref(), workspace_id).with_config(config);
    let outcome = suite.run(backend.as_ref(), &builtin_fixtures(), &previous);

    let capabilities_bytes =
        serde_json::to_vec(&outcome.capabilities).unwrap_or_default();
    let mapping_bytes = serde_json::to_vec(&outcome.metric_mapping).unwrap_or_default();

    let capabilities_blob = deps.artifacts.put(
        workspace_id,
        ArtifactKind::Capabilities,
        "workspace_capabilities.json",
        &capabilities_bytes,
    )?;
    let mapping_blob = deps.artifacts.put(
        workspace_id,
        ArtifactKind::MetricMapping,
        "metric_mapping.json",
        &mapping_bytes,
    )?;

    let row = CapabilitiesRow {
        workspace_id,
        capabilities_blob_id: capabilities_blob.id,
        metric_mapping_blob_id: mapping_blob.id,
        probed_at: outcome.capabilities.probed_at,
        source_probe_run_id: outcome.capabilities.probe_run_id.to_string(),
    };
    deps.db.set_capabilities(&row)?;
    deps.db
        .append_audit(&AuditEvent::new(
            workspace_id,
            Actor::System,
            "capabilities.probed",
            serde_json::json!({
                "probe_run_id": &row.source_probe_run_id,
                "capabilities_blob_id": row.capabilities_blob_id,
                "metric_mapping_blob_id": row.metric_mapping_blob_id,
            }),
        ))
        .map_err(ProbeRunError::Db)?;

    info!(workspace_id = %workspace_id, probe_run_id = %row.source_probe_run_id, "capabilities updated");
    Ok(row)
}

/// Loads the profile payloads the current mapping was derived from, so a
/// re-probe can corroborate paths across runs. Missing blobs are skipped.
fn previous_payloads(
    deps: &WorkerDeps,
    workspace_id: WorkspaceId,
) -> Vec<(ArtifactId, serde_json::Value)> {
    let Ok(record) = deps.db.get_capabilities(workspace_id) else {
        return Vec::new();
    };
    let Ok(mapping_bytes) = deps
        .artifacts
        .get(workspace_id, record.metric_mapping_blob_id)
    else {
        return Vec::new();
    };
    let Ok(mapping) =
        serde_json::from_slice::<edgegate_core::metrics::MetricMapping>(&mapping_bytes)
    else {
        return Vec::new();
    };

    mapping
        .derived_from_artifacts
        .iter()
        .filter_map(|id| {
            let bytes = deps.artifacts.get(workspace_id, *id).ok()?;
            let parsed = serde_json::from_slice(&bytes).ok()?;
            Some((*id, parsed))
        })
        .collect()
}
