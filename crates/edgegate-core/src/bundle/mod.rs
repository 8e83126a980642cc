//! Signed evidence bundles.
//!
//! A bundle is a deterministic zip holding:
//!
//! - `summary.json` - the normative record of the run, in canonical JSON
//! - `summary.sig` - hex Ed25519 signature over the summary's exact bytes
//! - `artifacts.json` - `{path, sha256, bytes}` for every other entry in
//!   the zip, the summary included
//! - `report.html` - a human-readable view derived from the summary
//! - `raw/`, `mapping/`, `capabilities/` - the referenced blobs
//!
//! A verifier needs only `summary.json`, `summary.sig`, and the public key
//! for the `key_id` named in `summary.signing`; `artifacts.json` makes
//! every other file checkable by hash.

mod zipio;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical;
use crate::cas::sha256_hex;
use crate::gating::GatesEvaluation;
use crate::ids::{ArtifactId, PipelineId, RunId, WorkspaceId};
use crate::signing::{verify_detached, SigningError, SigningKeyManager};

pub use zipio::{read_zip, write_zip, ZipError};

/// Bundle format version stamped into every summary.
pub const BUNDLE_VERSION: &str = "1.0";

/// Entry names fixed by the format.
pub const SUMMARY_NAME: &str = "summary.json";
/// Detached signature entry name.
pub const SIGNATURE_NAME: &str = "summary.sig";
/// Per-entry hash manifest name.
pub const MANIFEST_NAME: &str = "artifacts.json";
/// Human-readable report name.
pub const REPORT_NAME: &str = "report.html";

/// Errors from bundle assembly or verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BundleError {
    /// Canonical encoding of the summary failed.
    #[error("bundle assembly failed: {0}")]
    Canonical(#[from] canonical::CanonicalError),

    /// Signing failed.
    #[error("bundle signing failed: {0}")]
    Signing(#[from] SigningError),

    /// The archive is not a valid bundle zip.
    #[error("bundle archive invalid: {0}")]
    Zip(#[from] ZipError),

    /// A required entry is missing from the archive.
    #[error("bundle missing entry: {name}")]
    MissingEntry {
        /// The absent entry.
        name: String,
    },

    /// An entry's recorded hash does not match its bytes.
    #[error("bundle entry {name} fails its recorded hash")]
    EntryHashMismatch {
        /// The mismatching entry.
        name: String,
    },

    /// The summary is not canonical JSON or fails to parse.
    #[error("bundle summary invalid: {message}")]
    SummaryInvalid {
        /// What was wrong.
        message: String,
    },

    /// The signature does not verify.
    #[error("bundle signature invalid")]
    SignatureInvalid,
}

/// The model input recorded in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInput {
    /// The stored model artifact.
    pub artifact_id: ArtifactId,
    /// Its content hash.
    pub sha256: String,
}

/// The promptpack input recorded in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPackInput {
    /// The pack's logical id.
    pub promptpack_id: String,
    /// The pinned version.
    pub version: String,
    /// Canonical content hash.
    pub sha256: String,
}

/// A device recorded in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInput {
    /// Hub device id.
    pub device_id: String,
    /// Display name.
    pub device_name: String,
}

/// The `inputs` block of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryInputs {
    /// The model under test.
    pub model: ModelInput,
    /// The prompt suite.
    pub promptpack: PromptPackInput,
    /// Devices in matrix order.
    pub devices: Vec<DeviceInput>,
}

/// One normalized metric row in the results block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetricRow {
    /// Device the metric was measured on.
    pub device: String,
    /// Normalized metric name.
    pub metric: String,
    /// Median over measurement repeats.
    pub median: f64,
    /// The raw repeats, in repeat order.
    pub repeats: Vec<f64>,
}

/// The `results` block of a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResults {
    /// Terminal status: `passed`, `failed`, or `error`.
    pub status: String,
    /// Normalized metric rows.
    pub normalized_metrics: Vec<NormalizedMetricRow>,
    /// The full gate evaluation.
    pub gates_evaluation: GatesEvaluation,
}

/// A hash reference to a file inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path inside the zip.
    pub path: String,
    /// Hex SHA-256 of the entry bytes.
    pub sha256: String,
}

/// The `signing` block of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningBlock {
    /// Signature algorithm; always `ed25519`.
    pub algo: String,
    /// The signing key's id, resolvable to a public key.
    pub public_key_id: String,
}

/// `summary.json`. Its canonical-JSON bytes are what `summary.sig` signs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSummary {
    /// Format version.
    pub bundle_version: String,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// The pipeline that ran.
    pub pipeline_id: PipelineId,
    /// The run this bundle records.
    pub run_id: RunId,
    /// Bundle creation time, RFC 3339.
    pub created_at: String,
    /// The run's inputs.
    pub inputs: SummaryInputs,
    /// Artifact id of the capabilities document used.
    pub capabilities_ref: Option<ArtifactId>,
    /// Artifact id of the metric mapping used.
    pub metric_mapping_ref: Option<ArtifactId>,
    /// The run's results.
    pub results: SummaryResults,
    /// Hash references to the bundled blobs (`raw/`, `mapping/`,
    /// `capabilities/` subtrees).
    pub artifacts: Vec<ArtifactRef>,
    /// Signing metadata.
    pub signing: SigningBlock,
}

/// One row of `artifacts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRow {
    /// Path inside the zip.
    pub path: String,
    /// Hex SHA-256 of the entry bytes.
    pub sha256: String,
    /// Entry size.
    pub bytes: u64,
}

/// Inputs to bundle assembly that are not already part of the summary.
pub struct BundleContents {
    /// Blobs for the `raw/` subtree: `(filename, bytes)`.
    pub raw: Vec<(String, Vec<u8>)>,
    /// The metric mapping document bytes, stored under `mapping/`.
    pub metric_mapping: Option<Vec<u8>>,
    /// The capabilities document bytes, stored under `capabilities/`.
    pub capabilities: Option<Vec<u8>>,
}

/// A built bundle: the archive plus the summary it contains.
pub struct BuiltBundle {
    /// The zip bytes.
    pub zip: Vec<u8>,
    /// The summary as signed.
    pub summary: BundleSummary,
    /// Hex SHA-256 of the zip bytes.
    pub zip_sha256: String,
}

/// Assembles and signs an evidence bundle.
///
/// The `summary` argument arrives without its `artifacts` and `signing`
/// blocks filled in; assembly computes blob hashes, stamps the signing key
/// id, canonicalizes, and signs.
///
/// # Errors
///
/// Returns [`BundleError`] when encoding or signing fails.
pub fn build_bundle(
    mut summary: BundleSummary,
    contents: &BundleContents,
    signer: &SigningKeyManager,
) -> Result<BuiltBundle, BundleError> {
    // Lay out the blob subtrees first; the summary references them by
    // hash.
    let mut blobs: Vec<(String, Vec<u8>)> = Vec::new();
    for (filename, bytes) in &contents.raw {
        blobs.push((format!("raw/{filename}"), bytes.clone()));
    }
    if let Some(mapping) = &contents.metric_mapping {
        blobs.push(("mapping/metric_mapping.json".to_string(), mapping.clone()));
    }
    if let Some(capabilities) = &contents.capabilities {
        blobs.push((
            "capabilities/workspace_capabilities.json".to_string(),
            capabilities.clone(),
        ));
    }

    summary.artifacts = blobs
        .iter()
        .map(|(path, bytes)| ArtifactRef {
            path: path.clone(),
            sha256: sha256_hex(bytes),
        })
        .collect();

    let key_id = signer
        .current_key_id()
        .ok_or(SigningError::NoActiveKey)?;
    summary.signing = SigningBlock {
        algo: "ed25519".to_string(),
        public_key_id: key_id,
    };

    let summary_bytes = canonical::to_canonical_bytes(&summary)?;
    let (_, signature) = signer.sign(&summary_bytes)?;
    let signature_hex = hex::encode(signature.to_bytes());

    let report = render_report(&summary);

    // artifacts.json covers every entry except itself.
    let mut manifest_rows = vec![ManifestRow {
        path: SUMMARY_NAME.to_string(),
        sha256: sha256_hex(&summary_bytes),
        bytes: summary_bytes.len() as u64,
    }];
    manifest_rows.push(ManifestRow {
        path: SIGNATURE_NAME.to_string(),
        sha256: sha256_hex(signature_hex.as_bytes()),
        bytes: signature_hex.len() as u64,
    });
    manifest_rows.push(ManifestRow {
        path: REPORT_NAME.to_string(),
        sha256: sha256_hex(report.as_bytes()),
        bytes: report.len() as u64,
    });
    for (path, bytes) in &blobs {
        manifest_rows.push(ManifestRow {
            path: path.clone(),
            sha256: sha256_hex(bytes),
            bytes: bytes.len() as u64,
        });
    }
    let manifest_bytes = canonical::to_canonical_bytes(&manifest_rows)?;

    let mut entries: Vec<(String, Vec<u8>)> = vec![
        (SUMMARY_NAME.to_string(), summary_bytes),
        (SIGNATURE_NAME.to_string(), signature_hex.into_bytes()),
        (MANIFEST_NAME.to_string(), manifest_bytes),
        (REPORT_NAME.to_string(), report.into_bytes()),
    ];
    entries.extend(blobs);

    let zip = write_zip(&entries);
    let zip_sha256 = sha256_hex(&zip);
    Ok(BuiltBundle {
        zip,
        summary,
        zip_sha256,
    })
}

/// Verifies a bundle end to end: archive shape, per-entry hashes from
/// `artifacts.json`, summary canonicality, and the Ed25519 signature.
///
/// `public_key_hex` is the key the caller resolved for the summary's
/// `signing.public_key_id` (e.g. from `GET /v1/signing-keys/{id}`).
///
/// # Errors
///
/// Returns the first [`BundleError`] found.
pub fn verify_bundle(zip_bytes: &[u8], public_key_hex: &str) -> Result<BundleSummary, BundleError> {
    let entries = read_zip(zip_bytes)?;
    let find = |name: &str| {
        entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| bytes.as_slice())
            .ok_or_else(|| BundleError::MissingEntry {
                name: name.to_string(),
            })
    };

    let summary_bytes = find(SUMMARY_NAME)?;
    let signature_hex = find(SIGNATURE_NAME)?;
    let manifest_bytes = find(MANIFEST_NAME)?;

    // Per-entry hashes.
    let manifest: Vec<ManifestRow> =
        serde_json::from_slice(manifest_bytes).map_err(|e| BundleError::SummaryInvalid {
            message: format!("artifacts.json: {e}"),
        })?;
    for row in &manifest {
        let bytes = find(&row.path)?;
        if sha256_hex(bytes) != row.sha256 {
            return Err(BundleError::EntryHashMismatch {
                name: row.path.clone(),
            });
        }
    }

    // The summary must already be in canonical form; re-encoding it must
    // reproduce the signed bytes exactly.
    let summary: BundleSummary =
        serde_json::from_slice(summary_bytes).map_err(|e| BundleError::SummaryInvalid {
            message: e.to_string(),
        })?;
    let reencoded = canonical::to_canonical_bytes(&summary)?;
    if reencoded != summary_bytes {
        return Err(BundleError::SummaryInvalid {
            message: "summary is not in canonical form".to_string(),
        });
    }

    let signature = hex::decode(signature_hex).map_err(|_| BundleError::SignatureInvalid)?;
    verify_detached(public_key_hex, summary_bytes, &signature)
        .map_err(|_| BundleError::SignatureInvalid)?;

    Ok(summary)
}

/// Renders the human-readable report from the summary. Static HTML, no
/// scripts; everything shown is also in the signed summary.
fn render_report(summary: &BundleSummary) -> String {
    use std::fmt::Write as _;

    let mut rows = String::new();
    for row in &summary.results.normalized_metrics {
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{:.3}</td></tr>",
            escape_html(&row.device),
            escape_html(&row.metric),
            row.median
        );
    }

    let mut gates = String::new();
    for gate in &summary.results.gates_evaluation.gates {
        let _ = write!(
            gates,
            "<tr><td>{}</td><td>{}</td><td>{} {}</td><td>{:?}</td></tr>",
            escape_html(&gate.metric),
            escape_html(&gate.device),
            gate.op.as_str(),
            gate.threshold,
            gate.status
        );
    }

    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>EdgeGate run {run_id}</title></head><body>\
<h1>Run {run_id}: {status}</h1>\
<p>Pipeline {pipeline_id} &middot; workspace {workspace_id} &middot; created {created_at}</p>\
<p>Model sha256 <code>{model_sha}</code> &middot; promptpack {pp_id} {pp_version}</p>\
<h2>Metrics</h2><table><tr><th>Device</th><th>Metric</th><th>Median</th></tr>{rows}</table>\
<h2>Gates</h2><table><tr><th>Metric</th><th>Device</th><th>Gate</th><th>Status</th></tr>{gates}</table>\
<p>Signed with key <code>{key_id}</code> (ed25519).</p>\
</body></html>",
        run_id = summary.run_id,
        status = escape_html(&summary.results.status),
        pipeline_id = summary.pipeline_id,
        workspace_id = summary.workspace_id,
        created_at = escape_html(&summary.created_at),
        model_sha = escape_html(&summary.inputs.model.sha256),
        pp_id = escape_html(&summary.inputs.promptpack.promptpack_id),
        pp_version = escape_html(&summary.inputs.promptpack.version),
        rows = rows,
        gates = gates,
        key_id = escape_html(&summary.signing.public_key_id),
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests;
