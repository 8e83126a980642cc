//! Content-addressed artifact storage.
//!
//! Artifacts are immutable blobs keyed by SHA-256 and scoped to a
//! workspace. The store guarantees:
//!
//! - the recorded `sha256` is computed from what was actually stored
//! - retrieval re-verifies the hash; corruption surfaces as
//!   [`CasError::IntegrityMismatch`]
//! - identical bytes under the same workspace deduplicate
//! - cross-workspace access reports [`CasError::NotFound`], never a
//!   "forbidden" that would leak existence
//!
//! Expiration removes the underlying bytes but keeps a tombstoned record,
//! so hash references inside old evidence bundles remain attributable.
//!
//! Two backends: [`FsStore`] lays blobs out as
//! `{workspace}/artifacts/{sha256}/{filename}` with a JSON index file for
//! metadata; [`MemoryStore`] backs tests.

mod fs_store;
mod memory;

use std::io::Read;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ArtifactId, WorkspaceId};
use crate::limits::{self, LimitExceeded};

pub use fs_store::FsStore;
pub use memory::MemoryStore;

/// Default retention for unreferenced artifacts.
pub const RETENTION_DAYS: i64 = 30;

/// Chunk size for streaming ingestion.
const STREAM_CHUNK: usize = 64 * 1024;

/// What an artifact is, for retention and limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ArtifactKind {
    /// An uploaded model package.
    Model,
    /// Canonicalized promptpack content.
    PromptpackJson,
    /// A raw probe payload from the backend.
    ProbeRaw,
    /// A raw job payload collected during a run.
    RawResult,
    /// A workspace capabilities document.
    Capabilities,
    /// A metric mapping document.
    MetricMapping,
    /// A materialized job spec.
    JobSpec,
    /// A signed evidence bundle.
    Bundle,
}

impl ArtifactKind {
    /// Stable string form used in storage metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::PromptpackJson => "promptpack_json",
            Self::ProbeRaw => "probe_raw",
            Self::RawResult => "raw_result",
            Self::Capabilities => "capabilities",
            Self::MetricMapping => "metric_mapping",
            Self::JobSpec => "job_spec",
            Self::Bundle => "bundle",
        }
    }
}

/// Metadata for a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact id.
    pub id: ArtifactId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Kind of content.
    pub kind: ArtifactKind,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
    /// Workspace-relative storage key, `artifacts/{sha256}/{filename}`.
    pub storage_key: String,
    /// Size in bytes.
    pub bytes: u64,
    /// Original filename as uploaded.
    pub original_filename: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the artifact becomes eligible for expiry.
    pub expires_at: DateTime<Utc>,
    /// Set once the bytes have been expired; the record itself stays.
    pub tombstoned: bool,
}

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CasError {
    /// No such artifact in the caller's workspace. Also returned for
    /// artifacts owned by other workspaces and for tombstoned bytes.
    #[error("artifact not found: {artifact_id}")]
    NotFound {
        /// The requested id.
        artifact_id: ArtifactId,
    },

    /// Stored bytes no longer match the recorded hash.
    #[error("integrity error: artifact {artifact_id} expected sha {expected}, got {actual}")]
    IntegrityMismatch {
        /// The corrupt artifact.
        artifact_id: ArtifactId,
        /// Recorded hex SHA-256.
        expected: String,
        /// Hex SHA-256 of the bytes on disk.
        actual: String,
    },

    /// A size limit was violated.
    #[error(transparent)]
    Limit(#[from] LimitExceeded),

    /// A streaming upload delivered a different byte count than declared.
    #[error("size mismatch: declared {declared} bytes, received {actual}")]
    SizeMismatch {
        /// Declared size.
        declared: u64,
        /// Actual size received.
        actual: u64,
    },

    /// Storage backend I/O failure.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

/// Computes the hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

/// The store interface consumed by the rest of the core.
pub trait ArtifactStore: Send + Sync {
    /// Stores a blob. Identical bytes under the same workspace return the
    /// existing artifact.
    ///
    /// # Errors
    ///
    /// - [`CasError::Limit`] for `kind = Model` blobs over the cap
    /// - [`CasError::Storage`] on backend failure
    fn put(
        &self,
        workspace_id: WorkspaceId,
        kind: ArtifactKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Artifact, CasError>;

    /// Stores from a reader without buffering the whole blob, verifying the
    /// declared size.
    ///
    /// # Errors
    ///
    /// - [`CasError::Limit`] when the declared or actual size is over the
    ///   model cap
    /// - [`CasError::SizeMismatch`] when the reader yields a different
    ///   byte count than declared
    fn put_stream(
        &self,
        workspace_id: WorkspaceId,
        kind: ArtifactKind,
        filename: &str,
        reader: &mut dyn Read,
        declared_size: u64,
    ) -> Result<Artifact, CasError>;

    /// Retrieves a blob, re-verifying its hash.
    ///
    /// # Errors
    ///
    /// - [`CasError::NotFound`] for unknown, cross-workspace, or tombstoned
    ///   artifacts
    /// - [`CasError::IntegrityMismatch`] when the bytes no longer hash to
    ///   the recorded value
    fn get(&self, workspace_id: WorkspaceId, artifact_id: ArtifactId) -> Result<Vec<u8>, CasError>;

    /// Returns the metadata row, including tombstoned rows.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::NotFound`] for unknown or cross-workspace ids.
    fn stat(&self, workspace_id: WorkspaceId, artifact_id: ArtifactId)
        -> Result<Artifact, CasError>;

    /// Finds a live artifact by content hash within a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Storage`] on backend failure.
    fn lookup_by_sha(
        &self,
        workspace_id: WorkspaceId,
        sha256: &str,
    ) -> Result<Option<Artifact>, CasError>;

    /// Expires artifacts whose `expires_at` is before `cutoff`, except ids
    /// in `referenced`. Bytes are deleted; rows become tombstones. Returns
    /// the number of artifacts expired.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Storage`] on backend failure.
    fn expire_older_than(
        &self,
        cutoff: DateTime<Utc>,
        referenced: &[ArtifactId],
    ) -> Result<usize, CasError>;
}

/// Builds the workspace-relative storage key.
#[must_use]
pub fn storage_key(sha256: &str, filename: &str) -> String {
    format!("artifacts/{sha256}/{filename}")
}

/// Shared ingestion: drains a reader in chunks, hashing as it goes, and
/// enforces the declared size plus the per-kind cap.
fn drain_reader(
    kind: ArtifactKind,
    reader: &mut dyn Read,
    declared_size: u64,
    mut sink: impl FnMut(&[u8]) -> Result<(), CasError>,
) -> Result<(String, u64), CasError> {
    use sha2::{Digest, Sha256};

    if kind == ArtifactKind::Model {
        limits::check_model_bytes(declared_size)?;
    }

    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = reader.read(&mut buf).map_err(|e| CasError::Storage {
            message: format!("read failed: {e}"),
        })?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if total > declared_size {
            return Err(CasError::SizeMismatch {
                declared: declared_size,
                actual: total,
            });
        }
        hasher.update(&buf[..n]);
        sink(&buf[..n])?;
    }

    if total != declared_size {
        return Err(CasError::SizeMismatch {
            declared: declared_size,
            actual: total,
        });
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Builds the metadata row for freshly stored bytes.
fn new_artifact(
    workspace_id: WorkspaceId,
    kind: ArtifactKind,
    filename: &str,
    sha256: String,
    bytes: u64,
) -> Artifact {
    let created_at = Utc::now();
    Artifact {
        id: ArtifactId::generate(),
        workspace_id,
        kind,
        storage_key: storage_key(&sha256, filename),
        sha256,
        bytes,
        original_filename: filename.to_string(),
        created_at,
        expires_at: created_at + Duration::days(RETENTION_DAYS),
        tombstoned: false,
    }
}
