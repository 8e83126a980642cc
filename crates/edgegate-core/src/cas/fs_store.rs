//! Filesystem-backed artifact store.
//!
//! Blobs live at `{root}/{workspace_id}/artifacts/{sha256}/{filename}`;
//! the per-workspace prefix keeps tenant isolation structural rather than
//! a query predicate. Metadata is persisted to an `index.json` at the
//! store root and rewritten on every mutation; the index holds no blob
//! content, so losing it loses attribution but never bytes.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{
    drain_reader, new_artifact, sha256_hex, Artifact, ArtifactKind, ArtifactStore, CasError,
};
use crate::ids::{ArtifactId, WorkspaceId};
use crate::limits;

const INDEX_FILENAME: &str = "index.json";

/// Filesystem store rooted at a directory.
pub struct FsStore {
    root: PathBuf,
    index: RwLock<Vec<Artifact>>,
}

impl FsStore {
    /// Opens (or creates) a store rooted at `root`, loading any existing
    /// index.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Storage`] if the root cannot be created or the
    /// index cannot be read.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CasError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CasError::Storage {
            message: format!("create store root {}: {e}", root.display()),
        })?;

        let index_path = root.join(INDEX_FILENAME);
        let index = if index_path.exists() {
            let data = fs::read_to_string(&index_path).map_err(|e| CasError::Storage {
                message: format!("read index: {e}"),
            })?;
            serde_json::from_str(&data).map_err(|e| CasError::Storage {
                message: format!("parse index: {e}"),
            })?
        } else {
            Vec::new()
        };

        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    fn blob_path(&self, artifact: &Artifact) -> PathBuf {
        self.root
            .join(artifact.workspace_id.to_string())
            .join(&artifact.storage_key)
    }

    /// Rewrites the index file. Failures are logged, not fatal: the blobs
    /// themselves are intact and the daemon's database remains the system
    /// of record for artifact rows.
    fn persist_index(&self, index: &[Artifact]) {
        let path = self.root.join(INDEX_FILENAME);
        match serde_json::to_string_pretty(index) {
            Ok(json) => {
                if let Err(e) = write_atomic(&path, json.as_bytes()) {
                    warn!(path = %path.display(), error = %e, "failed to write store index");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize store index"),
        }
    }
}

impl ArtifactStore for FsStore {
    fn put(
        &self,
        workspace_id: WorkspaceId,
        kind: ArtifactKind,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Artifact, CasError> {
        if kind == ArtifactKind::Model {
            limits::check_model_bytes(bytes.len() as u64)?;
        }
        let sha256 = sha256_hex(bytes);

        let mut index = self.index.write().expect("lock poisoned");
        if let Some(existing) = index
            .iter()
            .find(|a| a.workspace_id == workspace_id && a.sha256 == sha256 && !a.tombstoned)
        {
            return Ok(existing.clone());
        }

        let artifact = new_artifact(workspace_id, kind, filename, sha256, bytes.len() as u64);
        let path = self.blob_path(&artifact);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CasError::Storage {
                message: format!("create {}: {e}", parent.display()),
            })?;
        }
        write_atomic(&path, bytes).map_err(|e| CasError::Storage {
            message: format!("write {}: {e}", path.display()),
        })?;

        index.push(artifact.clone());
        self.persist_index(&index);
        Ok(artifact)
    }

    fn put_stream(
        &self,
        workspace_id: WorkspaceId,
        kind: ArtifactKind,
        filename: &str,
        reader: &mut dyn Read,
        declared_size: u64,
    ) -> Result<Artifact, CasError> {
        // Stream into a spool file next to the root so the final move is a
        // rename, then hash-addressed placement happens once the digest is
        // known.
        let spool = self.root.join(format!(".spool-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&spool).map_err(|e| CasError::Storage {
            message: format!("create spool: {e}"),
        })?;

        let result = drain_reader(kind, reader, declared_size, |chunk| {
            use std::io::Write as _;
            file.write_all(chunk).map_err(|e| CasError::Storage {
                message: format!("write spool: {e}"),
            })
        });
        let (sha256, total) = match result {
            Ok(ok) => ok,
            Err(e) => {
                let _ = fs::remove_file(&spool);
                return Err(e);
            }
        };
        drop(file);

        let mut index = self.index.write().expect("lock poisoned");
        if let Some(existing) = index
            .iter()
            .find(|a| a.workspace_id == workspace_id && a.sha256 == sha256 && !a.tombstoned)
        {
            let _ = fs::remove_file(&spool);
            return Ok(existing.clone());
        }

        let artifact = new_artifact(workspace_id, kind, filename, sha256, total);
        let path = self.blob_path(&artifact);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CasError::Storage {
                message: format!("create {}: {e}", parent.display()),
            })?;
        }
        fs::rename(&spool, &path).map_err(|e| CasError::Storage {
            message: format!("place blob {}: {e}", path.display()),
        })?;

        index.push(artifact.clone());
        self.persist_index(&index);
        Ok(artifact)
    }

    fn get(&self, workspace_id: WorkspaceId, artifact_id: ArtifactId) -> Result<Vec<u8>, CasError> {
        let index = self.index.read().expect("lock poisoned");
        let row = index
            .iter()
            .find(|a| a.id == artifact_id && a.workspace_id == workspace_id)
            .ok_or(CasError::NotFound { artifact_id })?;
        if row.tombstoned {
            return Err(CasError::NotFound { artifact_id });
        }

        let path = self.blob_path(row);
        let bytes = fs::read(&path).map_err(|_| CasError::NotFound { artifact_id })?;

        let actual = sha256_hex(&bytes);
        if actual != row.sha256 {
            return Err(CasError::IntegrityMismatch {
                artifact_id,
                expected: row.sha256.clone(),
                actual,
            });
        }
        Ok(bytes)
    }

    fn stat(
        &self,
        workspace_id: WorkspaceId,
        artifact_id: ArtifactId,
    ) -> Result<Artifact, CasError> {
        let index = self.index.read().expect("lock poisoned");
        index
            .iter()
            .find(|a| a.id == artifact_id && a.workspace_id == workspace_id)
            .cloned()
            .ok_or(CasError::NotFound { artifact_id })
    }

    fn lookup_by_sha(
        &self,
        workspace_id: WorkspaceId,
        sha256: &str,
    ) -> Result<Option<Artifact>, CasError> {
        let index = self.index.read().expect("lock poisoned");
        Ok(index
            .iter()
            .find(|a| a.workspace_id == workspace_id && a.sha256 == sha256 && !a.tombstoned)
            .cloned())
    }

    fn expire_older_than(
        &self,
        cutoff: DateTime<Utc>,
        referenced: &[ArtifactId],
    ) -> Result<usize, CasError> {
        let mut index = self.index.write().expect("lock poisoned");
        let mut expired = 0usize;
        for row in index.iter_mut() {
            if row.tombstoned || row.expires_at >= cutoff || referenced.contains(&row.id) {
                continue;
            }
            let path = self
                .root
                .join(row.workspace_id.to_string())
                .join(&row.storage_key);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to delete expired blob");
            }
            row.tombstoned = true;
            expired += 1;
        }
        if expired > 0 {
            self.persist_index(&index);
        }
        Ok(expired)
    }
}

/// Writes via a temp file + rename so readers never observe partial bytes.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
