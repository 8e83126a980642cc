//! In-memory artifact store for tests.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::{
    drain_reader, new_artifact, sha256_hex, Artifact, ArtifactKind, ArtifactStore, CasError,
};
use crate::ids::{ArtifactId, WorkspaceId};
use crate::limits;

#[derive(Default)]
struct Inner {
    rows: HashMap<ArtifactId, Artifact>,
    blobs: HashMap<ArtifactId, Vec<u8>>,
}

/// In-memory store. Clones share state, mirroring how a process shares one
/// filesystem store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-tombstoned) artifacts, for test assertions.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let inner = self.inner.read().expect("lock poisoned");
        inner.rows.values().filter(|a| !a.tombstoned).count()
    }

    /// Corrupts a stored blob, for integrity tests.
    ///
    /// # Panics
    ///
    /// Panics if the artifact does not exist or the lock is poisoned.
    pub fn corrupt(&self, artifact_id: ArtifactId) {
        let mut inner = self.inner.write().expect("lock poisoned");
        let blob = inner.blobs.get_mut(&artifact_id).expect("no such blob");
        if let Some(first) = blob.first_mut() {
            *first ^= 0xff;
        }
    }
}

impl ArtifactStore for MemoryStore {
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

        let mut inner = self.inner.write().expect("lock poisoned");
        if let Some(existing) = inner
            .rows
            .values()
            .find(|a| a.workspace_id == workspace_id && a.sha256 == sha256 && !a.tombstoned)
        {
            return Ok(existing.clone());
        }

        let artifact = new_artifact(workspace_id, kind, filename, sha256, bytes.len() as u64);
        inner.blobs.insert(artifact.id, bytes.to_vec());
        inner.rows.insert(artifact.id, artifact.clone());
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
        let mut collected = Vec::new();
        let (_sha, _total) = drain_reader(kind, reader, declared_size, |chunk| {
            collected.extend_from_slice(chunk);
            Ok(())
        })?;
        self.put(workspace_id, kind, filename, &collected)
    }

    fn get(&self, workspace_id: WorkspaceId, artifact_id: ArtifactId) -> Result<Vec<u8>, CasError> {
        let inner = self.inner.read().expect("lock poisoned");
        let row = inner
            .rows
            .get(&artifact_id)
            .filter(|a| a.workspace_id == workspace_id)
            .ok_or(CasError::NotFound { artifact_id })?;
        if row.tombstoned {
            return Err(CasError::NotFound { artifact_id });
        }
        let blob = inner
            .blobs
            .get(&artifact_id)
            .ok_or(CasError::NotFound { artifact_id })?;

        let actual = sha256_hex(blob);
        if actual != row.sha256 {
            return Err(CasError::IntegrityMismatch {
                artifact_id,
                expected: row.sha256.clone(),
                actual,
            });
        }
        Ok(blob.clone())
    }

    fn stat(
        &self,
        workspace_id: WorkspaceId,
        artifact_id: ArtifactId,
    ) -> Result<Artifact, CasError> {
        let inner = self.inner.read().expect("lock poisoned");
        inner
            .rows
            .get(&artifact_id)
            .filter(|a| a.workspace_id == workspace_id)
            .cloned()
            .ok_or(CasError::NotFound { artifact_id })
    }

    fn lookup_by_sha(
        &self,
        workspace_id: WorkspaceId,
        sha256: &str,
    ) -> Result<Option<Artifact>, CasError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .rows
            .values()
            .find(|a| a.workspace_id == workspace_id && a.sha256 == sha256 && !a.tombstoned)
            .cloned())
    }

    fn expire_older_than(
        &self,
        cutoff: DateTime<Utc>,
        referenced: &[ArtifactId],
    ) -> Result<usize, CasError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let expired: Vec<ArtifactId> = inner
            .rows
            .values()
            .filter(|a| !a.tombstoned && a.expires_at < cutoff && !referenced.contains(&a.id))
            .map(|a| a.id)
            .collect();
        for id in &expired {
            inner.blobs.remove(id);
            if let Some(row) = inner.rows.get_mut(id) {
                row.tombstoned = true;
            }
        }
        Ok(expired.len())
    }
}
