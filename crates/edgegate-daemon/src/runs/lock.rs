//! Per-workspace single-flight locking.
//!
//! Acquiring a workspace's lock is the `queued -> preparing` edge: a run
//! only leaves the queue while its workspace holds no other in-flight
//! run. The lock is advisory and process-local; the database's active-run
//! check backs it up across restarts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use edgegate_core::ids::WorkspaceId;

/// Registry of held workspace locks.
#[derive(Clone, Default)]
pub struct WorkspaceLocks {
    held: Arc<Mutex<HashSet<WorkspaceId>>>,
}

impl WorkspaceLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to take the lock for a workspace. Returns `None` when it is
    /// already held.
    #[must_use]
    pub fn try_lock(&self, workspace_id: WorkspaceId) -> Option<WorkspaceGuard> {
        let mut held = self.held.lock().expect("lock poisoned");
        if held.insert(workspace_id) {
            Some(WorkspaceGuard {
                workspace_id,
                registry: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    /// Whether a workspace's lock is currently held.
    #[must_use]
    pub fn is_locked(&self, workspace_id: WorkspaceId) -> bool {
        self.held
            .lock()
            .expect("lock poisoned")
            .contains(&workspace_id)
    }
}

/// RAII guard; dropping releases the workspace.
pub struct WorkspaceGuard {
    workspace_id: WorkspaceId,
    registry: Arc<Mutex<HashSet<WorkspaceId>>>,
}

impl WorkspaceGuard {
    /// The locked workspace.
    #[must_use]
    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .expect("lock poisoned")
            .remove(&self.workspace_id);
    }
}
