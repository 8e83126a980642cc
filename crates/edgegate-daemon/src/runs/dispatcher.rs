//! The dispatcher: feeds queued runs to workers, one per workspace.
//!
//! Dispatch order is queue order, but a workspace with an in-flight run
//! is skipped until its lock releases. Cancellation is cooperative: a
//! flag per in-flight run, checked by the worker between steps and inside
//! poll loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use edgegate_core::error::ErrorCode;
use edgegate_core::ids::RunId;

use crate::db::RunUpdates;
use crate::runs::lock::WorkspaceLocks;
use crate::runs::state::RunState;
use crate::runs::worker::{execute_run, WorkerDeps};

/// Idle sleep between queue scans.
const IDLE_SLEEP: Duration = Duration::from_millis(250);

/// The run dispatcher.
pub struct Dispatcher {
    deps: WorkerDeps,
    locks: WorkspaceLocks,
    cancels: Mutex<HashMap<RunId, Arc<AtomicBool>>>,
    shutdown: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher over the given dependencies.
    #[must_use]
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            locks: WorkspaceLocks::new(),
            cancels: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Starts `threads` worker threads draining the queue.
    pub fn start(self: &Arc<Self>, threads: usize) -> Vec<JoinHandle<()>> {
        (0..threads)
            .map(|i| {
                let dispatcher = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("run-worker-{i}"))
                    .spawn(move || dispatcher.worker_loop())
                    .expect("spawn worker thread")
            })
            .collect()
    }

    fn worker_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.dispatch_one() {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// Claims and fully executes one run. Returns `false` when nothing was
    /// dispatchable. Used directly by tests to drive the queue
    /// synchronously.
    pub fn dispatch_one(&self) -> bool {
        let claimable = match self.deps.db.claimable_runs() {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "failed to scan run queue");
                return false;
            }
        };

        for (workspace_id, run_id) in claimable {
            let Some(guard) = self.locks.try_lock(workspace_id) else {
                continue;
            };

            let cancel = self.register_cancel(run_id);
            info!(run_id = %run_id, workspace_id = %workspace_id, "dispatching run");
            let state = execute_run(&self.deps, workspace_id, run_id, &cancel);
            info!(run_id = %run_id, state = %state, "run finished");
            self.unregister_cancel(run_id);
            drop(guard);
            return true;
        }
        false
    }

    /// Drains the queue until empty. Test helper.
    pub fn drain(&self) {
        while self.dispatch_one() {}
    }

    /// Requests cancellation. In-flight runs stop at their next
    /// cancellation point; queued runs are failed immediately.
    pub fn cancel_run(
        &self,
        workspace_id: edgegate_core::ids::WorkspaceId,
        run_id: RunId,
    ) {
        if let Some(flag) = self
            .cancels
            .lock()
            .expect("lock poisoned")
            .get(&run_id)
        {
            flag.store(true, Ordering::Relaxed);
            return;
        }
        // Not in flight: cancel directly if still queued.
        let result = self.deps.db.transition_run(
            workspace_id,
            run_id,
            RunState::Error,
            RunUpdates {
                error_code: Some(ErrorCode::Cancelled),
                error_detail: Some("cancelled before dispatch".to_string()),
                ..RunUpdates::default()
            },
        );
        if let Err(e) = result {
            warn!(run_id = %run_id, error = %e, "cancel of queued run failed");
        }
    }

    /// Resumes runs left in non-terminal states by a previous process.
    /// Each resumes at its persisted state; the worker re-runs that
    /// phase's work from scratch.
    pub fn recover_interrupted(&self) {
        let active = match self.deps.db.active_runs() {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "failed to scan for interrupted runs");
                return;
            }
        };
        for (workspace_id, run_id, state) in active {
            let Some(guard) = self.locks.try_lock(workspace_id) else {
                continue;
            };
            info!(run_id = %run_id, state = %state, "resuming interrupted run");
            let cancel = self.register_cancel(run_id);
            let final_state = execute_run(&self.deps, workspace_id, run_id, &cancel);
            info!(run_id = %run_id, state = %final_state, "interrupted run resumed");
            self.unregister_cancel(run_id);
            drop(guard);
        }
    }

    /// Signals worker threads to exit after their current run.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn register_cancel(&self, run_id: RunId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .expect("lock poisoned")
            .insert(run_id, Arc::clone(&flag));
        flag
    }

    fn unregister_cancel(&self, run_id: RunId) {
        self.cancels.lock().expect("lock poisoned").remove(&run_id);
    }
}
