//! Run orchestration: the state machine, the per-workspace lock, the
//! worker that drives a run end to end, and the dispatcher that feeds
//! workers from the queue.

pub mod dispatcher;
pub mod lock;
pub mod state;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use lock::{WorkspaceGuard, WorkspaceLocks};
pub use state::{can_transition, RunState};
pub use worker::{execute_run, PollPolicy, WorkerDeps};
