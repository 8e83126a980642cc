//! The run state machine.
//!
//! ```text
//! queued -> preparing -> submitting -> running -> collecting
//!        -> evaluating -> reporting -> passed | failed
//!
//! any non-terminal state -> error(code)
//! ```
//!
//! Invariants:
//!
//! - terminal states (`passed`, `failed`, `error`) have no outgoing
//!   transitions; once terminal, a run's state never changes
//! - transitions are validated centrally; the store refuses anything not
//!   in the table
//! - every transition is persisted before externally visible effects

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A run's position in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted, waiting for the workspace lock.
    Queued,
    /// Dispatched: inputs validated, job spec materialized.
    Preparing,
    /// Jobs being submitted to the backend.
    Submitting,
    /// Backend jobs in flight, worker polling.
    Running,
    /// Payloads being fetched and normalized.
    Collecting,
    /// Gating evaluator running.
    Evaluating,
    /// Evidence bundle being assembled and signed.
    Reporting,
    /// Terminal: every required gate passed.
    Passed,
    /// Terminal: a required gate failed.
    Failed,
    /// Terminal: the run errored; `error_code` holds the classification.
    Error,
}

impl RunState {
    /// Stable string form stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::Submitting => "submitting",
            Self::Running => "running",
            Self::Collecting => "collecting",
            Self::Evaluating => "evaluating",
            Self::Reporting => "reporting",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    /// Whether the state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Error)
    }

    /// The forward edge out of each in-flight state.
    #[must_use]
    pub const fn next_in_pipeline(&self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::Preparing),
            Self::Preparing => Some(Self::Submitting),
            Self::Submitting => Some(Self::Running),
            Self::Running => Some(Self::Collecting),
            Self::Collecting => Some(Self::Evaluating),
            Self::Evaluating => Some(Self::Reporting),
            Self::Reporting | Self::Passed | Self::Failed | Self::Error => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unknown state strings read from storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run state: {0}")]
pub struct UnknownRunState(pub String);

impl FromStr for RunState {
    type Err = UnknownRunState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "preparing" => Self::Preparing,
            "submitting" => Self::Submitting,
            "running" => Self::Running,
            "collecting" => Self::Collecting,
            "evaluating" => Self::Evaluating,
            "reporting" => Self::Reporting,
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "error" => Self::Error,
            other => return Err(UnknownRunState(other.to_string())),
        })
    }
}

/// Whether `from -> to` is a legal transition.
#[must_use]
pub fn can_transition(from: RunState, to: RunState) -> bool {
    use RunState as S;
    match (from, to) {
        // The forward pipeline.
        (S::Queued, S::Preparing)
        | (S::Preparing, S::Submitting)
        | (S::Submitting, S::Running)
        | (S::Running, S::Collecting)
        | (S::Collecting, S::Evaluating)
        | (S::Evaluating, S::Reporting)
        | (S::Reporting, S::Passed | S::Failed) => true,
        // Any non-terminal state may error.
        (from, S::Error) => !from.is_terminal(),
        _ => false,
    }
}
