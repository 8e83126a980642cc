//! The abstract compute-hub interface.
//!
//! This is the only seam that speaks the external protocol. Everything the
//! hub returns is an opaque payload to the rest of the core: probe (C5)
//! discovers which JSON paths exist, and the run worker extracts values
//! only through the stored metric mapping.
//!
//! The trait is synchronous on purpose. A run worker is straight-line code
//! with a blocking poll step; the daemon parallelizes workers across runs,
//! not steps within one.

mod mock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{MockBackend, ScriptedJob};

/// Target runtime for compile jobs. The probe fixtures target `qnn_dlc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TargetRuntime {
    /// Qualcomm Neural Network DLC container.
    QnnDlc,
}

impl TargetRuntime {
    /// Stable string form used in job options.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QnnDlc => "qnn_dlc",
        }
    }
}

/// The authenticated identity behind a validated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Account identifier at the hub.
    pub account_id: String,
    /// Display name, when the hub provides one.
    pub display_name: Option<String>,
}

/// A device known to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identifier.
    pub device_id: String,
    /// Human-readable name, e.g. "Samsung Galaxy S24".
    pub device_name: String,
    /// Chipset family.
    pub chipset: String,
}

/// Opaque handle to a model uploaded to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteModelHandle(pub String);

/// Opaque handle to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub String);

/// Kind of job, used for submit bookkeeping and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Model compilation for a target runtime.
    Compile,
    /// On-device profiling of a compiled model.
    Profile,
    /// On-device inference with provided inputs.
    Inference,
}

/// Status of a job as reported by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued at the hub.
    Pending,
    /// Executing on a device.
    Running,
    /// Finished; the payload is the raw result document.
    Succeeded {
        /// Opaque result payload (JSON bytes from the hub).
        payload: Bytes,
    },
    /// Terminal failure at the hub.
    Failed {
        /// Vendor-reported reason.
        reason: String,
    },
}

impl JobStatus {
    /// Returns `true` for `Succeeded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The hub rejected the credentials.
    #[error("backend rejected credentials")]
    TokenRejected,

    /// Transport-level failure (connection, timeout, 5xx).
    #[error("backend transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// The hub does not know the referenced handle.
    #[error("unknown handle: {handle}")]
    UnknownHandle {
        /// The handle the hub rejected.
        handle: String,
    },

    /// Logs are not available for this job.
    #[error("logs unavailable for job {job}")]
    LogsUnavailable {
        /// The job whose logs were requested.
        job: String,
    },
}

/// The capability set the rest of the core consumes.
pub trait Backend: Send + Sync {
    /// Validates the token and returns the hub identity.
    ///
    /// # Errors
    ///
    /// [`BackendError::TokenRejected`] for bad credentials,
    /// [`BackendError::Transport`] for network failures.
    fn validate_token(&self) -> Result<Identity, BackendError>;

    /// Lists devices available to this account.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on transport or auth failure.
    fn list_devices(&self) -> Result<Vec<Device>, BackendError>;

    /// Uploads a model package.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on transport or auth failure.
    fn upload_model(
        &self,
        bytes: &[u8],
        kind: crate::package::PackageKind,
        name: &str,
    ) -> Result<RemoteModelHandle, BackendError>;

    /// Submits a compile job.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on transport failure or unknown model.
    fn submit_compile(
        &self,
        model: &RemoteModelHandle,
        device: &Device,
        target: TargetRuntime,
    ) -> Result<JobHandle, BackendError>;

    /// Submits a profile job against a compiled model job.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on transport failure or unknown job.
    fn submit_profile(
        &self,
        compiled: &JobHandle,
        device: &Device,
    ) -> Result<JobHandle, BackendError>;

    /// Submits an inference job against a compiled model job.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on transport failure or unknown job.
    fn submit_inference(
        &self,
        compiled: &JobHandle,
        device: &Device,
        inputs: &serde_json::Value,
    ) -> Result<JobHandle, BackendError>;

    /// Polls a job once.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] on transport failure or unknown job.
    fn poll(&self, job: &JobHandle) -> Result<JobStatus, BackendError>;

    /// Fetches job logs when the hub retains them.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::LogsUnavailable`] when the hub has none.
    fn fetch_logs(&self, job: &JobHandle) -> Result<Bytes, BackendError>;
}
