//! Pipeline configuration: devices, promptpack ref, gates, run policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gating::Gate;
use crate::ids::{PipelineId, WorkspaceId};
use crate::limits::{self, LimitExceeded};

/// A device pinned in a pipeline's matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Stable device identifier at the hub.
    pub device_id: String,
    /// Human-readable name, used as the measurement-table key.
    pub device_name: String,
}

/// Reference to a promptpack version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPackRef {
    /// The pack's logical id.
    pub logical_id: String,
    /// The pinned version.
    pub version: String,
}

/// Execution policy for runs of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPolicy {
    /// Warmup iterations per device, excluded from aggregation.
    pub warmup_runs: u32,
    /// Measurement repeats per device, 1..=5.
    pub measurement_repeats: u32,
    /// Token cap for inference cases.
    pub max_new_tokens: u32,
    /// Hard deadline for the whole run.
    pub timeout_minutes: u32,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            measurement_repeats: 3,
            max_new_tokens: 128,
            timeout_minutes: 20,
        }
    }
}

impl RunPolicy {
    /// Validates the policy against the hard limits.
    ///
    /// # Errors
    ///
    /// Returns [`LimitExceeded`] for out-of-range values.
    pub fn validate(&self) -> Result<(), LimitExceeded> {
        limits::check_repeats(self.measurement_repeats)?;
        limits::check_max_new_tokens(self.max_new_tokens)?;
        limits::check_timeout_minutes(self.timeout_minutes)?;
        Ok(())
    }
}

/// Errors from pipeline validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// A hard limit was violated.
    #[error(transparent)]
    Limit(#[from] LimitExceeded),

    /// The pipeline name is empty.
    #[error("pipeline name must not be empty")]
    EmptyName,

    /// Two entries in the device matrix name the same device.
    #[error("duplicate device in matrix: {device_id}")]
    DuplicateDevice {
        /// The repeated device id.
        device_id: String,
    },
}

/// A pinned pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline id.
    pub id: PipelineId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Display name, unique per workspace by daemon constraint.
    pub name: String,
    /// Devices to run on, at most 5, in evaluation order.
    pub device_matrix: Vec<DeviceRef>,
    /// The promptpack version this pipeline runs.
    pub promptpack_ref: PromptPackRef,
    /// Ordered gates.
    pub gates: Vec<Gate>,
    /// Execution policy.
    pub run_policy: RunPolicy,
}

impl Pipeline {
    /// Validates the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] on any violation.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::EmptyName);
        }
        limits::check_devices(self.device_matrix.len())?;
        self.run_policy.validate()?;

        let mut seen = std::collections::HashSet::new();
        for device in &self.device_matrix {
            if !seen.insert(device.device_id.as_str()) {
                return Err(PipelineError::DuplicateDevice {
                    device_id: device.device_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Device names in matrix order, the order gates are evaluated in.
    #[must_use]
    pub fn device_names(&self) -> Vec<String> {
        self.device_matrix
            .iter()
            .map(|d| d.device_name.clone())
            .collect()
    }
}
