//! ProbeSuite: capability discovery against the backend.
//!
//! Nothing in the core assumes what the hub exposes. The probe suite runs
//! fixture models through the real operation sequence - validate token,
//! list devices, upload, compile, profile, inference, logs - and records,
//! per capability, whether it worked and which stored payload proves it.
//!
//! Every step is fail-soft: a failing probe marks its capability
//! unavailable and the suite proceeds where dependencies allow. All raw
//! payloads are stored through the content store; the capabilities
//! document references them by artifact id.
//!
//! Metric-path derivation is strict: a normalized metric gets a `stable`
//! path only when the same path resolves, with a consistent unit, in at
//! least two probe payloads. Nothing is ever populated by assumption.

mod fixtures;
mod mapping;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Backend, Device, JobHandle, JobStatus, TargetRuntime};
use crate::cas::{ArtifactKind, ArtifactStore, CasError};
use crate::ids::{ArtifactId, ProbeRunId, WorkspaceId};
use crate::metrics::MetricMapping;

pub use fixtures::{builtin_fixtures, ProbeFixture};
pub use mapping::{derive_metric_mapping, CANDIDATE_PATHS};

/// The capability ids every probe run reports on.
pub const CAPABILITY_IDS: &[&str] = &[
    "TOKEN_VALIDATION",
    "DEVICE_LIST",
    "TARGET_QNN_DLC",
    "MODEL_ONNX_EXTERNAL_DATA",
    "MODEL_AIMET_ONNX_ENCODINGS",
    "PROFILE_METRICS",
    "INFERENCE_OUTPUTS",
    "JOB_LOGS",
];

/// Tri-state stability of a capability claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStability {
    /// Observed working consistently.
    Stable,
    /// Observed working, but with inconsistent behavior across probes.
    Unstable,
    /// Not observed; nothing is known.
    Unknown,
}

/// One capability claim, justified by a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Whether the capability worked in this probe run.
    pub available: bool,
    /// Stability of the claim.
    pub stability: CapabilityStability,
    /// The stored payload whose shape justifies the claim, when one
    /// exists.
    pub evidence_artifact_id: Option<ArtifactId>,
    /// Failure detail when unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CapabilityRecord {
    fn unknown() -> Self {
        Self {
            available: false,
            stability: CapabilityStability::Unknown,
            evidence_artifact_id: None,
            detail: None,
        }
    }

    fn available(evidence: Option<ArtifactId>) -> Self {
        Self {
            available: true,
            stability: CapabilityStability::Stable,
            evidence_artifact_id: evidence,
            detail: None,
        }
    }

    fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            available: false,
            stability: CapabilityStability::Unknown,
            evidence_artifact_id: None,
            detail: Some(detail.into()),
        }
    }
}

/// The workspace capabilities document produced by one probe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceCapabilities {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// This probe run's id.
    pub probe_run_id: ProbeRunId,
    /// When the probe ran.
    pub probed_at: DateTime<Utc>,
    /// Devices seen, primary first. At most two are exercised.
    pub devices: Vec<Device>,
    /// Capability claims keyed by capability id.
    pub capabilities: BTreeMap<String, CapabilityRecord>,
}

/// Everything a probe run produces.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// The capabilities document.
    pub capabilities: WorkspaceCapabilities,
    /// The derived metric mapping.
    pub metric_mapping: MetricMapping,
    /// Stored profile payloads the mapping was derived from.
    pub profile_payload_ids: Vec<ArtifactId>,
}

/// Tunables for a probe run.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Maximum polls per job before giving up on it.
    pub poll_budget: usize,
    /// Sleep between polls. Zero in tests.
    pub poll_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            poll_budget: 150,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// The probe engine.
pub struct ProbeSuite<'a> {
    store: &'a dyn ArtifactStore,
    workspace_id: WorkspaceId,
    config: ProbeConfig,
}

impl<'a> ProbeSuite<'a> {
    /// Creates a suite writing payloads into `store` for `workspace_id`.
    #[must_use]
    pub fn new(store: &'a dyn ArtifactStore, workspace_id: WorkspaceId) -> Self {
        Self {
            store,
            workspace_id,
            config: ProbeConfig::default(),
        }
    }

    /// Overrides the polling configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the full suite. `previous_payloads` are profile payloads from
    /// an earlier probe run; mapping stability requires agreement across
    /// at least two payloads, so first runs produce no stable entries
    /// unless this run itself profiles on two devices.
    pub fn run(
        &self,
        backend: &dyn Backend,
        fixtures: &[ProbeFixture],
        previous_payloads: &[(ArtifactId, serde_json::Value)],
    ) -> ProbeOutcome {
        let probe_run_id = ProbeRunId::generate();
        let mut capabilities: BTreeMap<String, CapabilityRecord> = CAPABILITY_IDS
            .iter()
            .map(|id| ((*id).to_string(), CapabilityRecord::unknown()))
            .collect();
        let mut profile_payloads: Vec<(ArtifactId, serde_json::Value)> =
            previous_payloads.to_vec();
        let mut new_profile_ids = Vec::new();
        let mut completed_job: Option<JobHandle> = None;

        // 1. Token.
        let token_ok = match backend.validate_token() {
            Ok(identity) => {
                let evidence = self.store_payload(
                    probe_run_id,
                    "token_identity.json",
                    &serde_json::to_vec(&identity).unwrap_or_default(),
                );
                capabilities.insert(
                    "TOKEN_VALIDATION".to_string(),
                    CapabilityRecord::available(evidence),
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "probe: token validation failed");
                capabilities.insert(
                    "TOKEN_VALIDATION".to_string(),
                    CapabilityRecord::unavailable(e.to_string()),
                );
                false
            }
        };

        // 2. Devices. Without a token nothing downstream can run.
        let mut devices = Vec::new();
        if token_ok {
            match backend.list_devices() {
                Ok(listed) if !listed.is_empty() => {
                    let evidence = self.store_payload(
                        probe_run_id,
                        "device_list.json",
                        &serde_json::to_vec(&listed).unwrap_or_default(),
                    );
                    capabilities.insert(
                        "DEVICE_LIST".to_string(),
                        CapabilityRecord::available(evidence),
                    );
                    devices = listed;
                    devices.truncate(2);
                }
                Ok(_) => {
                    capabilities.insert(
                        "DEVICE_LIST".to_string(),
                        CapabilityRecord::unavailable("hub returned no devices"),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "probe: device listing failed");
                    capabilities.insert(
                        "DEVICE_LIST".to_string(),
                        CapabilityRecord::unavailable(e.to_string()),
                    );
                }
            }
        }

        // 3. Fixtures: compile, then profile + inference on the primary.
        if let Some(primary) = devices.first().cloned() {
            for fixture in fixtures {
                let caps = self.probe_fixture(
                    backend,
                    probe_run_id,
                    fixture,
                    &primary,
                    &mut profile_payloads,
                    &mut new_profile_ids,
                    &mut completed_job,
                );
                for (id, record) in caps {
                    merge_capability(&mut capabilities, &id, record);
                }
            }
        }

        // 4. Logs for one completed job.
        if let Some(job) = &completed_job {
            match backend.fetch_logs(job) {
                Ok(log_bytes) => {
                    let evidence =
                        self.store_payload(probe_run_id, "job_logs.txt", &log_bytes);
                    capabilities
                        .insert("JOB_LOGS".to_string(), CapabilityRecord::available(evidence));
                }
                Err(e) => {
                    debug!(error = %e, "probe: logs unavailable");
                    capabilities.insert(
                        "JOB_LOGS".to_string(),
                        CapabilityRecord::unavailable(e.to_string()),
                    );
                }
            }
        }

        let metric_mapping = derive_metric_mapping(self.workspace_id, &profile_payloads);
        info!(
            workspace_id = %self.workspace_id,
            probe_run_id = %probe_run_id,
            payloads = profile_payloads.len(),
            "probe run complete"
        );

        ProbeOutcome {
            capabilities: WorkspaceCapabilities {
                workspace_id: self.workspace_id,
                probe_run_id,
                probed_at: Utc::now(),
                devices,
                capabilities,
            },
            metric_mapping,
            profile_payload_ids: new_profile_ids,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn probe_fixture(
        &self,
        backend: &dyn Backend,
        probe_run_id: ProbeRunId,
        fixture: &ProbeFixture,
        primary: &Device,
        profile_payloads: &mut Vec<(ArtifactId, serde_json::Value)>,
        new_profile_ids: &mut Vec<ArtifactId>,
        completed_job: &mut Option<JobHandle>,
    ) -> Vec<(String, CapabilityRecord)> {
        let mut out = Vec::new();

        // Shape-check the fixture the same way a user upload is checked.
        if let Err(e) = fixture.validate() {
            out.push((
                fixture.capability_id().to_string(),
                CapabilityRecord::unavailable(format!("fixture invalid: {e}")),
            ));
            return out;
        }

        let model = match backend.upload_model(&fixture.bytes, fixture.kind, &fixture.name) {
            Ok(handle) => handle,
            Err(e) => {
                out.push((
                    fixture.capability_id().to_string(),
                    CapabilityRecord::unavailable(format!("upload failed: {e}")),
                ));
                return out;
            }
        };

        let compile_job =
            match backend.submit_compile(&model, primary, TargetRuntime::QnnDlc) {
                Ok(job) => job,
                Err(e) => {
                    out.push((
                        fixture.capability_id().to_string(),
                        CapabilityRecord::unavailable(format!("compile submit failed: {e}")),
                    ));
                    return out;
                }
            };

        let compile_payload = match self.wait_terminal(backend, &compile_job) {
            Ok(payload) => payload,
            Err(detail) => {
                out.push((
                    fixture.capability_id().to_string(),
                    CapabilityRecord::unavailable(detail),
                ));
                return out;
            }
        };
        let compile_evidence = self.store_payload(
            probe_run_id,
            &format!("{}_compile.json", fixture.name),
            &compile_payload,
        );
        *completed_job = Some(compile_job.clone());

        // Compile success proves the packaging capability and the target.
        out.push((
            fixture.capability_id().to_string(),
            CapabilityRecord::available(compile_evidence),
        ));
        out.push((
            "TARGET_QNN_DLC".to_string(),
            CapabilityRecord::available(compile_evidence),
        ));

        // Profile on the primary device.
        match backend.submit_profile(&compile_job, primary) {
            Ok(job) => match self.wait_terminal(backend, &job) {
                Ok(payload) => {
                    let evidence = self.store_payload(
                        probe_run_id,
                        &format!("{}_profile.json", fixture.name),
                        &payload,
                    );
                    out.push((
                        "PROFILE_METRICS".to_string(),
                        CapabilityRecord::available(evidence),
                    ));
                    if let (Some(id), Ok(parsed)) =
                        (evidence, serde_json::from_slice(&payload))
                    {
                        profile_payloads.push((id, parsed));
                        new_profile_ids.push(id);
                    }
                }
                Err(detail) => out.push((
                    "PROFILE_METRICS".to_string(),
                    CapabilityRecord::unavailable(detail),
                )),
            },
            Err(e) => out.push((
                "PROFILE_METRICS".to_string(),
                CapabilityRecord::unavailable(format!("profile submit failed: {e}")),
            )),
        }

        // Inference with the fixture's canned input.
        match backend.submit_inference(&compile_job, primary, &fixture.sample_input) {
            Ok(job) => match self.wait_terminal(backend, &job) {
                Ok(payload) => {
                    let evidence = self.store_payload(
                        probe_run_id,
                        &format!("{}_inference.json", fixture.name),
                        &payload,
                    );
                    out.push((
                        "INFERENCE_OUTPUTS".to_string(),
                        CapabilityRecord::available(evidence),
                    ));
                }
                Err(detail) => out.push((
                    "INFERENCE_OUTPUTS".to_string(),
                    CapabilityRecord::unavailable(detail),
                )),
            },
            Err(e) => out.push((
                "INFERENCE_OUTPUTS".to_string(),
                CapabilityRecord::unavailable(format!("inference submit failed: {e}")),
            )),
        }

        out
    }

    /// Polls until terminal within the poll budget.
    fn wait_terminal(
        &self,
        backend: &dyn Backend,
        job: &JobHandle,
    ) -> Result<bytes::Bytes, String> {
        for _ in 0..self.config.poll_budget {
            match backend.poll(job) {
                Ok(JobStatus::Succeeded { payload }) => return Ok(payload),
                Ok(JobStatus::Failed { reason }) => {
                    return Err(format!("job failed: {reason}"))
                }
                Ok(JobStatus::Pending | JobStatus::Running) => {
                    if !self.config.poll_interval.is_zero() {
                        std::thread::sleep(self.config.poll_interval);
                    }
                }
                Err(e) => return Err(format!("poll failed: {e}")),
            }
        }
        Err("job did not reach a terminal state within the poll budget".to_string())
    }

    /// Stores a raw payload; storage failure degrades to "no evidence"
    /// rather than failing the probe.
    fn store_payload(
        &self,
        probe_run_id: ProbeRunId,
        filename: &str,
        bytes: &[u8],
    ) -> Option<ArtifactId> {
        let name = format!("probe-{probe_run_id}-{filename}");
        match self
            .store
            .put(self.workspace_id, ArtifactKind::ProbeRaw, &name, bytes)
        {
            Ok(artifact) => Some(artifact.id),
            Err(CasError::Limit(e)) => {
                warn!(error = %e, filename, "probe payload over size limit, not stored");
                None
            }
            Err(e) => {
                warn!(error = %e, filename, "failed to store probe payload");
                None
            }
        }
    }
}

/// A capability observed available anywhere in the run stays available;
/// later failures refine detail but never erase earlier evidence.
fn merge_capability(
    capabilities: &mut BTreeMap<String, CapabilityRecord>,
    id: &str,
    record: CapabilityRecord,
) {
    let slot = capabilities
        .entry(id.to_string())
        .or_insert_with(CapabilityRecord::unknown);
    if record.available || !slot.available {
        *slot = record;
    }
}

#[cfg(test)]
mod tests;
