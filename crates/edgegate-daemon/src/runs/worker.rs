//! The run worker: drives one run from `queued` to a terminal state.
//!
//! The worker is straight-line blocking code. Each phase persists its
//! state transition before doing external work, so a crashed worker can
//! be resumed by re-entering the run at its last persisted state and
//! redoing that phase's work; all phase work is safe to redo (prepare is
//! pure reads, submits create fresh jobs, polls are idempotent).
//!
//! Retry policy:
//!
//! - submit (upload, compile, profile, inference): one retry on transport
//!   failure, then `SUBMIT_FAILED`
//! - poll: retried until the run deadline with exponential backoff
//!   (base 2 s, factor 2, cap 60 s)
//! - evaluate / bundle / persist: no retries, failures are deterministic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use tracing::{info, warn};

use edgegate_core::backend::{Backend, BackendError, Device, JobHandle, JobStatus, TargetRuntime};
use edgegate_core::bundle::{
    build_bundle, BundleContents, BundleSummary, DeviceInput, ModelInput, NormalizedMetricRow,
    PromptPackInput, SigningBlock, SummaryInputs, SummaryResults,
};
use edgegate_core::cas::{Artifact, ArtifactKind, ArtifactStore, CasError};
use edgegate_core::envelope::{BackendToken, MasterKeyRing};
use edgegate_core::error::ErrorCode;
use edgegate_core::gating::{self, GatesEvaluation, Outcome};
use edgegate_core::ids::{RunId, WorkspaceId};
use edgegate_core::metrics::{
    CorrectnessTable, MeasurementTable, MetricMapping, CORRECTNESS_METRIC,
};
use edgegate_core::package::{self, PackageEntry, PackageKind};
use edgegate_core::pipeline::Pipeline;
use edgegate_core::promptpack::PromptPackContent;
use edgegate_core::signing::SigningKeyManager;

use crate::db::{DbError, PromptPackRow, RunRow, RunUpdates, Store};
use crate::runs::state::RunState;

/// Poll backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// First delay between polls.
    pub base: Duration,
    /// Multiplier per attempt.
    pub factor: u32,
    /// Delay ceiling.
    pub cap: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2,
            cap: Duration::from_secs(60),
        }
    }
}

impl PollPolicy {
    /// Zero-delay policy for tests.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            factor: 2,
            cap: Duration::ZERO,
        }
    }
}

/// Builds a backend client from a decrypted token.
pub type BackendFactory = Arc<dyn Fn(&BackendToken) -> Arc<dyn Backend> + Send + Sync>;

/// Everything a worker needs.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Run and configuration storage.
    pub db: Store,
    /// Artifact storage.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Master keys for opening sealed tokens.
    pub masters: Arc<MasterKeyRing>,
    /// Bundle signing keys.
    pub signer: Arc<SigningKeyManager>,
    /// Backend client factory.
    pub backend_factory: BackendFactory,
    /// Poll backoff.
    pub poll: PollPolicy,
    /// Overrides the run deadline derived from the pipeline's
    /// `timeout_minutes`. Test hook; production leaves it `None`.
    pub timeout_override: Option<Duration>,
}

/// Terminal failure of a run phase.
struct RunFailure {
    code: ErrorCode,
    detail: String,
}

impl RunFailure {
    fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl From<DbError> for RunFailure {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => Self::new(ErrorCode::NotFound, "referenced entity not found"),
            other => Self::new(ErrorCode::BundleFailed, format!("persistence: {other}")),
        }
    }
}

impl From<CasError> for RunFailure {
    fn from(e: CasError) -> Self {
        match &e {
            CasError::NotFound { .. } => Self::new(ErrorCode::NotFound, e.to_string()),
            CasError::IntegrityMismatch { .. } => {
                Self::new(ErrorCode::IntegrityError, e.to_string())
            }
            CasError::Limit(_) => Self::new(ErrorCode::LimitExceeded, e.to_string()),
            _ => Self::new(ErrorCode::BundleFailed, e.to_string()),
        }
    }
}

/// Context assembled by the prepare phase; pure reads, safe to rebuild.
struct RunContext {
    pipeline: Pipeline,
    promptpack: PromptPackRow,
    promptpack_sha: String,
    model: Artifact,
    model_bytes: Vec<u8>,
    mapping: MetricMapping,
    mapping_bytes: Option<Vec<u8>>,
    mapping_ref: Option<edgegate_core::ids::ArtifactId>,
    capabilities_bytes: Option<Vec<u8>>,
    capabilities_ref: Option<edgegate_core::ids::ArtifactId>,
    backend: Arc<dyn Backend>,
    deadline: Instant,
}

/// Jobs submitted for one device.
struct DeviceJobs {
    device: Device,
    warmup_profiles: Vec<JobHandle>,
    repeat_profiles: Vec<JobHandle>,
    repeat_inferences: Vec<JobHandle>,
}

/// Terminal payloads per device, in the same order as the job lists.
struct DevicePayloads {
    device: Device,
    warmup_profiles: Vec<Bytes>,
    repeat_profiles: Vec<Bytes>,
    repeat_inferences: Vec<Bytes>,
}

/// Normalized data ready for evaluation.
struct Collected {
    table: MeasurementTable,
    raw_files: Vec<(String, Vec<u8>)>,
}

/// Executes a run to a terminal state. Returns the final state.
///
/// The caller holds the workspace lock; acquiring it was the
/// `queued -> preparing` edge's precondition.
pub fn execute_run(
    deps: &WorkerDeps,
    workspace_id: WorkspaceId,
    run_id: RunId,
    cancel: &AtomicBool,
) -> RunState {
    match drive(deps, workspace_id, run_id, cancel) {
        Ok(state) => state,
        Err(failure) => {
            warn!(
                run_id = %run_id,
                code = %failure.code,
                detail = %failure.detail,
                "run failed"
            );
            let result = deps.db.transition_run(
                workspace_id,
                run_id,
                RunState::Error,
                RunUpdates {
                    error_code: Some(failure.code),
                    error_detail: Some(failure.detail),
                    ..RunUpdates::default()
                },
            );
            if let Err(e) = result {
                warn!(run_id = %run_id, error = %e, "failed to record run error");
            }
            RunState::Error
        }
    }
}

#[allow(clippy::too_many_lines)]
fn drive(
    deps: &WorkerDeps,
    workspace_id: WorkspaceId,
    run_id: RunId,
    cancel: &AtomicBool,
) -> Result<RunState, RunFailure> {
    let mut run = deps.db.get_run(workspace_id, run_id)?;
    let mut ctx: Option<RunContext> = None;
    let mut jobs: Option<Vec<DeviceJobs>> = None;
    let mut payloads: Option<Vec<DevicePayloads>> = None;
    let mut collected: Option<Collected> = None;
    let mut evaluation: Option<(GatesEvaluation, Vec<NormalizedMetricRow>)> = None;

    loop {
        check_cancelled(cancel)?;

        match run.state {
            RunState::Queued => {
                run = transition(deps, &run, RunState::Preparing, RunUpdates::default())?;
            }
            RunState::Preparing => {
                ensure_ctx(deps, &run, &mut ctx)?;
                run = transition(deps, &run, RunState::Submitting, RunUpdates::default())?;
            }
            RunState::Submitting => {
                ensure_ctx(deps, &run, &mut ctx)?;
                ensure_jobs(deps, ctx.as_ref().expect("ctx ensured"), cancel, &mut jobs)?;
                run = transition(deps, &run, RunState::Running, RunUpdates::default())?;
            }
            RunState::Running => {
                ensure_ctx(deps, &run, &mut ctx)?;
                ensure_jobs(deps, ctx.as_ref().expect("ctx ensured"), cancel, &mut jobs)?;
                ensure_payloads(
                    deps,
                    ctx.as_ref().expect("ctx ensured"),
                    jobs.as_ref().expect("jobs ensured"),
                    cancel,
                    &mut payloads,
                )?;
                run = transition(deps, &run, RunState::Collecting, RunUpdates::default())?;
            }
            RunState::Collecting => {
                ensure_collected(
                    deps,
                    &run,
                    cancel,
                    &mut ctx,
                    &mut jobs,
                    &mut payloads,
                    &mut collected,
                )?;
                run = transition(deps, &run, RunState::Evaluating, RunUpdates::default())?;
            }
            RunState::Evaluating => {
                ensure_collected(
                    deps,
                    &run,
                    cancel,
                    &mut ctx,
                    &mut jobs,
                    &mut payloads,
                    &mut collected,
                )?;
                let context = ctx.as_ref().expect("ctx ensured");
                let data = collected.as_ref().expect("collected ensured");
                let (eval, rows) = evaluate(context, data);
                let updates = RunUpdates {
                    normalized_metrics: Some(
                        serde_json::to_value(&rows).unwrap_or(serde_json::Value::Null),
                    ),
                    gates_eval: Some(
                        serde_json::to_value(&eval).unwrap_or(serde_json::Value::Null),
                    ),
                    ..RunUpdates::default()
                };
                evaluation = Some((eval, rows));
                run = transition(deps, &run, RunState::Reporting, updates)?;
            }
            RunState::Reporting => {
                ensure_collected(
                    deps,
                    &run,
                    cancel,
                    &mut ctx,
                    &mut jobs,
                    &mut payloads,
                    &mut collected,
                )?;
                let context = ctx.as_ref().expect("ctx ensured");
                let data = collected.as_ref().expect("collected ensured");
                if evaluation.is_none() {
                    // Resumed directly into reporting: evaluation is a
                    // pure function of the collected data, re-run it.
                    evaluation = Some(evaluate(context, data));
                }
                let (eval, rows) = evaluation.as_ref().expect("evaluation ensured");
                return finish(deps, &run, context, data, eval, rows);
            }
            terminal @ (RunState::Passed | RunState::Failed | RunState::Error) => {
                return Ok(terminal);
            }
        }
    }
}

/// Rebuilds everything up to and including collection. Each `ensure_*`
/// is a no-op when its stage already ran in this process; after a crash
/// the chain re-runs the earlier stages (fresh backend jobs included),
/// which is the idempotent-next-step recovery the state machine promises.
#[allow(clippy::too_many_arguments)]
fn ensure_collected(
    deps: &WorkerDeps,
    run: &RunRow,
    cancel: &AtomicBool,
    ctx: &mut Option<RunContext>,
    jobs: &mut Option<Vec<DeviceJobs>>,
    payloads: &mut Option<Vec<DevicePayloads>>,
    collected: &mut Option<Collected>,
) -> Result<(), RunFailure> {
    if collected.is_some() {
        return Ok(());
    }
    ensure_ctx(deps, run, ctx)?;
    let context = ctx.as_ref().expect("ctx ensured");
    ensure_jobs(deps, context, cancel, jobs)?;
    ensure_payloads(deps, context, jobs.as_ref().expect("jobs ensured"), cancel, payloads)?;
    *collected = Some(collect(
        deps,
        run,
        context,
        payloads.as_ref().expect("payloads ensured"),
    )?);
    Ok(())
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), RunFailure> {
    if cancel.load(Ordering::Relaxed) {
        return Err(RunFailure::new(ErrorCode::Cancelled, "run cancelled"));
    }
    Ok(())
}

fn transition(
    deps: &WorkerDeps,
    run: &RunRow,
    to: RunState,
    updates: RunUpdates,
) -> Result<RunRow, RunFailure> {
    Ok(deps
        .db
        .transition_run(run.workspace_id, run.id, to, updates)?)
}

// ----------------------------------------------------------------------
// Prepare
// ----------------------------------------------------------------------

fn ensure_ctx(
    deps: &WorkerDeps,
    run: &RunRow,
    ctx: &mut Option<RunContext>,
) -> Result<(), RunFailure> {
    if ctx.is_some() {
        return Ok(());
    }
    *ctx = Some(prepare(deps, run)?);
    Ok(())
}

fn prepare(deps: &WorkerDeps, run: &RunRow) -> Result<RunContext, RunFailure> {
    let pipeline = deps.db.get_pipeline(run.workspace_id, run.pipeline_id)?;
    pipeline
        .validate()
        .map_err(|e| RunFailure::new(ErrorCode::LimitExceeded, e.to_string()))?;

    let promptpack = deps
        .db
        .get_promptpack(
            run.workspace_id,
            &pipeline.promptpack_ref.logical_id,
            &pipeline.promptpack_ref.version,
        )
        .map_err(|e| match e {
            DbError::NotFound => RunFailure::new(
                ErrorCode::DependencyNotPublished,
                format!(
                    "promptpack {}@{} not found",
                    pipeline.promptpack_ref.logical_id, pipeline.promptpack_ref.version
                ),
            ),
            other => other.into(),
        })?;
    if !promptpack.published {
        return Err(RunFailure::new(
            ErrorCode::DependencyNotPublished,
            format!(
                "promptpack {}@{} is not published",
                promptpack.logical_id, promptpack.version
            ),
        ));
    }
    let promptpack_sha = promptpack.sha256.clone();

    // Model artifact and packaging shape.
    let model = deps.artifacts.stat(run.workspace_id, run.model_artifact_id)?;
    let model_bytes = deps.artifacts.get(run.workspace_id, run.model_artifact_id)?;
    let (entries, container_dir, onnx_bytes, encodings) =
        package_entries(&model.original_filename, &model_bytes);
    package::validate(
        &entries,
        container_dir.as_deref(),
        onnx_bytes.as_deref(),
        encodings.as_deref(),
    )
    .map_err(|e| RunFailure::new(ErrorCode::InvalidModelPackage, e.to_string()))?;

    // Metric mapping snapshot. A workspace that was never probed gets an
    // empty mapping; every metric then reads as unavailable.
    let (mapping, mapping_bytes, mapping_ref, capabilities_bytes, capabilities_ref) =
        match deps.db.get_capabilities(run.workspace_id) {
            Ok(record) => {
                let mapping_bytes = deps
                    .artifacts
                    .get(run.workspace_id, record.metric_mapping_blob_id)?;
                let mapping: MetricMapping = serde_json::from_slice(&mapping_bytes)
                    .map_err(|e| {
                        RunFailure::new(
                            ErrorCode::IntegrityError,
                            format!("metric mapping blob: {e}"),
                        )
                    })?;
                let capabilities_bytes = deps
                    .artifacts
                    .get(run.workspace_id, record.capabilities_blob_id)
                    .ok();
                (
                    mapping,
                    Some(mapping_bytes),
                    Some(record.metric_mapping_blob_id),
                    capabilities_bytes,
                    Some(record.capabilities_blob_id),
                )
            }
            Err(DbError::NotFound) => (
                MetricMapping {
                    workspace_id: run.workspace_id,
                    generated_at: chrono::Utc::now(),
                    derived_from_artifacts: vec![],
                    metrics: std::collections::BTreeMap::new(),
                },
                None,
                None,
                None,
                None,
            ),
            Err(other) => return Err(other.into()),
        };

    // Decrypt the backend token; plaintext lives in this frame only.
    let integration = deps
        .db
        .get_active_integration(run.workspace_id)
        .map_err(|e| match e {
            DbError::NotFound => RunFailure::new(
                ErrorCode::NoIntegration,
                "workspace has no active backend integration",
            ),
            other => other.into(),
        })?;
    let token_bytes = deps
        .masters
        .open(&integration.sealed_token)
        .map_err(|e| RunFailure::new(ErrorCode::TokenInvalid, e.to_string()))?;
    let token = BackendToken::from_bytes(&token_bytes)
        .map_err(|_| RunFailure::new(ErrorCode::TokenInvalid, "token is not valid UTF-8"))?;
    let backend = (deps.backend_factory)(&token);

    // Materialize the job spec; from here the run is a function of this
    // document and the backend.
    let job_spec = json!({
        "version": "1.0",
        "run_id": run.id,
        "workspace_id": run.workspace_id,
        "pipeline": &pipeline,
        "promptpack": {
            "logical_id": &promptpack.logical_id,
            "version": &promptpack.version,
            "sha256": &promptpack_sha,
        },
        "model": { "artifact_id": model.id, "sha256": &model.sha256 },
        "metric_mapping": &mapping,
    });
    deps.artifacts.put(
        run.workspace_id,
        ArtifactKind::JobSpec,
        &format!("job_spec_{}.json", run.id),
        &serde_json::to_vec(&job_spec).unwrap_or_default(),
    )?;

    let budget = deps.timeout_override.unwrap_or_else(|| {
        Duration::from_secs(u64::from(pipeline.run_policy.timeout_minutes) * 60)
    });
    let deadline = Instant::now() + budget;

    info!(run_id = %run.id, pipeline = %pipeline.name, "run prepared");
    Ok(RunContext {
        pipeline,
        promptpack,
        promptpack_sha,
        model,
        model_bytes,
        mapping,
        mapping_bytes,
        mapping_ref,
        capabilities_bytes,
        capabilities_ref,
        backend,
        deadline,
    })
}

/// Derives the package listing from the stored model blob. Zip-packaged
/// models (external-data and AIMET shapes) are inspected through the
/// bundle zip reader; single files stand for themselves.
fn package_entries(
    filename: &str,
    bytes: &[u8],
) -> (
    Vec<PackageEntry>,
    Option<String>,
    Option<Vec<u8>>,
    Option<Vec<u8>>,
) {
    if filename.ends_with(".zip") {
        if let Ok(inner) = edgegate_core::bundle::read_zip(bytes) {
            let entries = inner
                .iter()
                .map(|(name, data)| PackageEntry::new(name.clone(), data.len() as u64))
                .collect();
            let onnx = inner
                .iter()
                .find(|(name, _)| name.ends_with(".onnx"))
                .map(|(_, data)| data.clone());
            let encodings = inner
                .iter()
                .find(|(name, _)| name.ends_with(".encodings"))
                .map(|(_, data)| data.clone());
            let stem = filename.trim_end_matches(".zip").to_string();
            return (entries, Some(stem), onnx, encodings);
        }
    }
    let onnx = filename.ends_with(".onnx").then(|| bytes.to_vec());
    (
        vec![PackageEntry::new(filename, bytes.len() as u64)],
        None,
        onnx,
        None,
    )
}

// ----------------------------------------------------------------------
// Submit
// ----------------------------------------------------------------------

fn ensure_jobs(
    deps: &WorkerDeps,
    ctx: &RunContext,
    cancel: &AtomicBool,
    jobs: &mut Option<Vec<DeviceJobs>>,
) -> Result<(), RunFailure> {
    if jobs.is_some() {
        return Ok(());
    }
    *jobs = Some(submit_all(deps, ctx, cancel)?);
    Ok(())
}

fn submit_all(
    deps: &WorkerDeps,
    ctx: &RunContext,
    cancel: &AtomicBool,
) -> Result<Vec<DeviceJobs>, RunFailure> {
    let backend = ctx.backend.as_ref();

    backend.validate_token().map_err(|e| match e {
        BackendError::TokenRejected => {
            RunFailure::new(ErrorCode::TokenInvalid, "backend rejected credentials")
        }
        other => RunFailure::new(ErrorCode::SubmitFailed, other.to_string()),
    })?;

    let kind = detect_kind(&ctx.model.original_filename);
    let model_handle = submit_with_retry(|| {
        backend.upload_model(&ctx.model_bytes, kind, &ctx.model.original_filename)
    })?;

    let policy = ctx.pipeline.run_policy;
    let needs_outputs = ctx
        .promptpack
        .content
        .cases
        .iter()
        .any(|case| case.expectation.scored());

    let mut out = Vec::new();
    for device_ref in &ctx.pipeline.device_matrix {
        check_cancelled(cancel)?;
        check_deadline(ctx.deadline)?;

        let device = Device {
            device_id: device_ref.device_id.clone(),
            device_name: device_ref.device_name.clone(),
            chipset: String::new(),
        };

        let compile = submit_with_retry(|| {
            backend.submit_compile(&model_handle, &device, TargetRuntime::QnnDlc)
        })?;
        let _compile_payload =
            poll_to_terminal(backend, &compile, ctx.deadline, cancel, deps.poll)?;

        let mut warmup_profiles = Vec::new();
        for _ in 0..policy.warmup_runs {
            warmup_profiles.push(submit_with_retry(|| {
                backend.submit_profile(&compile, &device)
            })?);
        }
        let mut repeat_profiles = Vec::new();
        for _ in 0..policy.measurement_repeats {
            repeat_profiles.push(submit_with_retry(|| {
                backend.submit_profile(&compile, &device)
            })?);
        }

        let mut repeat_inferences = Vec::new();
        if needs_outputs {
            let inputs = inference_inputs(&ctx.promptpack.content, policy.max_new_tokens);
            for _ in 0..policy.measurement_repeats {
                repeat_inferences.push(submit_with_retry(|| {
                    backend.submit_inference(&compile, &device, &inputs)
                })?);
            }
        }

        out.push(DeviceJobs {
            device,
            warmup_profiles,
            repeat_profiles,
            repeat_inferences,
        });
    }
    Ok(out)
}

fn detect_kind(filename: &str) -> PackageKind {
    let lower = filename.to_lowercase();
    if lower.contains(".aimet") {
        PackageKind::AimetQuant
    } else if lower.ends_with(".zip") {
        PackageKind::OnnxExternal
    } else {
        PackageKind::OnnxSingle
    }
}

fn inference_inputs(content: &PromptPackContent, max_new_tokens: u32) -> serde_json::Value {
    json!({
        "max_new_tokens": max_new_tokens,
        "cases": content
            .cases
            .iter()
            .map(|case| json!({
                "id": &case.id,
                "prompt": &case.prompt,
                "max_new_tokens": case.max_new_tokens,
            }))
            .collect::<Vec<_>>(),
    })
}

/// One retry on transport failure, then `SUBMIT_FAILED`.
fn submit_with_retry<T>(
    mut submit: impl FnMut() -> Result<T, BackendError>,
) -> Result<T, RunFailure> {
    match submit() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(error = %first, "submit failed, retrying once");
            submit().map_err(|second| {
                RunFailure::new(
                    ErrorCode::SubmitFailed,
                    format!("submit failed after retry: {second}"),
                )
            })
        }
    }
}

// ----------------------------------------------------------------------
// Poll
// ----------------------------------------------------------------------

fn ensure_payloads(
    deps: &WorkerDeps,
    ctx: &RunContext,
    jobs: &[DeviceJobs],
    cancel: &AtomicBool,
    payloads: &mut Option<Vec<DevicePayloads>>,
) -> Result<(), RunFailure> {
    if payloads.is_some() {
        return Ok(());
    }

    let backend = ctx.backend.as_ref();
    let mut out = Vec::new();
    for device_jobs in jobs {
        let mut collect_all = |handles: &[JobHandle]| -> Result<Vec<Bytes>, RunFailure> {
            handles
                .iter()
                .map(|job| poll_to_terminal(backend, job, ctx.deadline, cancel, deps.poll))
                .collect()
        };
        out.push(DevicePayloads {
            device: device_jobs.device.clone(),
            warmup_profiles: collect_all(&device_jobs.warmup_profiles)?,
            repeat_profiles: collect_all(&device_jobs.repeat_profiles)?,
            repeat_inferences: collect_all(&device_jobs.repeat_inferences)?,
        });
    }
    *payloads = Some(out);
    Ok(())
}

fn check_deadline(deadline: Instant) -> Result<(), RunFailure> {
    if Instant::now() > deadline {
        return Err(RunFailure::new(ErrorCode::Timeout, "run deadline exceeded"));
    }
    Ok(())
}

fn poll_to_terminal(
    backend: &dyn Backend,
    job: &JobHandle,
    deadline: Instant,
    cancel: &AtomicBool,
    poll: PollPolicy,
) -> Result<Bytes, RunFailure> {
    let mut delay = poll.base;
    loop {
        check_cancelled(cancel)?;
        check_deadline(deadline)?;

        match backend.poll(job) {
            Ok(JobStatus::Succeeded { payload }) => return Ok(payload),
            Ok(JobStatus::Failed { reason }) => {
                return Err(RunFailure::new(ErrorCode::BackendJobFailed, reason));
            }
            Ok(JobStatus::Pending | JobStatus::Running) => {}
            // Transient poll failures retry until the deadline.
            Err(e) => warn!(job = %job.0, error = %e, "poll failed, will retry"),
        }

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        delay = (delay * poll.factor).min(poll.cap);
    }
}

// ----------------------------------------------------------------------
// Collect
// ----------------------------------------------------------------------

fn collect(
    deps: &WorkerDeps,
    run: &RunRow,
    ctx: &RunContext,
    payloads: &[DevicePayloads],
) -> Result<Collected, RunFailure> {
    let mut table = MeasurementTable::new();
    let mut correctness = CorrectnessTable::new();
    let mut raw_files = Vec::new();

    let mapped_metrics: Vec<&String> = ctx
        .mapping
        .metrics
        .iter()
        .filter(|(_, entry)| entry.json_path.is_some())
        .map(|(name, _)| name)
        .collect();

    for device_payloads in payloads {
        let device = &device_payloads.device.device_name;
        let device_id = &device_payloads.device.device_id;

        for (i, payload) in device_payloads.warmup_profiles.iter().enumerate() {
            let name = format!("profile_{device_id}_warmup{i}.json");
            store_raw(deps, run, &name, payload, &mut raw_files)?;
            if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(payload) {
                for metric in &mapped_metrics {
                    if let Some(value) = ctx.mapping.extract(metric, &parsed) {
                        table.insert_warmup(device, metric, value);
                    }
                }
            }
        }

        for (i, payload) in device_payloads.repeat_profiles.iter().enumerate() {
            let name = format!("profile_{device_id}_r{i}.json");
            store_raw(deps, run, &name, payload, &mut raw_files)?;
            if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(payload) {
                for metric in &mapped_metrics {
                    if let Some(value) = ctx.mapping.extract(metric, &parsed) {
                        table.insert(
                            device,
                            metric,
                            u32::try_from(i).unwrap_or(u32::MAX),
                            value,
                        );
                    }
                }
            }
        }

        for (i, payload) in device_payloads.repeat_inferences.iter().enumerate() {
            let name = format!("inference_{device_id}_r{i}.json");
            store_raw(deps, run, &name, payload, &mut raw_files)?;
            score_outputs(&ctx.promptpack.content, device, payload, &mut correctness);
        }

        if let Some(aggregate) = correctness.aggregate(device) {
            table.insert(device, CORRECTNESS_METRIC, 0, aggregate);
        }
    }

    Ok(Collected { table, raw_files })
}

fn store_raw(
    deps: &WorkerDeps,
    run: &RunRow,
    name: &str,
    payload: &Bytes,
    raw_files: &mut Vec<(String, Vec<u8>)>,
) -> Result<(), RunFailure> {
    deps.artifacts.put(
        run.workspace_id,
        ArtifactKind::RawResult,
        &format!("run-{}-{name}", run.id),
        payload,
    )?;
    raw_files.push((name.to_string(), payload.to_vec()));
    Ok(())
}

/// Scores one inference payload's outputs against the promptpack. The
/// payload convention is `{"outputs": [{"text": ...} | string, ...]}` in
/// case order; anything else scores the affected cases as failures.
fn score_outputs(
    content: &PromptPackContent,
    device: &str,
    payload: &Bytes,
    correctness: &mut CorrectnessTable,
) {
    let outputs: Vec<String> = serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| {
            v.get("outputs").and_then(|outputs| {
                outputs.as_array().map(|arr| {
                    arr.iter()
                        .map(|item| {
                            item.as_str()
                                .map(String::from)
                                .or_else(|| {
                                    item.get("text")
                                        .and_then(|t| t.as_str())
                                        .map(String::from)
                                })
                                .unwrap_or_default()
                        })
                        .collect()
                })
            })
        })
        .unwrap_or_default();

    for (i, case) in content.cases.iter().enumerate() {
        if !case.expectation.scored() {
            continue;
        }
        let output = outputs.get(i).map_or("", String::as_str);
        correctness.record(device, &case.id, case.expectation.score(output));
    }
}

// ----------------------------------------------------------------------
// Evaluate and report
// ----------------------------------------------------------------------

fn evaluate(ctx: &RunContext, data: &Collected) -> (GatesEvaluation, Vec<NormalizedMetricRow>) {
    let device_order = ctx.pipeline.device_names();
    let eval = gating::evaluate(&data.table, &ctx.mapping, &ctx.pipeline.gates, &device_order);

    let mut rows = Vec::new();
    for device in data.table.devices() {
        for metric in data.table.metrics_for(device) {
            let values = data.table.values(device, metric);
            if values.is_empty() {
                continue;
            }
            rows.push(NormalizedMetricRow {
                device: device.to_string(),
                metric: metric.to_string(),
                median: gating::median_of(&values),
                repeats: values,
            });
        }
    }
    (eval, rows)
}

fn finish(
    deps: &WorkerDeps,
    run: &RunRow,
    ctx: &RunContext,
    data: &Collected,
    eval: &GatesEvaluation,
    rows: &[NormalizedMetricRow],
) -> Result<RunState, RunFailure> {
    let (status, final_state, error) = match eval.outcome {
        Outcome::Passed => ("passed", RunState::Passed, None),
        Outcome::Failed => ("failed", RunState::Failed, None),
        Outcome::Error(code) => ("error", RunState::Error, Some(code)),
    };

    let summary = BundleSummary {
        bundle_version: edgegate_core::bundle::BUNDLE_VERSION.to_string(),
        workspace_id: run.workspace_id,
        pipeline_id: run.pipeline_id,
        run_id: run.id,
        created_at: chrono::Utc::now().to_rfc3339(),
        inputs: SummaryInputs {
            model: ModelInput {
                artifact_id: ctx.model.id,
                sha256: ctx.model.sha256.clone(),
            },
            promptpack: PromptPackInput {
                promptpack_id: ctx.promptpack.logical_id.clone(),
                version: ctx.promptpack.version.clone(),
                sha256: ctx.promptpack_sha.clone(),
            },
            devices: ctx
                .pipeline
                .device_matrix
                .iter()
                .map(|d| DeviceInput {
                    device_id: d.device_id.clone(),
                    device_name: d.device_name.clone(),
                })
                .collect(),
        },
        capabilities_ref: ctx.capabilities_ref,
        metric_mapping_ref: ctx.mapping_ref,
        results: SummaryResults {
            status: status.to_string(),
            normalized_metrics: rows.to_vec(),
            gates_evaluation: eval.clone(),
        },
        artifacts: vec![],
        signing: SigningBlock {
            algo: String::new(),
            public_key_id: String::new(),
        },
    };

    let contents = BundleContents {
        raw: data.raw_files.clone(),
        metric_mapping: ctx.mapping_bytes.clone(),
        capabilities: ctx.capabilities_bytes.clone(),
    };

    let built = build_bundle(summary, &contents, &deps.signer)
        .map_err(|e| RunFailure::new(ErrorCode::BundleFailed, e.to_string()))?;

    let bundle_artifact = deps
        .artifacts
        .put(
            run.workspace_id,
            ArtifactKind::Bundle,
            &format!("evidence-{}.zip", run.id),
            &built.zip,
        )
        .map_err(|e| RunFailure::new(ErrorCode::BundleFailed, e.to_string()))?;

    let error_detail = error.map(|code| {
        eval.gates
            .iter()
            .rev()
            .find_map(|g| g.reason.clone())
            .unwrap_or_else(|| code.as_str().to_string())
    });
    let final_row = deps.db.transition_run(
        run.workspace_id,
        run.id,
        final_state,
        RunUpdates {
            bundle_artifact_id: Some(bundle_artifact.id),
            error_code: error,
            error_detail,
            ..RunUpdates::default()
        },
    )?;

    info!(
        run_id = %run.id,
        state = %final_row.state,
        bundle = %bundle_artifact.id,
        "run complete"
    );
    Ok(final_row.state)
}
