//! Scriptable backend for tests and probe fixtures.
//!
//! Each submitted job consumes a [`ScriptedJob`]: a sequence of statuses
//! returned by successive polls. Submit-level faults can be injected to
//! exercise the worker's one-retry policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use super::{
    Backend, BackendError, Device, Identity, JobHandle, JobKind, JobStatus, RemoteModelHandle,
    TargetRuntime,
};
use crate::package::PackageKind;

/// A scripted job: polls pop statuses front to back; the last status
/// repeats once the script is drained.
#[derive(Debug, Clone)]
pub struct ScriptedJob {
    statuses: Vec<JobStatus>,
}

impl ScriptedJob {
    /// A job that succeeds immediately with the given payload.
    #[must_use]
    pub fn immediate_success(payload: impl Into<Bytes>) -> Self {
        Self {
            statuses: vec![JobStatus::Succeeded {
                payload: payload.into(),
            }],
        }
    }

    /// A job that reports `Running` for `polls` polls, then succeeds.
    #[must_use]
    pub fn success_after(polls: usize, payload: impl Into<Bytes>) -> Self {
        let mut statuses = vec![JobStatus::Running; polls];
        statuses.push(JobStatus::Succeeded {
            payload: payload.into(),
        });
        Self { statuses }
    }

    /// A job that fails terminally with the given reason.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            statuses: vec![JobStatus::Failed {
                reason: reason.into(),
            }],
        }
    }

    /// A job that never leaves `Running`; used for timeout tests.
    #[must_use]
    pub fn hung() -> Self {
        Self {
            statuses: vec![JobStatus::Running],
        }
    }
}

struct JobState {
    script: ScriptedJob,
    polls: usize,
}

struct Inner {
    devices: Vec<Device>,
    token_valid: bool,
    jobs: HashMap<String, JobState>,
    /// Scripts queued per job kind, consumed in submission order.
    scripts: HashMap<JobKind, Vec<ScriptedJob>>,
    /// Remaining submit attempts that fail with a transport error, per kind.
    submit_faults: HashMap<JobKind, usize>,
    logs: Option<Bytes>,
    submitted: Vec<(JobKind, String)>,
}

/// The scriptable mock backend.
pub struct MockBackend {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl MockBackend {
    /// Creates a mock with a valid token and the given devices.
    #[must_use]
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices,
                token_valid: true,
                jobs: HashMap::new(),
                scripts: HashMap::new(),
                submit_faults: HashMap::new(),
                logs: Some(Bytes::from_static(b"[mock] device log")),
                submitted: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// A mock with one device, for simple tests.
    #[must_use]
    pub fn single_device() -> Self {
        Self::new(vec![Device {
            device_id: "dev-s24".to_string(),
            device_name: "Samsung Galaxy S24".to_string(),
            chipset: "snapdragon-8-gen-3".to_string(),
        }])
    }

    /// Makes `validate_token` fail.
    pub fn invalidate_token(&self) {
        self.inner.lock().expect("lock poisoned").token_valid = false;
    }

    /// Queues a script for the next submitted job of `kind`.
    pub fn script(&self, kind: JobKind, job: ScriptedJob) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .scripts
            .entry(kind)
            .or_default()
            .push(job);
    }

    /// Makes the next `count` submits of `kind` fail with a transport
    /// error before any job is created.
    pub fn fail_next_submits(&self, kind: JobKind, count: usize) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .submit_faults
            .insert(kind, count);
    }

    /// Disables log retention.
    pub fn drop_logs(&self) {
        self.inner.lock().expect("lock poisoned").logs = None;
    }

    /// Job handles submitted so far, in order, for assertions.
    #[must_use]
    pub fn submitted(&self) -> Vec<(JobKind, String)> {
        self.inner.lock().expect("lock poisoned").submitted.clone()
    }

    fn submit(&self, kind: JobKind) -> Result<JobHandle, BackendError> {
        let mut inner = self.inner.lock().expect("lock poisoned");

        if let Some(remaining) = inner.submit_faults.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Transport {
                    message: "injected submit failure".to_string(),
                });
            }
        }

        let script = inner
            .scripts
            .get_mut(&kind)
            .and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
            .unwrap_or_else(|| ScriptedJob::immediate_success(default_payload(kind)));

        let id = format!(
            "job-{:?}-{}",
            kind,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
        .to_lowercase();
        inner.jobs.insert(id.clone(), JobState { script, polls: 0 });
        inner.submitted.push((kind, id.clone()));
        Ok(JobHandle(id))
    }
}

/// Default payload shape mirrors the hub's profile document closely enough
/// for mapping-driven extraction in tests.
fn default_payload(kind: JobKind) -> Bytes {
    let json = match kind {
        JobKind::Compile => serde_json::json!({"compiled": true, "target": "qnn_dlc"}),
        JobKind::Profile => serde_json::json!({
            "execution_summary": {
                "estimated_inference_time_ms": 13.1,
                "peak_memory_mb": 42.0
            },
            "compute_unit_breakdown": {"npu": 92.0, "gpu": 5.0, "cpu": 3.0}
        }),
        JobKind::Inference => serde_json::json!({"outputs": [{"text": "ok"}]}),
    };
    Bytes::from(serde_json::to_vec(&json).expect("static json"))
}

impl Backend for MockBackend {
    fn validate_token(&self) -> Result<Identity, BackendError> {
        let inner = self.inner.lock().expect("lock poisoned");
        if inner.token_valid {
            Ok(Identity {
                account_id: "acct-mock".to_string(),
                display_name: Some("Mock Account".to_string()),
            })
        } else {
            Err(BackendError::TokenRejected)
        }
    }

    fn list_devices(&self) -> Result<Vec<Device>, BackendError> {
        Ok(self.inner.lock().expect("lock poisoned").devices.clone())
    }

    fn upload_model(
        &self,
        _bytes: &[u8],
        _kind: PackageKind,
        name: &str,
    ) -> Result<RemoteModelHandle, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(RemoteModelHandle(format!("model-{name}-{id}")))
    }

    fn submit_compile(
        &self,
        _model: &RemoteModelHandle,
        _device: &Device,
        _target: TargetRuntime,
    ) -> Result<JobHandle, BackendError> {
        self.submit(JobKind::Compile)
    }

    fn submit_profile(
        &self,
        _compiled: &JobHandle,
        _device: &Device,
    ) -> Result<JobHandle, BackendError> {
        self.submit(JobKind::Profile)
    }

    fn submit_inference(
        &self,
        _compiled: &JobHandle,
        _device: &Device,
        _inputs: &serde_json::Value,
    ) -> Result<JobHandle, BackendError> {
        self.submit(JobKind::Inference)
    }

    fn poll(&self, job: &JobHandle) -> Result<JobStatus, BackendError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let state = inner
            .jobs
            .get_mut(&job.0)
            .ok_or_else(|| BackendError::UnknownHandle {
                handle: job.0.clone(),
            })?;
        let idx = state.polls.min(state.script.statuses.len() - 1);
        state.polls += 1;
        Ok(state.script.statuses[idx].clone())
    }

    fn fetch_logs(&self, job: &JobHandle) -> Result<Bytes, BackendError> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .logs
            .clone()
            .ok_or_else(|| BackendError::LogsUnavailable { job: job.0.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(mock: &MockBackend) -> Device {
        mock.list_devices().unwrap().remove(0)
    }

    #[test]
    fn test_scripted_status_sequence() {
        let mock = MockBackend::single_device();
        mock.script(
            JobKind::Profile,
            ScriptedJob::success_after(2, &b"{\"x\":1}"[..]),
        );

        let dev = device(&mock);
        let compiled = mock
            .submit_compile(
                &RemoteModelHandle("m".into()),
                &dev,
                TargetRuntime::QnnDlc,
            )
            .unwrap();
        let job = mock.submit_profile(&compiled, &dev).unwrap();

        assert_eq!(mock.poll(&job).unwrap(), JobStatus::Running);
        assert_eq!(mock.poll(&job).unwrap(), JobStatus::Running);
        assert!(matches!(
            mock.poll(&job).unwrap(),
            JobStatus::Succeeded { .. }
        ));
        // Terminal status repeats.
        assert!(matches!(
            mock.poll(&job).unwrap(),
            JobStatus::Succeeded { .. }
        ));
    }

    #[test]
    fn test_submit_fault_injection() {
        let mock = MockBackend::single_device();
        mock.fail_next_submits(JobKind::Compile, 1);
        let dev = device(&mock);
        let model = RemoteModelHandle("m".into());

        assert!(matches!(
            mock.submit_compile(&model, &dev, TargetRuntime::QnnDlc),
            Err(BackendError::Transport { .. })
        ));
        // Second attempt goes through.
        assert!(mock
            .submit_compile(&model, &dev, TargetRuntime::QnnDlc)
            .is_ok());
    }

    #[test]
    fn test_unknown_job_handle() {
        let mock = MockBackend::single_device();
        assert!(matches!(
            mock.poll(&JobHandle("nope".into())),
            Err(BackendError::UnknownHandle { .. })
        ));
    }

    #[test]
    fn test_invalid_token() {
        let mock = MockBackend::single_device();
        mock.invalidate_token();
        assert!(matches!(
            mock.validate_token(),
            Err(BackendError::TokenRejected)
        ));
    }
}
