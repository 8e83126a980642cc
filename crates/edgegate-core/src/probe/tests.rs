use serde_json::json;

use super::*;
use crate::backend::{JobKind, MockBackend, ScriptedJob};
use crate::cas::MemoryStore;
use crate::metrics::MappingStability;

fn fast_config() -> ProbeConfig {
    ProbeConfig {
        poll_budget: 10,
        poll_interval: Duration::ZERO,
    }
}

fn profile_payload() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "execution_summary": {
            "estimated_inference_time_ms": 13.1,
            "peak_memory_mb": 42.0
        },
        "compute_unit_breakdown": {"npu": 92.0, "gpu": 5.0, "cpu": 3.0}
    }))
    .unwrap()
}

#[test]
fn test_full_probe_happy_path() {
    let store = MemoryStore::new();
    let ws = WorkspaceId::generate();
    let backend = MockBackend::single_device();
    for _ in 0..3 {
        backend.script(
            JobKind::Profile,
            ScriptedJob::immediate_success(profile_payload()),
        );
    }

    let suite = ProbeSuite::new(&store, ws).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);
    let caps = &outcome.capabilities.capabilities;

    for id in [
        "TOKEN_VALIDATION",
        "DEVICE_LIST",
        "TARGET_QNN_DLC",
        "MODEL_ONNX_EXTERNAL_DATA",
        "MODEL_AIMET_ONNX_ENCODINGS",
        "PROFILE_METRICS",
        "INFERENCE_OUTPUTS",
        "JOB_LOGS",
    ] {
        let record = caps.get(id).unwrap_or_else(|| panic!("missing {id}"));
        assert!(record.available, "{id} should be available");
    }

    // Every available claim except the aggregate ones carries evidence.
    assert!(caps["TOKEN_VALIDATION"].evidence_artifact_id.is_some());
    assert!(caps["PROFILE_METRICS"].evidence_artifact_id.is_some());

    // Three fixtures profiled on one device: three payloads, all
    // concordant, so the mapping has stable entries.
    assert_eq!(outcome.profile_payload_ids.len(), 3);
    assert_eq!(
        outcome.metric_mapping.entry("peak_ram_mb").stability,
        MappingStability::Stable
    );
    // LLM metrics are absent from the fixture payloads and stay null.
    assert!(outcome.metric_mapping.entry("ttft_ms").json_path.is_none());
}

#[test]
fn test_every_capability_id_always_reported() {
    let store = MemoryStore::new();
    let backend = MockBackend::single_device();
    backend.invalidate_token();

    let suite = ProbeSuite::new(&store, WorkspaceId::generate()).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);

    for id in CAPABILITY_IDS {
        assert!(
            outcome.capabilities.capabilities.contains_key(*id),
            "missing {id}"
        );
    }
}

#[test]
fn test_invalid_token_fails_soft() {
    let store = MemoryStore::new();
    let backend = MockBackend::single_device();
    backend.invalidate_token();

    let suite = ProbeSuite::new(&store, WorkspaceId::generate()).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);
    let caps = &outcome.capabilities.capabilities;

    assert!(!caps["TOKEN_VALIDATION"].available);
    assert!(caps["TOKEN_VALIDATION"].detail.is_some());
    // Nothing downstream ran.
    assert!(!caps["DEVICE_LIST"].available);
    assert!(!caps["PROFILE_METRICS"].available);
    assert!(outcome.profile_payload_ids.is_empty());
    // And nothing is stable in the mapping.
    for metric in crate::metrics::CANDIDATE_METRICS {
        assert_ne!(
            outcome.metric_mapping.entry(metric).stability,
            MappingStability::Stable
        );
    }
}

#[test]
fn test_compile_failure_marks_capability_unavailable() {
    let store = MemoryStore::new();
    let backend = MockBackend::single_device();
    // First fixture's compile fails; the others succeed.
    backend.script(JobKind::Compile, ScriptedJob::failure("unsupported ops"));

    let suite = ProbeSuite::new(&store, WorkspaceId::generate()).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);
    let caps = &outcome.capabilities.capabilities;

    // The single-ONNX fixture failed, but a later fixture still proved the
    // target works.
    assert!(caps["TARGET_QNN_DLC"].available);
    assert!(caps["MODEL_ONNX_EXTERNAL_DATA"].available);
}

#[test]
fn test_hung_job_respects_poll_budget() {
    let store = MemoryStore::new();
    let backend = MockBackend::single_device();
    for _ in 0..3 {
        backend.script(JobKind::Compile, ScriptedJob::hung());
    }

    let suite = ProbeSuite::new(&store, WorkspaceId::generate()).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);
    let caps = &outcome.capabilities.capabilities;

    assert!(!caps["TARGET_QNN_DLC"].available);
    assert!(caps["MODEL_ONNX_EXTERNAL_DATA"]
        .detail
        .as_deref()
        .unwrap()
        .contains("poll budget"));
}

#[test]
fn test_logs_unavailable_recorded() {
    let store = MemoryStore::new();
    let backend = MockBackend::single_device();
    backend.drop_logs();

    let suite = ProbeSuite::new(&store, WorkspaceId::generate()).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);
    let record = &outcome.capabilities.capabilities["JOB_LOGS"];
    assert!(!record.available);
    assert!(record.detail.is_some());
}

#[test]
fn test_previous_payloads_enable_stability_across_runs() {
    let store = MemoryStore::new();
    let ws = WorkspaceId::generate();

    // First probe run: one profile payload (only the first fixture's
    // profile succeeds; the others fail).
    let backend = MockBackend::single_device();
    backend.script(
        JobKind::Profile,
        ScriptedJob::immediate_success(profile_payload()),
    );
    backend.script(JobKind::Profile, ScriptedJob::failure("device busy"));
    backend.script(JobKind::Profile, ScriptedJob::failure("device busy"));

    let suite = ProbeSuite::new(&store, ws).with_config(fast_config());
    let first = suite.run(&backend, &builtin_fixtures(), &[]);
    assert_eq!(first.profile_payload_ids.len(), 1);
    assert_eq!(
        first.metric_mapping.entry("peak_ram_mb").stability,
        MappingStability::Unstable
    );

    // Second run feeds the first run's payloads in; concordance across
    // runs promotes the path to stable.
    let previous: Vec<(ArtifactId, serde_json::Value)> = first
        .profile_payload_ids
        .iter()
        .map(|id| {
            let bytes = store.get(ws, *id).unwrap();
            (*id, serde_json::from_slice(&bytes).unwrap())
        })
        .collect();

    let backend2 = MockBackend::single_device();
    backend2.script(
        JobKind::Profile,
        ScriptedJob::immediate_success(profile_payload()),
    );
    backend2.script(JobKind::Profile, ScriptedJob::failure("device busy"));
    backend2.script(JobKind::Profile, ScriptedJob::failure("device busy"));

    let second = suite.run(&backend2, &builtin_fixtures(), &previous);
    let entry = second.metric_mapping.entry("peak_ram_mb");
    assert_eq!(entry.stability, MappingStability::Stable);
    // The mapping records every payload it was derived from.
    assert_eq!(second.metric_mapping.derived_from_artifacts.len(), 2);
}

#[test]
fn test_raw_payloads_stored_in_cas() {
    let store = MemoryStore::new();
    let ws = WorkspaceId::generate();
    let backend = MockBackend::single_device();

    let suite = ProbeSuite::new(&store, ws).with_config(fast_config());
    let outcome = suite.run(&backend, &builtin_fixtures(), &[]);

    for id in &outcome.profile_payload_ids {
        let bytes = store.get(ws, *id).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&bytes).is_ok());
    }
}
