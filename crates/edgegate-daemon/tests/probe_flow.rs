//! Probe execution through the daemon: capability discovery installs a
//! new capabilities record, and the next run uses the derived mapping.

mod common;

use std::time::Duration;

use edgegate_core::cas::ArtifactStore;
use edgegate_core::metrics::{MappingStability, MetricMapping};
use edgegate_core::probe::{ProbeConfig, WorkspaceCapabilities};
use edgegate_daemon::probe_runner::{run_probe, ProbeRunError};

use common::Harness;

fn fast_config() -> ProbeConfig {
    ProbeConfig {
        poll_budget: 20,
        poll_interval: Duration::ZERO,
    }
}

#[test]
fn test_probe_installs_capabilities_record() {
    let harness = Harness::new();

    let row = run_probe(&harness.deps, harness.workspace_id, fast_config()).unwrap();
    assert_eq!(row.workspace_id, harness.workspace_id);

    // The stored documents parse back into their types.
    let caps_bytes = harness
        .deps
        .artifacts
        .get(harness.workspace_id, row.capabilities_blob_id)
        .unwrap();
    let caps: WorkspaceCapabilities = serde_json::from_slice(&caps_bytes).unwrap();
    assert!(caps.capabilities["TOKEN_VALIDATION"].available);
    assert!(caps.capabilities["PROFILE_METRICS"].available);
    assert!(caps.capabilities["PROFILE_METRICS"]
        .evidence_artifact_id
        .is_some());

    let mapping_bytes = harness
        .deps
        .artifacts
        .get(harness.workspace_id, row.metric_mapping_blob_id)
        .unwrap();
    let mapping: MetricMapping = serde_json::from_slice(&mapping_bytes).unwrap();
    // The mock hub's profile document exposes peak memory; three fixture
    // profiles in one run corroborate the path.
    assert_eq!(
        mapping.metrics["peak_ram_mb"].stability,
        MappingStability::Stable
    );
    // Nothing invented: the mock exposes no LLM metrics.
    assert!(mapping.metrics["ttft_ms"].json_path.is_none());

    // The database points at the new record.
    let current = harness
        .deps
        .db
        .get_capabilities(harness.workspace_id)
        .unwrap();
    assert_eq!(current.source_probe_run_id, row.source_probe_run_id);
}

#[test]
fn test_probe_requires_integration() {
    let harness = Harness::new();
    harness
        .deps
        .db
        .disable_integration(harness.workspace_id)
        .unwrap();

    assert!(matches!(
        run_probe(&harness.deps, harness.workspace_id, fast_config()),
        Err(ProbeRunError::NoIntegration)
    ));
}

#[test]
fn test_reprobe_replaces_record() {
    let harness = Harness::new();

    let first = run_probe(&harness.deps, harness.workspace_id, fast_config()).unwrap();
    let second = run_probe(&harness.deps, harness.workspace_id, fast_config()).unwrap();
    assert_ne!(first.source_probe_run_id, second.source_probe_run_id);

    let current = harness
        .deps
        .db
        .get_capabilities(harness.workspace_id)
        .unwrap();
    assert_eq!(current.source_probe_run_id, second.source_probe_run_id);

    // Probing writes an audit event each time.
    let events = harness
        .deps
        .db
        .audit_event_types(harness.workspace_id)
        .unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|t| t.as_str() == "capabilities.probed")
            .count(),
        2
    );
}
