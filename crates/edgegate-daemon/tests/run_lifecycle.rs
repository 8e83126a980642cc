//! End-to-end run lifecycle tests against the mock hub.

mod common;

use edgegate_core::backend::{JobKind, ScriptedJob};
use edgegate_core::bundle;
use edgegate_core::cas::ArtifactStore;
use edgegate_core::error::ErrorCode;
use edgegate_core::gating::{Gate, GateOp};
use edgegate_daemon::runs::RunState;

use common::{default_gates, Harness, DEVICE_NAME};

#[test]
fn test_happy_path_passes_and_bundle_verifies() {
    let harness = Harness::new();
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );

    let run_id = harness.enqueue_run();
    assert!(harness.dispatcher.dispatch_one());

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Passed);
    assert!(run.error_code.is_none());

    // Normalized metrics carry the medians with warmup excluded.
    let metrics = run.normalized_metrics.unwrap();
    let rows = metrics.as_array().unwrap();
    let ram = rows
        .iter()
        .find(|r| r["metric"] == "peak_ram_mb")
        .expect("peak_ram_mb row");
    assert_eq!(ram["median"].as_f64().unwrap(), 3250.0);
    assert_eq!(ram["repeats"].as_array().unwrap().len(), 3);
    let tps = rows
        .iter()
        .find(|r| r["metric"] == "tokens_per_sec")
        .expect("tokens_per_sec row");
    assert_eq!(tps["median"].as_f64().unwrap(), 18.0);

    // Both gates pass.
    let eval = run.gates_eval.unwrap();
    for gate in eval["gates"].as_array().unwrap() {
        assert_eq!(gate["status"], "pass", "{gate}");
    }

    // The bundle exists, verifies, and names the run.
    let bundle_id = run.bundle_artifact_id.expect("bundle written");
    let zip = harness
        .deps
        .artifacts
        .get(harness.workspace_id, bundle_id)
        .unwrap();
    let key = harness.deps.signer.record("key-v1").unwrap();
    let summary = bundle::verify_bundle(&zip, &key.public_key_hex).unwrap();
    assert_eq!(summary.run_id, run_id);
    assert_eq!(summary.results.status, "passed");
    assert_eq!(summary.signing.public_key_id, "key-v1");
    assert_eq!(summary.inputs.devices[0].device_name, DEVICE_NAME);

    // Audit trail covers the full state sequence.
    let events = harness
        .deps
        .db
        .audit_event_types(harness.workspace_id)
        .unwrap();
    let transitions = events
        .iter()
        .filter(|t| t.as_str() == "run.state_changed")
        .count();
    // queued->preparing ... reporting->passed: 7 transitions.
    assert_eq!(transitions, 7);
}

#[test]
fn test_required_gate_fail_fails_run_with_bundle() {
    let harness = Harness::new();
    // RAM median 3600 > 3500 ceiling.
    harness.script_profiles(
        (3600.0, 17.0),
        [(3550.0, 18.0), (3600.0, 18.5), (3650.0, 17.5)],
    );

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Failed);

    // A failed run exposes the same signed evidence.
    let bundle_id = run.bundle_artifact_id.expect("failed runs still bundle");
    let zip = harness
        .deps
        .artifacts
        .get(harness.workspace_id, bundle_id)
        .unwrap();
    let key = harness.deps.signer.record("key-v1").unwrap();
    let summary = bundle::verify_bundle(&zip, &key.public_key_hex).unwrap();
    assert_eq!(summary.results.status, "failed");
}

#[test]
fn test_missing_required_metric_errors() {
    // Mapping marks peak_ram_mb unavailable; the gate on it is required.
    let harness = Harness::with_gates_and_mapping(default_gates(), &["peak_ram_mb"]);
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::MissingRequiredMetric));
    // The detail names the metric.
    assert!(run.error_detail.unwrap().contains("peak_ram_mb"));
    // Evidence still exists for the errored run.
    assert!(run.bundle_artifact_id.is_some());
}

#[test]
fn test_flaky_required_metric_errors() {
    let gates = vec![Gate {
        metric: "tokens_per_sec".to_string(),
        op: GateOp::Ge,
        threshold: 12.0,
        required: true,
    }];
    let harness = Harness::with_gates_and_mapping(gates, &[]);
    // tps repeats [18, 8, 19]: CV ~0.405, far over the 0.15 throughput
    // threshold.
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 8.0), (3300.0, 19.0)],
    );

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::FlakyMetric));
}

#[test]
fn test_submit_retries_once_then_succeeds() {
    let harness = Harness::new();
    harness.backend.fail_next_submits(JobKind::Compile, 1);
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();
    assert_eq!(harness.run(run_id).state, RunState::Passed);
}

#[test]
fn test_submit_fails_after_second_failure() {
    let harness = Harness::new();
    harness.backend.fail_next_submits(JobKind::Compile, 2);

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::SubmitFailed));
}

#[test]
fn test_backend_job_failure_carries_reason() {
    let harness = Harness::new();
    harness.backend.script(
        JobKind::Compile,
        ScriptedJob::failure("unsupported operator: ScatterND"),
    );

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::BackendJobFailed));
    assert!(run.error_detail.unwrap().contains("ScatterND"));
}

#[test]
fn test_hung_backend_times_out() {
    let mut harness = Harness::new();
    harness.backend.script(JobKind::Compile, ScriptedJob::hung());
    // A millisecond budget: the deadline check trips on the first poll of
    // the hung compile job.
    harness.deps.timeout_override = Some(std::time::Duration::from_millis(1));
    let dispatcher = edgegate_daemon::runs::Dispatcher::new(harness.deps.clone());

    let run_id = harness.enqueue_run();
    std::thread::sleep(std::time::Duration::from_millis(5));
    dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::Timeout));
}

#[test]
fn test_cancellation_of_in_flight_run() {
    let harness = Harness::new();
    let run_id = harness.enqueue_run();

    // Drive the worker directly with the cancel flag already raised; the
    // first cancellation point trips before any backend work.
    let cancel = std::sync::atomic::AtomicBool::new(true);
    let state = edgegate_daemon::runs::execute_run(
        &harness.deps,
        harness.workspace_id,
        run_id,
        &cancel,
    );
    assert_eq!(state, RunState::Error);
    let run = harness.run(run_id);
    assert_eq!(run.error_code, Some(ErrorCode::Cancelled));
}

#[test]
fn test_cancel_before_dispatch() {
    let harness = Harness::new();
    let run_id = harness.enqueue_run();

    harness.dispatcher.cancel_run(harness.workspace_id, run_id);

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::Cancelled));
}

#[test]
fn test_unpublished_promptpack_blocks_run() {
    let harness = Harness::new();
    // Re-point the pipeline at an unpublished version.
    let content = edgegate_core::promptpack::PromptPackContent {
        cases: vec![edgegate_core::promptpack::PromptCase {
            id: "draft".to_string(),
            prompt: "draft case".to_string(),
            max_new_tokens: None,
            expectation: edgegate_core::promptpack::Expectation::None,
        }],
    };
    let sha = content.canonical_sha256().unwrap();
    harness
        .deps
        .db
        .upsert_promptpack(harness.workspace_id, "smoke", "2.0.0", &content, &sha)
        .unwrap();

    let mut pipeline = harness.pipeline.clone();
    pipeline.id = edgegate_core::ids::PipelineId::generate();
    pipeline.name = "draft-gate".to_string();
    pipeline.promptpack_ref.version = "2.0.0".to_string();
    harness.deps.db.create_pipeline(&pipeline).unwrap();

    let run_id = harness
        .deps
        .db
        .create_run(
            harness.workspace_id,
            pipeline.id,
            harness.model_artifact_id,
            edgegate_daemon::db::RunTrigger::Manual,
        )
        .unwrap()
        .id;
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::DependencyNotPublished));
}

#[test]
fn test_no_integration_blocks_run() {
    let harness = Harness::new();
    harness
        .deps
        .db
        .disable_integration(harness.workspace_id)
        .unwrap();

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::NoIntegration));
}

#[test]
fn test_invalid_token_blocks_run() {
    let harness = Harness::new();
    harness.backend.invalidate_token();

    let run_id = harness.enqueue_run();
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.error_code, Some(ErrorCode::TokenInvalid));
}

#[test]
fn test_second_run_queues_until_first_finishes() {
    let harness = Harness::new();
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );

    let first = harness.enqueue_run();
    let second = harness.enqueue_run();

    // One dispatch completes exactly one run; the second stays queued.
    assert!(harness.dispatcher.dispatch_one());
    assert_eq!(harness.run(first).state, RunState::Passed);
    assert_eq!(harness.run(second).state, RunState::Queued);

    assert!(harness.dispatcher.dispatch_one());
    assert_eq!(harness.run(second).state, RunState::Passed);
    assert!(!harness.dispatcher.dispatch_one());
}

#[test]
fn test_correctness_gate_from_inference_outputs() {
    use edgegate_core::promptpack::{Expectation, PromptCase, PromptPackContent};

    let gates = vec![Gate {
        metric: "correctness".to_string(),
        op: GateOp::Ge,
        threshold: 0.5,
        required: true,
    }];
    let harness = Harness::with_gates_and_mapping(gates, &[]);

    // Replace the promptpack with scored cases (new version).
    let content = PromptPackContent {
        cases: vec![
            PromptCase {
                id: "exact-hit".to_string(),
                prompt: "Answer PONG.".to_string(),
                max_new_tokens: None,
                expectation: Expectation::Exact {
                    value: "PONG".to_string(),
                },
            },
            PromptCase {
                id: "exact-miss".to_string(),
                prompt: "Answer PING.".to_string(),
                max_new_tokens: None,
                expectation: Expectation::Exact {
                    value: "PING".to_string(),
                },
            },
        ],
    };
    let sha = content.canonical_sha256().unwrap();
    harness
        .deps
        .db
        .upsert_promptpack(harness.workspace_id, "scored", "1.0.0", &content, &sha)
        .unwrap();
    harness
        .deps
        .db
        .publish_promptpack(harness.workspace_id, "scored", "1.0.0")
        .unwrap();

    let mut pipeline = harness.pipeline.clone();
    pipeline.id = edgegate_core::ids::PipelineId::generate();
    pipeline.name = "correctness-gate".to_string();
    pipeline.promptpack_ref.logical_id = "scored".to_string();
    harness.deps.db.create_pipeline(&pipeline).unwrap();

    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );
    // Three inference repeats: first case right, second case wrong, every
    // time. Aggregate correctness = mean(median[1,1,1], median[0,0,0]) = 0.5.
    for _ in 0..3 {
        harness.backend.script(
            JobKind::Inference,
            ScriptedJob::immediate_success(
                serde_json::to_vec(&serde_json::json!({
                    "outputs": [{"text": "PONG"}, {"text": "WRONG"}]
                }))
                .unwrap(),
            ),
        );
    }

    let run_id = harness
        .deps
        .db
        .create_run(
            harness.workspace_id,
            pipeline.id,
            harness.model_artifact_id,
            edgegate_daemon::db::RunTrigger::Manual,
        )
        .unwrap()
        .id;
    harness.dispatcher.dispatch_one();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Passed);

    let metrics = run.normalized_metrics.unwrap();
    let correctness = metrics
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["metric"] == "correctness")
        .expect("correctness row");
    assert!((correctness["median"].as_f64().unwrap() - 0.5).abs() < 1e-9);
}

#[test]
fn test_crash_recovery_resumes_interrupted_run() {
    let harness = Harness::new();
    harness.script_profiles(
        (3400.0, 17.0),
        [(3200.0, 18.0), (3250.0, 18.5), (3300.0, 17.5)],
    );

    let run_id = harness.enqueue_run();
    // Simulate a crash after the first persisted transition: the run sits
    // in `preparing` with no worker attached.
    harness
        .deps
        .db
        .transition_run(
            harness.workspace_id,
            run_id,
            RunState::Preparing,
            edgegate_daemon::db::RunUpdates::default(),
        )
        .unwrap();

    harness.dispatcher.recover_interrupted();

    let run = harness.run(run_id);
    assert_eq!(run.state, RunState::Passed);
    assert!(run.bundle_artifact_id.is_some());
}
