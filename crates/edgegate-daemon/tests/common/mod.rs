//! Shared harness for daemon integration tests.
//!
//! Builds a fully wired daemon core - in-memory database, in-memory
//! artifact store, real envelope and signing keys, mock backend - and
//! seeds one workspace with an integration, a published promptpack, a
//! pipeline, a stable metric mapping, and a model artifact.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;

use edgegate_core::backend::{Backend, MockBackend};
use edgegate_core::cas::{ArtifactKind, ArtifactStore, MemoryStore};
use edgegate_core::envelope::{BackendToken, MasterKey, MasterKeyRing};
use edgegate_core::gating::{Gate, GateOp};
use edgegate_core::ids::{ArtifactId, WorkspaceId};
use edgegate_core::metrics::{MappingStability, MetricMapping, MetricPathEntry};
use edgegate_core::pipeline::{DeviceRef, Pipeline, PromptPackRef, RunPolicy};
use edgegate_core::promptpack::{Expectation, PromptCase, PromptPackContent};
use edgegate_core::signing::SigningKeyManager;

use edgegate_daemon::db::{CapabilitiesRow, Store};
use edgegate_daemon::runs::{Dispatcher, PollPolicy, WorkerDeps};

pub const DEVICE_NAME: &str = "Samsung Galaxy S24";
pub const DEVICE_ID: &str = "dev-s24";

/// A wired test environment.
pub struct Harness {
    pub deps: WorkerDeps,
    pub dispatcher: Dispatcher,
    pub store: MemoryStore,
    pub backend: Arc<MockBackend>,
    pub workspace_id: WorkspaceId,
    pub pipeline: Pipeline,
    pub model_artifact_id: ArtifactId,
}

/// A profile payload in the hub's document shape, carrying the two
/// metrics the default pipeline gates on.
#[must_use]
pub fn profile_payload(peak_ram_mb: f64, tokens_per_sec: f64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "execution_summary": {
            "peak_memory_mb": peak_ram_mb,
            "estimated_inference_time_ms": 13.0
        },
        "llm_metrics": { "tokens_per_second": tokens_per_sec }
    }))
    .unwrap()
}

/// The default gates: required RAM ceiling, optional throughput floor.
#[must_use]
pub fn default_gates() -> Vec<Gate> {
    vec![
        Gate {
            metric: "peak_ram_mb".to_string(),
            op: GateOp::Le,
            threshold: 3500.0,
            required: true,
        },
        Gate {
            metric: "tokens_per_sec".to_string(),
            op: GateOp::Ge,
            threshold: 12.0,
            required: false,
        },
    ]
}

fn master_ring() -> MasterKeyRing {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    MasterKeyRing::new(MasterKey::from_base64("mk-test", &URL_SAFE_NO_PAD.encode(key)).unwrap())
}

fn stable_entry(path: &str, unit: &str) -> MetricPathEntry {
    MetricPathEntry {
        json_path: Some(path.to_string()),
        unit: Some(unit.to_string()),
        stability: MappingStability::Stable,
    }
}

/// Builds a mapping with stable entries for the gated metrics. Pass
/// `unavailable` metric names to null them out instead.
#[must_use]
pub fn mapping_for(workspace_id: WorkspaceId, unavailable: &[&str]) -> MetricMapping {
    let mut metrics = BTreeMap::new();
    metrics.insert(
        "peak_ram_mb".to_string(),
        stable_entry("$.execution_summary.peak_memory_mb", "MB"),
    );
    metrics.insert(
        "tokens_per_sec".to_string(),
        stable_entry("$.llm_metrics.tokens_per_second", "tokens/s"),
    );
    metrics.insert(
        "inference_time_ms".to_string(),
        stable_entry("$.execution_summary.estimated_inference_time_ms", "ms"),
    );
    for name in unavailable {
        metrics.insert((*name).to_string(), MetricPathEntry::unavailable());
    }
    MetricMapping {
        workspace_id,
        generated_at: Utc::now(),
        derived_from_artifacts: vec![ArtifactId::generate(), ArtifactId::generate()],
        metrics,
    }
}

impl Harness {
    /// Builds the default harness: gates on RAM and throughput, a
    /// no-expectation promptpack, a single device, three repeats.
    #[must_use]
    pub fn new() -> Self {
        Self::with_gates_and_mapping(default_gates(), &[])
    }

    /// Harness with custom gates and optional unavailable metrics in the
    /// mapping.
    #[must_use]
    pub fn with_gates_and_mapping(gates: Vec<Gate>, unavailable_metrics: &[&str]) -> Self {
        let db = Store::in_memory().unwrap();
        let store = MemoryStore::new();
        let masters = Arc::new(master_ring());
        let signer = Arc::new(SigningKeyManager::in_memory());
        signer.generate("key-v1").unwrap();

        let workspace = db.create_workspace("test-workspace").unwrap();
        let workspace_id = workspace.id;

        // Integration: a sealed hub token.
        let sealed = masters.seal(b"qai_test_token_abcd").unwrap();
        db.upsert_integration(workspace_id, "qaihub", &sealed, "abcd")
            .unwrap();

        // Published promptpack with latency-only cases.
        let content = PromptPackContent {
            cases: vec![PromptCase {
                id: "latency-probe".to_string(),
                prompt: "Summarize this in one word.".to_string(),
                max_new_tokens: None,
                expectation: Expectation::None,
            }],
        };
        let sha = content.canonical_sha256().unwrap();
        db.upsert_promptpack(workspace_id, "smoke", "1.0.0", &content, &sha)
            .unwrap();
        db.publish_promptpack(workspace_id, "smoke", "1.0.0").unwrap();

        // Pipeline.
        let pipeline = Pipeline {
            id: edgegate_core::ids::PipelineId::generate(),
            workspace_id,
            name: "nightly-gate".to_string(),
            device_matrix: vec![DeviceRef {
                device_id: DEVICE_ID.to_string(),
                device_name: DEVICE_NAME.to_string(),
            }],
            promptpack_ref: PromptPackRef {
                logical_id: "smoke".to_string(),
                version: "1.0.0".to_string(),
            },
            gates,
            run_policy: RunPolicy::default(),
        };
        db.create_pipeline(&pipeline).unwrap();

        // Capabilities record with a handcrafted mapping.
        let mapping = mapping_for(workspace_id, unavailable_metrics);
        let mapping_blob = store
            .put(
                workspace_id,
                ArtifactKind::MetricMapping,
                "metric_mapping.json",
                &serde_json::to_vec(&mapping).unwrap(),
            )
            .unwrap();
        let caps_blob = store
            .put(
                workspace_id,
                ArtifactKind::Capabilities,
                "workspace_capabilities.json",
                br#"{"capabilities":{}}"#,
            )
            .unwrap();
        db.set_capabilities(&CapabilitiesRow {
            workspace_id,
            capabilities_blob_id: caps_blob.id,
            metric_mapping_blob_id: mapping_blob.id,
            probed_at: Utc::now(),
            source_probe_run_id: "probe-test".to_string(),
        })
        .unwrap();

        // Model artifact.
        let model = store
            .put(
                workspace_id,
                ArtifactKind::Model,
                "model.onnx",
                b"\x08\x07tiny-onnx-model",
            )
            .unwrap();

        let backend = Arc::new(MockBackend::new(vec![edgegate_core::backend::Device {
            device_id: DEVICE_ID.to_string(),
            device_name: DEVICE_NAME.to_string(),
            chipset: "snapdragon-8-gen-3".to_string(),
        }]));
        let factory_backend = Arc::clone(&backend);
        let backend_factory = Arc::new(move |_token: &BackendToken| -> Arc<dyn Backend> {
            Arc::clone(&factory_backend) as Arc<dyn Backend>
        });

        let deps = WorkerDeps {
            db,
            artifacts: Arc::new(store.clone()),
            masters,
            signer,
            backend_factory,
            poll: PollPolicy::immediate(),
            timeout_override: None,
        };
        let dispatcher = Dispatcher::new(deps.clone());

        Self {
            deps,
            dispatcher,
            store,
            backend,
            workspace_id,
            pipeline,
            model_artifact_id: model.id,
        }
    }

    /// Scripts the four profile jobs of one device pass: one warmup plus
    /// three repeats.
    pub fn script_profiles(&self, warmup: (f64, f64), repeats: [(f64, f64); 3]) {
        use edgegate_core::backend::{JobKind, ScriptedJob};
        self.backend.script(
            JobKind::Profile,
            ScriptedJob::immediate_success(profile_payload(warmup.0, warmup.1)),
        );
        for (ram, tps) in repeats {
            self.backend.script(
                JobKind::Profile,
                ScriptedJob::immediate_success(profile_payload(ram, tps)),
            );
        }
    }

    /// Enqueues a run for the default pipeline and model.
    pub fn enqueue_run(&self) -> edgegate_core::ids::RunId {
        self.deps
            .db
            .create_run(
                self.workspace_id,
                self.pipeline.id,
                self.model_artifact_id,
                edgegate_daemon::db::RunTrigger::Manual,
            )
            .unwrap()
            .id
    }

    /// Fetches a run row.
    #[must_use]
    pub fn run(&self, run_id: edgegate_core::ids::RunId) -> edgegate_daemon::db::RunRow {
        self.deps.db.get_run(self.workspace_id, run_id).unwrap()
    }
}
