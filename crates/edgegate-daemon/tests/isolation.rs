//! Tenant isolation and immutability scenarios.

mod common;

use edgegate_core::cas::{ArtifactKind, ArtifactStore, CasError};
use edgegate_daemon::db::DbError;

use common::Harness;

#[test]
fn test_cross_tenant_artifact_reads_not_found() {
    let harness = Harness::new();
    let store = &harness.store;

    // Workspace A's artifact.
    let ws_a = harness.workspace_id;
    let artifact = store
        .put(ws_a, ArtifactKind::ProbeRaw, "a.json", b"{\"owner\":\"a\"}")
        .unwrap();

    // Workspace B sees NOT_FOUND, never FORBIDDEN - existence must not
    // leak across tenants.
    let ws_b = harness.deps.db.create_workspace("other").unwrap().id;
    assert!(matches!(
        store.get(ws_b, artifact.id),
        Err(CasError::NotFound { .. })
    ));
    assert!(matches!(
        store.stat(ws_b, artifact.id),
        Err(CasError::NotFound { .. })
    ));
    // Content-hash lookups are scoped the same way.
    assert!(store.lookup_by_sha(ws_b, &artifact.sha256).unwrap().is_none());
}

#[test]
fn test_cross_tenant_run_and_pipeline_reads_not_found() {
    let harness = Harness::new();
    let run_id = harness.enqueue_run();

    let ws_b = harness.deps.db.create_workspace("other").unwrap().id;
    assert!(matches!(
        harness.deps.db.get_run(ws_b, run_id),
        Err(DbError::NotFound)
    ));
    assert!(matches!(
        harness.deps.db.get_pipeline(ws_b, harness.pipeline.id),
        Err(DbError::NotFound)
    ));
}

#[test]
fn test_promptpack_version_immutable_once_published() {
    use edgegate_core::promptpack::{Expectation, PromptCase, PromptPackContent};

    let harness = Harness::new();
    let ws = harness.workspace_id;

    // The harness published smoke@1.0.0. Any differing rewrite fails.
    let altered = PromptPackContent {
        cases: vec![PromptCase {
            id: "altered".to_string(),
            prompt: "changed content".to_string(),
            max_new_tokens: None,
            expectation: Expectation::None,
        }],
    };
    let altered_sha = altered.canonical_sha256().unwrap();
    assert!(matches!(
        harness
            .deps
            .db
            .upsert_promptpack(ws, "smoke", "1.0.0", &altered, &altered_sha),
        Err(DbError::Conflict { .. })
    ));

    // A new version of the same logical pack is accepted.
    harness
        .deps
        .db
        .upsert_promptpack(ws, "smoke", "1.0.1", &altered, &altered_sha)
        .unwrap();
    let row = harness
        .deps
        .db
        .get_promptpack(ws, "smoke", "1.0.1")
        .unwrap();
    assert!(!row.published);
}

#[test]
fn test_dedup_is_per_workspace() {
    let harness = Harness::new();
    let store = &harness.store;
    let ws_a = harness.workspace_id;
    let ws_b = harness.deps.db.create_workspace("other").unwrap().id;

    let a = store
        .put(ws_a, ArtifactKind::ProbeRaw, "same.json", b"identical bytes")
        .unwrap();
    let b = store
        .put(ws_b, ArtifactKind::ProbeRaw, "same.json", b"identical bytes")
        .unwrap();

    // Same content hash, distinct artifacts, mutually invisible.
    assert_eq!(a.sha256, b.sha256);
    assert_ne!(a.id, b.id);
    assert!(store.get(ws_a, b.id).is_err());
    assert!(store.get(ws_b, a.id).is_err());
}
