use super::*;
use crate::gating::{GatesEvaluation, Outcome};

fn sample_summary() -> BundleSummary {
    BundleSummary {
        bundle_version: BUNDLE_VERSION.to_string(),
        workspace_id: WorkspaceId::generate(),
        pipeline_id: PipelineId::generate(),
        run_id: RunId::generate(),
        created_at: "2026-08-02T10:00:00Z".to_string(),
        inputs: SummaryInputs {
            model: ModelInput {
                artifact_id: ArtifactId::generate(),
                sha256: sha256_hex(b"model bytes"),
            },
            promptpack: PromptPackInput {
                promptpack_id: "smoke".to_string(),
                version: "1.0.0".to_string(),
                sha256: sha256_hex(b"pack bytes"),
            },
            devices: vec![DeviceInput {
                device_id: "dev-s24".to_string(),
                device_name: "Samsung Galaxy S24".to_string(),
            }],
        },
        capabilities_ref: Some(ArtifactId::generate()),
        metric_mapping_ref: Some(ArtifactId::generate()),
        results: SummaryResults {
            status: "passed".to_string(),
            normalized_metrics: vec![NormalizedMetricRow {
                device: "Samsung Galaxy S24".to_string(),
                metric: "peak_ram_mb".to_string(),
                median: 3250.0,
                repeats: vec![3200.0, 3250.0, 3300.0],
            }],
            gates_evaluation: GatesEvaluation {
                outcome: Outcome::Passed,
                gates: vec![],
                flaky: vec![],
            },
        },
        // Filled in by assembly.
        artifacts: vec![],
        signing: SigningBlock {
            algo: String::new(),
            public_key_id: String::new(),
        },
    }
}

fn sample_contents() -> BundleContents {
    BundleContents {
        raw: vec![(
            "profile_dev-s24_r0.json".to_string(),
            br#"{"execution_summary":{"peak_memory_mb":3200.0}}"#.to_vec(),
        )],
        metric_mapping: Some(br#"{"metrics":{}}"#.to_vec()),
        capabilities: Some(br#"{"capabilities":{}}"#.to_vec()),
    }
}

fn signer() -> SigningKeyManager {
    let manager = SigningKeyManager::in_memory();
    manager.generate("key-v1").unwrap();
    manager
}

#[test]
fn test_build_and_verify() {
    let signer = signer();
    let built = build_bundle(sample_summary(), &sample_contents(), &signer).unwrap();

    assert_eq!(built.summary.signing.algo, "ed25519");
    assert_eq!(built.summary.signing.public_key_id, "key-v1");
    assert_eq!(built.summary.artifacts.len(), 3);

    let record = signer.record("key-v1").unwrap();
    let verified = verify_bundle(&built.zip, &record.public_key_hex).unwrap();
    assert_eq!(verified.run_id, built.summary.run_id);
    assert_eq!(verified.results.status, "passed");
}

#[test]
fn test_bundle_layout() {
    let built = build_bundle(sample_summary(), &sample_contents(), &signer()).unwrap();
    let names: Vec<String> = read_zip(&built.zip)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        vec![
            "summary.json",
            "summary.sig",
            "artifacts.json",
            "report.html",
            "raw/profile_dev-s24_r0.json",
            "mapping/metric_mapping.json",
            "capabilities/workspace_capabilities.json",
        ]
    );
}

#[test]
fn test_summary_is_canonical_in_archive() {
    let built = build_bundle(sample_summary(), &sample_contents(), &signer()).unwrap();
    let entries = read_zip(&built.zip).unwrap();
    let (_, summary_bytes) = entries.iter().find(|(n, _)| n == "summary.json").unwrap();
    let text = std::str::from_utf8(summary_bytes).unwrap();
    assert!(crate::canonical::is_canonical(text));
}

#[test]
fn test_manifest_covers_all_other_entries() {
    let built = build_bundle(sample_summary(), &sample_contents(), &signer()).unwrap();
    let entries = read_zip(&built.zip).unwrap();
    let (_, manifest_bytes) = entries.iter().find(|(n, _)| n == "artifacts.json").unwrap();
    let manifest: Vec<ManifestRow> = serde_json::from_slice(manifest_bytes).unwrap();

    let manifest_paths: Vec<&str> = manifest.iter().map(|r| r.path.as_str()).collect();
    for (name, bytes) in &entries {
        if name == "artifacts.json" {
            continue;
        }
        assert!(manifest_paths.contains(&name.as_str()), "missing {name}");
        let row = manifest.iter().find(|r| &r.path == name).unwrap();
        assert_eq!(row.sha256, sha256_hex(bytes));
        assert_eq!(row.bytes, bytes.len() as u64);
    }
}

#[test]
fn test_tampered_summary_fails_verification() {
    let signer = signer();
    let built = build_bundle(sample_summary(), &sample_contents(), &signer).unwrap();
    let record = signer.record("key-v1").unwrap();

    let mut entries = read_zip(&built.zip).unwrap();
    for (name, bytes) in &mut entries {
        if name == "summary.json" {
            let text = String::from_utf8(bytes.clone()).unwrap();
            *bytes = text.replace("passed", "failed").into_bytes();
        }
    }
    let tampered = write_zip(&entries);
    assert!(verify_bundle(&tampered, &record.public_key_hex).is_err());
}

#[test]
fn test_tampered_blob_fails_manifest_check() {
    let signer = signer();
    let built = build_bundle(sample_summary(), &sample_contents(), &signer).unwrap();
    let record = signer.record("key-v1").unwrap();

    let mut entries = read_zip(&built.zip).unwrap();
    for (name, bytes) in &mut entries {
        if name.starts_with("raw/") {
            bytes.push(b'!');
        }
    }
    let tampered = write_zip(&entries);
    assert!(matches!(
        verify_bundle(&tampered, &record.public_key_hex),
        Err(BundleError::EntryHashMismatch { .. })
    ));
}

#[test]
fn test_wrong_public_key_rejected() {
    let signer_a = signer();
    let built = build_bundle(sample_summary(), &sample_contents(), &signer_a).unwrap();

    let signer_b = SigningKeyManager::in_memory();
    let record_b = signer_b.generate("key-other").unwrap();
    assert!(matches!(
        verify_bundle(&built.zip, &record_b.public_key_hex),
        Err(BundleError::SignatureInvalid)
    ));
}

#[test]
fn test_bundle_deterministic_given_same_inputs() {
    // Same summary, same contents, same key: byte-identical archives.
    let manager = SigningKeyManager::in_memory();
    manager.generate("key-v1").unwrap();
    let summary = sample_summary();
    let contents = sample_contents();

    let a = build_bundle(summary.clone(), &contents, &manager).unwrap();
    let b = build_bundle(summary, &contents, &manager).unwrap();
    assert_eq!(a.zip, b.zip);
    assert_eq!(a.zip_sha256, b.zip_sha256);
}

#[test]
fn test_failed_run_still_bundles() {
    let mut summary = sample_summary();
    summary.results.status = "failed".to_string();
    let signer = signer();
    let built = build_bundle(summary, &sample_contents(), &signer).unwrap();
    let record = signer.record("key-v1").unwrap();
    let verified = verify_bundle(&built.zip, &record.public_key_hex).unwrap();
    assert_eq!(verified.results.status, "failed");
}

#[test]
fn test_report_contains_run_facts() {
    let built = build_bundle(sample_summary(), &sample_contents(), &signer()).unwrap();
    let entries = read_zip(&built.zip).unwrap();
    let (_, report) = entries.iter().find(|(n, _)| n == "report.html").unwrap();
    let html = std::str::from_utf8(report).unwrap();
    assert!(html.contains("peak_ram_mb"));
    assert!(html.contains("key-v1"));
    assert!(html.contains(&built.summary.run_id.to_string()));
}

#[test]
fn test_missing_signature_entry() {
    let built = build_bundle(sample_summary(), &sample_contents(), &signer()).unwrap();
    let entries: Vec<(String, Vec<u8>)> = read_zip(&built.zip)
        .unwrap()
        .into_iter()
        .filter(|(name, _)| name != "summary.sig")
        .collect();
    let without_sig = write_zip(&entries);
    assert!(matches!(
        verify_bundle(&without_sig, "00"),
        Err(BundleError::MissingEntry { .. })
    ));
}
