//! Metric-path derivation from probe payloads.
//!
//! For each candidate normalized metric there is a short table of
//! canonical paths observed in hub profile documents. A path is promoted
//! to `stable` only when it resolves to a number in at least two payloads;
//! a metric seen in exactly one payload, or through divergent paths, is
//! `unstable`; everything else is `unavailable` with a null path.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use crate::ids::{ArtifactId, WorkspaceId};
use crate::metrics::{
    evaluate_path, MappingStability, MetricMapping, MetricPathEntry, CANDIDATE_METRICS,
};

/// Canonical candidate paths per normalized metric, searched in order.
pub const CANDIDATE_PATHS: &[(&str, &[(&str, &str)])] = &[
    (
        "peak_ram_mb",
        &[
            ("$.execution_summary.peak_memory_mb", "MB"),
            ("$.memory.peak_mb", "MB"),
        ],
    ),
    (
        "ttft_ms",
        &[("$.llm_metrics.time_to_first_token_ms", "ms")],
    ),
    (
        "tokens_per_sec",
        &[("$.llm_metrics.tokens_per_second", "tokens/s")],
    ),
    (
        "inference_time_ms",
        &[
            ("$.execution_summary.estimated_inference_time_ms", "ms"),
            ("$.execution_summary.inference_time_ms", "ms"),
        ],
    ),
    (
        "npu_compute_percent",
        &[("$.compute_unit_breakdown.npu", "%")],
    ),
    (
        "gpu_compute_percent",
        &[("$.compute_unit_breakdown.gpu", "%")],
    ),
    (
        "cpu_compute_percent",
        &[("$.compute_unit_breakdown.cpu", "%")],
    ),
];

/// Derives the metric mapping from stored profile payloads.
///
/// `payloads` pairs each payload's artifact id with its parsed JSON; the
/// returned mapping's `derived_from_artifacts` lists them all, so invariant
/// checks can confirm that every stable path resolves in at least two.
#[must_use]
pub fn derive_metric_mapping(
    workspace_id: WorkspaceId,
    payloads: &[(ArtifactId, Value)],
) -> MetricMapping {
    let mut metrics: BTreeMap<String, MetricPathEntry> = BTreeMap::new();

    for metric in CANDIDATE_METRICS {
        metrics.insert((*metric).to_string(), derive_one(metric, payloads));
    }

    MetricMapping {
        workspace_id,
        generated_at: Utc::now(),
        derived_from_artifacts: payloads.iter().map(|(id, _)| *id).collect(),
        metrics,
    }
}

fn derive_one(metric: &str, payloads: &[(ArtifactId, Value)]) -> MetricPathEntry {
    let candidates = CANDIDATE_PATHS
        .iter()
        .find(|(name, _)| *name == metric)
        .map(|(_, paths)| *paths)
        .unwrap_or(&[]);

    let mut best_single: Option<(&str, &str)> = None;
    for &(path, unit) in candidates {
        let hits = payloads
            .iter()
            .filter(|(_, payload)| resolves_numeric(payload, path))
            .count();
        if hits >= 2 {
            // Same path, consistent unit, two independent payloads.
            return MetricPathEntry {
                json_path: Some((*path).to_string()),
                unit: Some((*unit).to_string()),
                stability: MappingStability::Stable,
            };
        }
        if hits == 1 && best_single.is_none() {
            best_single = Some((path, unit));
        }
    }

    // Present somewhere but not corroborated: record the observed path as
    // unstable so callers can see what probing found without trusting it.
    if let Some((path, unit)) = best_single {
        return MetricPathEntry {
            json_path: Some(path.to_string()),
            unit: Some(unit.to_string()),
            stability: MappingStability::Unstable,
        };
    }

    MetricPathEntry::unavailable()
}

fn resolves_numeric(payload: &Value, path: &str) -> bool {
    evaluate_path(payload, path).is_some_and(|v| v.as_f64().is_some())
}
