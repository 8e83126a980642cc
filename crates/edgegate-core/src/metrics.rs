//! Normalized metrics: the mapping document, the path evaluator, and the
//! per-repeat measurement table.
//!
//! Backend payloads are arbitrary JSON whose shape is not known a priori.
//! The metric mapping - built exclusively by probe - is the single source
//! of truth for where each normalized metric lives in a payload. Extraction
//! never guesses: a metric with no proven path is simply absent.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ArtifactId, WorkspaceId};

/// The candidate normalized metric names probe searches for.
pub const CANDIDATE_METRICS: &[&str] = &[
    "peak_ram_mb",
    "ttft_ms",
    "tokens_per_sec",
    "inference_time_ms",
    "npu_compute_percent",
    "gpu_compute_percent",
    "cpu_compute_percent",
];

/// Synthetic metric name carrying aggregate correctness.
pub const CORRECTNESS_METRIC: &str = "correctness";

/// Stability of a metric path in the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStability {
    /// Same path resolved with a consistent unit in at least two probe
    /// payloads.
    Stable,
    /// Present in probe payloads but with divergent paths or units.
    Unstable,
    /// Never resolved; `json_path` is null.
    Unavailable,
}

/// One metric's entry in the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricPathEntry {
    /// Dotted path into the payload, present only when probe proved it.
    pub json_path: Option<String>,
    /// Unit recorded from probing, e.g. `ms`, `MB`, `%`.
    pub unit: Option<String>,
    /// How trustworthy the path is.
    pub stability: MappingStability,
}

impl MetricPathEntry {
    /// The entry for a metric probe never found.
    #[must_use]
    pub const fn unavailable() -> Self {
        Self {
            json_path: None,
            unit: None,
            stability: MappingStability::Unavailable,
        }
    }
}

/// The per-workspace metric mapping document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMapping {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// When the mapping was derived.
    pub generated_at: DateTime<Utc>,
    /// Probe payload artifacts this mapping was derived from. A stable
    /// entry requires at least two of these to agree.
    pub derived_from_artifacts: Vec<ArtifactId>,
    /// Entries keyed by normalized metric name.
    pub metrics: BTreeMap<String, MetricPathEntry>,
}

impl MetricMapping {
    /// Looks up a metric's entry; unknown names read as unavailable.
    #[must_use]
    pub fn entry(&self, metric: &str) -> MetricPathEntry {
        self.metrics
            .get(metric)
            .cloned()
            .unwrap_or(MetricPathEntry::unavailable())
    }

    /// Extracts a metric's numeric value from a payload using its proven
    /// path. Returns `None` when the metric is unavailable, the path does
    /// not resolve, or the value is not numeric.
    #[must_use]
    pub fn extract(&self, metric: &str, payload: &Value) -> Option<f64> {
        let entry = self.metrics.get(metric)?;
        let path = entry.json_path.as_deref()?;
        evaluate_path(payload, path)?.as_f64()
    }
}

/// Evaluates a dotted path (`$.a.b`, with optional `[i]` indexing) against
/// a JSON value.
///
/// Probe only records paths of this shape, so the evaluator deliberately
/// supports nothing more: no wildcards, no filters, no recursive descent.
#[must_use]
pub fn evaluate_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix('$')?;
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (field, indexes) = split_indexes(segment)?;
        if !field.is_empty() {
            current = current.as_object()?.get(field)?;
        }
        for idx in indexes {
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

/// Splits `field[1][2]` into the field name and its index suffixes.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let field = &segment[..pos];
            let mut indexes = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                indexes.push(stripped[..close].parse().ok()?);
                rest = &stripped[close + 1..];
            }
            if rest.is_empty() {
                Some((field, indexes))
            } else {
                None
            }
        }
    }
}

/// Per-repeat measurements, keyed by `(device, metric)`.
///
/// Warmup iterations are stored separately and never reach aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementTable {
    rows: BTreeMap<String, BTreeMap<String, BTreeMap<u32, f64>>>,
    warmup: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
}

impl MeasurementTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one measurement repeat.
    pub fn insert(&mut self, device: &str, metric: &str, repeat_index: u32, value: f64) {
        self.rows
            .entry(device.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_default()
            .insert(repeat_index, value);
    }

    /// Records a warmup value (excluded from aggregation).
    pub fn insert_warmup(&mut self, device: &str, metric: &str, value: f64) {
        self.warmup
            .entry(device.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_default()
            .push(value);
    }

    /// Measurement values for a `(device, metric)` pair in repeat order.
    /// Repeats that missed the metric are simply absent.
    #[must_use]
    pub fn values(&self, device: &str, metric: &str) -> Vec<f64> {
        self.rows
            .get(device)
            .and_then(|metrics| metrics.get(metric))
            .map(|by_repeat| by_repeat.values().copied().collect())
            .unwrap_or_default()
    }

    /// All devices with measurements, in insertion-independent order.
    #[must_use]
    pub fn devices(&self) -> Vec<&str> {
        self.rows.keys().map(String::as_str).collect()
    }

    /// All metrics recorded for a device.
    #[must_use]
    pub fn metrics_for(&self, device: &str) -> Vec<&str> {
        self.rows
            .get(device)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Warmup values for a `(device, metric)` pair, for evidence output.
    #[must_use]
    pub fn warmup_values(&self, device: &str, metric: &str) -> Vec<f64> {
        self.warmup
            .get(device)
            .and_then(|metrics| metrics.get(metric))
            .cloned()
            .unwrap_or_default()
    }
}

/// Per-case correctness scores: 0/1 per `(device, case, repeat)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrectnessTable {
    scores: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl CorrectnessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one case's score for one repeat on one device.
    pub fn record(&mut self, device: &str, case_id: &str, passed: bool) {
        self.scores
            .entry(device.to_string())
            .or_default()
            .entry(case_id.to_string())
            .or_default()
            .push(u8::from(passed));
    }

    /// Aggregate correctness for a device: mean over cases of the median
    /// of each case's repeat scores. Returns `None` when no case was
    /// scored on the device (every expectation was `none`).
    #[must_use]
    pub fn aggregate(&self, device: &str) -> Option<f64> {
        let cases = self.scores.get(device)?;
        if cases.is_empty() {
            return None;
        }
        let sum: f64 = cases
            .values()
            .map(|repeats| {
                let mut sorted: Vec<f64> = repeats.iter().map(|&s| f64::from(s)).collect();
                median_in_place(&mut sorted)
            })
            .sum();
        #[allow(clippy::cast_precision_loss)]
        Some(sum / cases.len() as f64)
    }
}

/// Median of a mutable slice; empty slices yield 0.
fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("scores are finite"));
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    }
}
