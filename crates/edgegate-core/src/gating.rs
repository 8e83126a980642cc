//! The deterministic gating evaluator.
//!
//! Given the per-repeat measurement table, the workspace metric mapping,
//! and the pipeline's ordered gates, this module decides the run outcome.
//!
//! The algorithm, in order:
//!
//! 1. Warmup repeats never enter the table's measurement rows (the worker
//!    routes them to the warmup side), so aggregation sees repeats only.
//! 2. Each `(device, metric)` aggregates to the median of its repeats.
//! 3. A metric is *flaky* on a device when its coefficient of variation
//!    exceeds the family threshold: 0.15 for throughput metrics, 0.20 for
//!    latency metrics. Unlisted metrics inherit the latency rule. With a
//!    single repeat the CV is undefined and the metric is never flagged.
//! 4. Gates are walked in declared order, devices in matrix order. A
//!    missing or flaky metric skips an optional gate and terminates the
//!    run for a required one.
//! 5. Outcome: an error from step 4 wins; otherwise `failed` iff any
//!    required gate failed; `passed` otherwise.
//!
//! Boundary values compare with the operator's inclusive semantics:
//! exactly-equal values against `<=`, `>=`, and `=` evaluate true.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::metrics::{MappingStability, MeasurementTable, MetricMapping};

/// CV threshold above which a throughput metric is flaky.
pub const THROUGHPUT_CV_THRESHOLD: f64 = 0.15;

/// CV threshold above which a latency metric is flaky.
pub const LATENCY_CV_THRESHOLD: f64 = 0.20;

/// Comparison operator in a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOp {
    /// Strictly less than.
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal.
    #[serde(rename = "<=")]
    Le,
    /// Strictly greater than.
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Exactly equal.
    #[serde(rename = "=")]
    Eq,
}

impl GateOp {
    /// Applies the operator.
    #[must_use]
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Eq => (value - threshold) == 0.0,
        }
    }

    /// Symbol form for reports.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "=",
        }
    }
}

/// One gate: `metric op threshold`, with a required flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    /// Normalized metric name the gate targets.
    pub metric: String,
    /// Comparison operator.
    pub op: GateOp,
    /// Threshold value.
    pub threshold: f64,
    /// Whether a missing or flaky metric terminates the run.
    pub required: bool,
}

/// Metric family for flake thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFamily {
    /// Rates: higher is better, tighter CV tolerance.
    Throughput,
    /// Durations and everything unlisted.
    Latency,
}

impl MetricFamily {
    /// Classifies a metric by name.
    #[must_use]
    pub fn of(metric: &str) -> Self {
        if metric == "tokens_per_sec" || metric == "tps" || metric.ends_with("_per_sec") {
            Self::Throughput
        } else {
            // ttft_ms, inference_time_ms, *_latency_ms, and anything
            // unlisted inherit the latency rule.
            Self::Latency
        }
    }

    /// The family's CV threshold.
    #[must_use]
    pub const fn cv_threshold(&self) -> f64 {
        match self {
            Self::Throughput => THROUGHPUT_CV_THRESHOLD,
            Self::Latency => LATENCY_CV_THRESHOLD,
        }
    }
}

/// Status of one gate on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// The comparison held.
    Pass,
    /// The comparison did not hold.
    Fail,
    /// Optional gate skipped (missing or flaky metric).
    Skipped,
}

/// Result of one gate evaluated on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// The gate's metric.
    pub metric: String,
    /// Device the gate was evaluated on.
    pub device: String,
    /// Operator symbol.
    pub op: GateOp,
    /// Threshold.
    pub threshold: f64,
    /// Whether the gate was required.
    pub required: bool,
    /// Median observed value, when one existed.
    pub observed: Option<f64>,
    /// Outcome on this device.
    pub status: GateStatus,
    /// Present for skips and failures caused by metric state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Terminal outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "code")]
pub enum Outcome {
    /// Every required gate passed.
    Passed,
    /// At least one required gate failed.
    Failed,
    /// Evaluation terminated with an error code.
    Error(ErrorCode),
}

/// The full evaluation: outcome plus per-gate-per-device results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatesEvaluation {
    /// Terminal outcome.
    pub outcome: Outcome,
    /// Ordered results: gates in declared order, devices in matrix order.
    pub gates: Vec<GateResult>,
    /// Metrics flagged flaky, as `(device, metric)` pairs.
    pub flaky: Vec<(String, String)>,
}

/// Evaluates gates against a measurement table.
///
/// `device_order` is the pipeline's device matrix; only listed devices are
/// considered, in that order. The mapping supplies per-metric stability;
/// a gate on an `unavailable` metric behaves as missing even if a stray
/// value made it into the table.
#[must_use]
pub fn evaluate(
    table: &MeasurementTable,
    mapping: &MetricMapping,
    gates: &[Gate],
    device_order: &[String],
) -> GatesEvaluation {
    let mut results = Vec::new();
    let mut flaky_pairs = Vec::new();
    let mut any_required_fail = false;

    for gate in gates {
        // Correctness is computed from scored cases, not extracted through
        // the mapping; its presence in the table is its own proof.
        let stability = if gate.metric == crate::metrics::CORRECTNESS_METRIC {
            MappingStability::Stable
        } else {
            mapping.entry(&gate.metric).stability
        };
        for device in device_order {
            let values = table.values(device, &gate.metric);

            // Missing: unproven mapping or no observed value.
            if stability == MappingStability::Unavailable || values.is_empty() {
                if gate.required {
                    results.push(gate_result(
                        gate,
                        device,
                        None,
                        GateStatus::Fail,
                        Some(format!("required metric {} has no value", gate.metric)),
                    ));
                    return GatesEvaluation {
                        outcome: Outcome::Error(ErrorCode::MissingRequiredMetric),
                        gates: results,
                        flaky: flaky_pairs,
                    };
                }
                results.push(gate_result(
                    gate,
                    device,
                    None,
                    GateStatus::Skipped,
                    Some(format!("metric {} unavailable", gate.metric)),
                ));
                continue;
            }

            let median = median_of(&values);

            if is_flaky(&gate.metric, &values) {
                flaky_pairs.push((device.clone(), gate.metric.clone()));
                if gate.required {
                    results.push(gate_result(
                        gate,
                        device,
                        Some(median),
                        GateStatus::Fail,
                        Some(format!(
                            "required metric {} is flaky on {device}",
                            gate.metric
                        )),
                    ));
                    return GatesEvaluation {
                        outcome: Outcome::Error(ErrorCode::FlakyMetric),
                        gates: results,
                        flaky: flaky_pairs,
                    };
                }
                results.push(gate_result(
                    gate,
                    device,
                    Some(median),
                    GateStatus::Skipped,
                    Some(format!("metric {} flaky on {device}", gate.metric)),
                ));
                continue;
            }

            let passed = gate.op.apply(median, gate.threshold);
            if !passed && gate.required {
                any_required_fail = true;
            }
            results.push(gate_result(
                gate,
                device,
                Some(median),
                if passed {
                    GateStatus::Pass
                } else {
                    GateStatus::Fail
                },
                None,
            ));
        }
    }

    GatesEvaluation {
        outcome: if any_required_fail {
            Outcome::Failed
        } else {
            Outcome::Passed
        },
        gates: results,
        flaky: flaky_pairs,
    }
}

fn gate_result(
    gate: &Gate,
    device: &str,
    observed: Option<f64>,
    status: GateStatus,
    reason: Option<String>,
) -> GateResult {
    GateResult {
        metric: gate.metric.clone(),
        device: device.to_string(),
        op: gate.op,
        threshold: gate.threshold,
        required: gate.required,
        observed,
        status,
        reason,
    }
}

/// Median of measurement repeats.
#[must_use]
pub fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("measurements are finite"));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Whether a metric's repeats exceed their family's CV threshold.
///
/// CV is `sample_stdev / |mean|`. Undefined cases - a single repeat, or a
/// zero mean - are never flagged.
#[must_use]
pub fn is_flaky(metric: &str, values: &[f64]) -> bool {
    coefficient_of_variation(values)
        .is_some_and(|cv| cv > MetricFamily::of(metric).cv_threshold())
}

/// Sample coefficient of variation, when defined.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean.abs() < f64::EPSILON {
        return None;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt() / mean.abs())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::ids::{ArtifactId, WorkspaceId};
    use crate::metrics::MetricPathEntry;

    fn mapping(stable: &[&str], unavailable: &[&str]) -> MetricMapping {
        let mut metrics = BTreeMap::new();
        for name in stable {
            metrics.insert(
                (*name).to_string(),
                MetricPathEntry {
                    json_path: Some(format!("$.{name}")),
                    unit: Some("ms".to_string()),
                    stability: MappingStability::Stable,
                },
            );
        }
        for name in unavailable {
            metrics.insert((*name).to_string(), MetricPathEntry::unavailable());
        }
        MetricMapping {
            workspace_id: WorkspaceId::generate(),
            generated_at: Utc::now(),
            derived_from_artifacts: vec![ArtifactId::generate(), ArtifactId::generate()],
            metrics,
        }
    }

    fn table_with(device: &str, metric: &str, values: &[f64]) -> MeasurementTable {
        let mut table = MeasurementTable::new();
        for (i, v) in values.iter().enumerate() {
            table.insert(device, metric, u32::try_from(i).unwrap(), *v);
        }
        table
    }

    fn gate(metric: &str, op: GateOp, threshold: f64, required: bool) -> Gate {
        Gate {
            metric: metric.to_string(),
            op,
            threshold,
            required,
        }
    }

    const DEV: &str = "Samsung Galaxy S24";

    fn devices() -> Vec<String> {
        vec![DEV.to_string()]
    }

    #[test]
    fn test_happy_path_passes() {
        // Scenario: ram <= 3500 required, tps >= 12 optional.
        let mut table = table_with(DEV, "peak_ram_mb", &[3200.0, 3250.0, 3300.0]);
        for (i, v) in [18.0, 18.5, 17.5].iter().enumerate() {
            table.insert(DEV, "tokens_per_sec", u32::try_from(i).unwrap(), *v);
        }
        let mapping = mapping(&["peak_ram_mb", "tokens_per_sec"], &[]);
        let gates = vec![
            gate("peak_ram_mb", GateOp::Le, 3500.0, true),
            gate("tokens_per_sec", GateOp::Ge, 12.0, false),
        ];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Passed);
        assert_eq!(eval.gates.len(), 2);
        assert_eq!(eval.gates[0].observed, Some(3250.0));
        assert_eq!(eval.gates[0].status, GateStatus::Pass);
        assert_eq!(eval.gates[1].observed, Some(18.0));
        assert_eq!(eval.gates[1].status, GateStatus::Pass);
        assert!(eval.flaky.is_empty());
    }

    #[test]
    fn test_required_metric_missing_terminates() {
        // ram mapping unavailable; tps fine.
        let table = table_with(DEV, "tokens_per_sec", &[18.0, 18.5, 17.5]);
        let mapping = mapping(&["tokens_per_sec"], &["peak_ram_mb"]);
        let gates = vec![
            gate("peak_ram_mb", GateOp::Le, 3500.0, true),
            gate("tokens_per_sec", GateOp::Ge, 12.0, false),
        ];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(
            eval.outcome,
            Outcome::Error(ErrorCode::MissingRequiredMetric)
        );
        // The terminating gate's detail names the metric.
        let last = eval.gates.last().unwrap();
        assert_eq!(last.metric, "peak_ram_mb");
        assert!(last.reason.as_deref().unwrap().contains("peak_ram_mb"));
    }

    #[test]
    fn test_optional_metric_missing_skips() {
        let table = table_with(DEV, "peak_ram_mb", &[3200.0, 3250.0, 3300.0]);
        let mapping = mapping(&["peak_ram_mb"], &["tokens_per_sec"]);
        let gates = vec![
            gate("peak_ram_mb", GateOp::Le, 3500.0, true),
            gate("tokens_per_sec", GateOp::Ge, 12.0, false),
        ];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Passed);
        assert_eq!(eval.gates[1].status, GateStatus::Skipped);
        assert!(eval.gates[1].reason.is_some());
    }

    #[test]
    fn test_required_flaky_terminates() {
        // CV of [18, 8, 19] is ~0.405 > 0.15 for a throughput metric.
        let table = table_with(DEV, "tokens_per_sec", &[18.0, 8.0, 19.0]);
        let mapping = mapping(&["tokens_per_sec"], &[]);
        let gates = vec![gate("tokens_per_sec", GateOp::Ge, 12.0, true)];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Error(ErrorCode::FlakyMetric));
        assert_eq!(
            eval.flaky,
            vec![(DEV.to_string(), "tokens_per_sec".to_string())]
        );
    }

    #[test]
    fn test_optional_flaky_skips() {
        let mut table = table_with(DEV, "tokens_per_sec", &[18.0, 8.0, 19.0]);
        for (i, v) in [3200.0, 3250.0, 3300.0].iter().enumerate() {
            table.insert(DEV, "peak_ram_mb", u32::try_from(i).unwrap(), *v);
        }
        let mapping = mapping(&["peak_ram_mb", "tokens_per_sec"], &[]);
        let gates = vec![
            gate("peak_ram_mb", GateOp::Le, 3500.0, true),
            gate("tokens_per_sec", GateOp::Ge, 12.0, false),
        ];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Passed);
        assert_eq!(eval.gates[1].status, GateStatus::Skipped);
    }

    #[test]
    fn test_required_gate_fail() {
        let table = table_with(DEV, "peak_ram_mb", &[3600.0, 3650.0, 3700.0]);
        let mapping = mapping(&["peak_ram_mb"], &[]);
        let gates = vec![gate("peak_ram_mb", GateOp::Le, 3500.0, true)];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Failed);
        assert_eq!(eval.gates[0].status, GateStatus::Fail);
    }

    #[test]
    fn test_optional_gate_fail_does_not_fail_run() {
        let mut table = table_with(DEV, "peak_ram_mb", &[3200.0, 3250.0, 3300.0]);
        for (i, v) in [5.0, 5.1, 5.2].iter().enumerate() {
            table.insert(DEV, "tokens_per_sec", u32::try_from(i).unwrap(), *v);
        }
        let mapping = mapping(&["peak_ram_mb", "tokens_per_sec"], &[]);
        let gates = vec![
            gate("peak_ram_mb", GateOp::Le, 3500.0, true),
            gate("tokens_per_sec", GateOp::Ge, 12.0, false),
        ];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Passed);
        assert_eq!(eval.gates[1].status, GateStatus::Fail);
    }

    #[test]
    fn test_single_repeat_never_flaky() {
        // N=1: median is the sole value and CV is undefined.
        let table = table_with(DEV, "tokens_per_sec", &[18.0]);
        let mapping = mapping(&["tokens_per_sec"], &[]);
        let gates = vec![gate("tokens_per_sec", GateOp::Ge, 12.0, true)];

        let eval = evaluate(&table, &mapping, &gates, &devices());
        assert_eq!(eval.outcome, Outcome::Passed);
        assert_eq!(eval.gates[0].observed, Some(18.0));
    }

    #[test]
    fn test_five_repeats_with_outlier_median() {
        let table = table_with(DEV, "inference_time_ms", &[13.0, 12.8, 13.1, 45.0, 12.9]);
        assert_eq!(
            median_of(&table.values(DEV, "inference_time_ms")),
            13.0
        );
    }

    #[test]
    fn test_even_repeats_median_interpolates() {
        assert!((median_of(&[1.0, 2.0, 3.0, 4.0]) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_boundary_equality_inclusive() {
        let table = table_with(DEV, "peak_ram_mb", &[3500.0, 3500.0, 3500.0]);
        let mapping = mapping(&["peak_ram_mb"], &[]);

        for (op, expect_pass) in [
            (GateOp::Le, true),
            (GateOp::Ge, true),
            (GateOp::Eq, true),
            (GateOp::Lt, false),
            (GateOp::Gt, false),
        ] {
            let gates = vec![gate("peak_ram_mb", op, 3500.0, true)];
            let eval = evaluate(&table, &mapping, &gates, &devices());
            let expected = if expect_pass {
                Outcome::Passed
            } else {
                Outcome::Failed
            };
            assert_eq!(eval.outcome, expected, "op {op:?}");
        }
    }

    #[test]
    fn test_family_classification() {
        assert_eq!(MetricFamily::of("tokens_per_sec"), MetricFamily::Throughput);
        assert_eq!(MetricFamily::of("tps"), MetricFamily::Throughput);
        assert_eq!(MetricFamily::of("frames_per_sec"), MetricFamily::Throughput);
        assert_eq!(MetricFamily::of("ttft_ms"), MetricFamily::Latency);
        assert_eq!(MetricFamily::of("inference_time_ms"), MetricFamily::Latency);
        assert_eq!(MetricFamily::of("decode_latency_ms"), MetricFamily::Latency);
        // Unlisted metrics inherit the latency rule.
        assert_eq!(MetricFamily::of("peak_ram_mb"), MetricFamily::Latency);
    }

    #[test]
    fn test_latency_threshold_looser_than_throughput() {
        // CV of [10.0, 13.0, 11.5] is ~0.13: flaky for throughput at 0.15?
        // No - 0.13 < 0.15. Use a spread with CV between the thresholds.
        // [10.0, 14.0, 12.0] -> mean 12, stdev 2, CV ~0.167.
        let values = [10.0, 14.0, 12.0];
        let cv = coefficient_of_variation(&values).unwrap();
        assert!(cv > THROUGHPUT_CV_THRESHOLD && cv < LATENCY_CV_THRESHOLD);
        assert!(is_flaky("requests_per_sec", &values));
        assert!(!is_flaky("ttft_ms", &values));
    }

    #[test]
    fn test_cv_matches_expected_scenario_values() {
        // [18.0, 18.5, 17.5]: CV ~= 0.027
        let cv = coefficient_of_variation(&[18.0, 18.5, 17.5]).unwrap();
        assert!((cv - 0.0277).abs() < 1e-3);

        // [18.0, 8.0, 19.0]: CV ~= 0.405
        let cv = coefficient_of_variation(&[18.0, 8.0, 19.0]).unwrap();
        assert!((cv - 0.405).abs() < 1e-2);
    }

    #[test]
    fn test_devices_walked_in_matrix_order() {
        let mut table = MeasurementTable::new();
        table.insert("dev-b", "peak_ram_mb", 0, 100.0);
        table.insert("dev-a", "peak_ram_mb", 0, 200.0);
        let mapping = mapping(&["peak_ram_mb"], &[]);
        let gates = vec![gate("peak_ram_mb", GateOp::Le, 1000.0, true)];
        let order = vec!["dev-b".to_string(), "dev-a".to_string()];

        let eval = evaluate(&table, &mapping, &gates, &order);
        assert_eq!(eval.gates[0].device, "dev-b");
        assert_eq!(eval.gates[1].device, "dev-a");
    }

    #[test]
    fn test_zero_mean_not_flagged() {
        assert!(coefficient_of_variation(&[0.0, 0.0, 0.0]).is_none());
    }
}
