//! A/B analysis over collected metric samples.
//!
//! Pure functions: the engine fetches samples, this module turns them into
//! per-variant summaries, reduction percentages, and a recommendation
//! against the experiment's success criteria.

use std::collections::HashSet;

use chrono::Utc;

use px_core::types::{
    ExperimentResults, MetricSample, Recommendation, SuccessCriteria, VariantSummary,
};

/// Aggregate one variant's samples. Returns `None` when there are none.
pub fn summarize(samples: &[MetricSample]) -> Option<VariantSummary> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean_cardinality = samples.iter().map(|s| s.cardinality as f64).sum::<f64>() / n;
    let mean_cost_per_minute = samples.iter().map(|s| s.cost_per_minute).sum::<f64>() / n;
    let total_dropped = samples.iter().map(|s| s.dropped_count).sum();
    let hosts: HashSet<&str> = samples.iter().map(|s| s.host_id.as_str()).collect();

    let mut cardinalities: Vec<u64> = samples.iter().map(|s| s.cardinality).collect();
    cardinalities.sort_unstable();

    Some(VariantSummary {
        mean_cardinality,
        p95_cardinality: percentile_nearest_rank(&cardinalities, 95.0),
        mean_cost_per_minute,
        total_dropped,
        sample_count: samples.len() as u64,
        host_count: hosts.len() as u64,
    })
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile_nearest_rank(sorted: &[u64], percentile: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}

/// Percentage change of `candidate` relative to `baseline`; positive means
/// the candidate is higher.
fn increase_pct(baseline: f64, candidate: f64) -> f64 {
    if baseline == 0.0 {
        return 0.0;
    }
    (candidate - baseline) / baseline * 100.0
}

/// Mean of a named `extra` series across samples, if any sample carries it.
fn extra_mean(samples: &[MetricSample], key: &str) -> Option<f64> {
    let values: Vec<f64> = samples.iter().filter_map(|s| s.extra.get(key).copied()).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Compare both variants against the success criteria.
///
/// Returns `None` when either variant has no samples at all — the caller
/// decides whether to keep waiting (grace period) or fail the experiment
/// with `insufficient_data`.
pub fn analyze(
    baseline: &[MetricSample],
    candidate: &[MetricSample],
    criteria: &SuccessCriteria,
) -> Option<ExperimentResults> {
    let baseline_summary = summarize(baseline)?;
    let candidate_summary = summarize(candidate)?;

    let cardinality_reduction_pct = (-increase_pct(
        baseline_summary.mean_cardinality,
        candidate_summary.mean_cardinality,
    ))
    .max(0.0);
    let cost_savings_pct = (-increase_pct(
        baseline_summary.mean_cost_per_minute,
        candidate_summary.mean_cost_per_minute,
    ))
    .max(0.0);

    let recommendation = recommend(
        criteria,
        &baseline_summary,
        &candidate_summary,
        cardinality_reduction_pct,
        baseline,
        candidate,
    );

    Some(ExperimentResults {
        baseline: baseline_summary,
        candidate: candidate_summary,
        cardinality_reduction_pct,
        cost_savings_pct,
        recommendation,
        analyzed_at: Utc::now(),
    })
}

fn recommend(
    criteria: &SuccessCriteria,
    baseline: &VariantSummary,
    candidate: &VariantSummary,
    cardinality_reduction_pct: f64,
    baseline_samples: &[MetricSample],
    candidate_samples: &[MetricSample],
) -> Recommendation {
    let cost_increase = increase_pct(baseline.mean_cost_per_minute, candidate.mean_cost_per_minute);
    let latency_increase = match (
        extra_mean(baseline_samples, "latency_ms"),
        extra_mean(candidate_samples, "latency_ms"),
    ) {
        (Some(base), Some(cand)) => Some(increase_pct(base, cand)),
        _ => None,
    };
    let retention = extra_mean(candidate_samples, "critical_process_retention");

    // Any exceeded "max" criterion is a hard reject.
    if let Some(max_cost) = criteria.max_cost_increase {
        if cost_increase > max_cost {
            return Recommendation::Reject;
        }
    }
    if let (Some(max_latency), Some(observed)) = (criteria.max_latency_increase, latency_increase) {
        if observed > max_latency {
            return Recommendation::Reject;
        }
    }

    // A promote requires every criterion met and enough evidence.
    let mut met = true;
    if let Some(min_reduction) = criteria.min_cardinality_reduction {
        met &= cardinality_reduction_pct >= min_reduction;
    }
    if let Some(min_retention) = criteria.min_critical_process_retention {
        met &= retention.is_some_and(|r| r >= min_retention);
    }
    if criteria.max_latency_increase.is_some() && latency_increase.is_none() {
        // Criterion declared but never measured: not enough evidence.
        met = false;
    }
    let enough_samples = baseline.sample_count >= criteria.min_samples as u64
        && candidate.sample_count >= criteria.min_samples as u64;
    let enough_hosts = baseline.host_count >= criteria.min_hosts as u64
        && candidate.host_count >= criteria.min_hosts as u64;

    if met && enough_samples && enough_hosts {
        Recommendation::Promote
    } else {
        Recommendation::Inconclusive
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
