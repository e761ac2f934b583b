//! Comparison of two replay runs
//!
//! Iterations of the same trace against equally-behaving live allocators
//! must agree on every call count and on the statistics digest. Timing is
//! reported alongside but never decides equality.

use crate::operation::Operation;
use crate::types::{ReplayResult, StatsDigest};
use serde::{Deserialize, Serialize};

/// Outcome of comparing a baseline run with another run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComparison {
    pub baseline_digest: StatsDigest,
    pub comparison_digest: StatsDigest,
    pub digest_matches: bool,
    pub call_counts_match: bool,
    pub warnings_match: bool,
    pub leaks_match: bool,
    pub call_differences: Vec<CallDifference>,
    pub performance_comparison: PerformanceComparison,
}

/// An operation recorded a different number of times in the two runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDifference {
    pub operation: Operation,
    pub baseline_count: u64,
    pub comparison_count: u64,
}

/// Comparison of performance metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceComparison {
    pub baseline_duration_ms: u64,
    pub comparison_duration_ms: u64,
    pub duration_difference_ms: i64,
    pub baseline_lines_per_second: f64,
    pub comparison_lines_per_second: f64,
    pub lines_per_second_difference: f64,
}

/// Run comparator
#[derive(Debug, Clone, Default)]
pub struct RunComparator;

impl RunComparator {
    pub fn new() -> Self {
        Self
    }

    /// Compare two runs of the same trace
    pub fn compare(&self, baseline: &ReplayResult, comparison: &ReplayResult) -> RunComparison {
        let call_differences = self.compare_calls(baseline, comparison);
        let baseline_perf = &baseline.performance_metrics;
        let comparison_perf = &comparison.performance_metrics;

        RunComparison {
            baseline_digest: baseline.digest,
            comparison_digest: comparison.digest,
            digest_matches: baseline.digest == comparison.digest,
            call_counts_match: call_differences.is_empty(),
            warnings_match: baseline.warnings.total == comparison.warnings.total,
            leaks_match: baseline.leaks.total() == comparison.leaks.total(),
            call_differences,
            performance_comparison: PerformanceComparison {
                baseline_duration_ms: baseline_perf.total_duration_ms,
                comparison_duration_ms: comparison_perf.total_duration_ms,
                duration_difference_ms: comparison_perf.total_duration_ms as i64
                    - baseline_perf.total_duration_ms as i64,
                baseline_lines_per_second: baseline_perf.lines_per_second,
                comparison_lines_per_second: comparison_perf.lines_per_second,
                lines_per_second_difference: comparison_perf.lines_per_second
                    - baseline_perf.lines_per_second,
            },
        }
    }

    fn compare_calls(
        &self,
        baseline: &ReplayResult,
        comparison: &ReplayResult,
    ) -> Vec<CallDifference> {
        Operation::ALL
            .iter()
            .filter_map(|&operation| {
                let baseline_count = baseline.statistics.call_count(operation);
                let comparison_count = comparison.statistics.call_count(operation);
                (baseline_count != comparison_count).then_some(CallDifference {
                    operation,
                    baseline_count,
                    comparison_count,
                })
            })
            .collect()
    }
}

impl RunComparison {
    /// Check if the runs are indistinguishable
    pub fn are_identical(&self) -> bool {
        self.digest_matches && self.call_counts_match && self.warnings_match && self.leaks_match
    }

    /// Generate a summary report
    pub fn summary(&self) -> String {
        if self.are_identical() {
            return format!("Runs are identical (digest {})", self.baseline_digest);
        }

        let mut parts = Vec::new();
        if !self.digest_matches {
            parts.push("statistics digests differ".to_string());
        }
        if !self.call_counts_match {
            parts.push(format!("{} operations counted differently", self.call_differences.len()));
        }
        if !self.warnings_match {
            parts.push("warning counts differ".to_string());
        }
        if !self.leaks_match {
            parts.push("leak counts differ".to_string());
        }
        format!("Runs differ: {}", parts.join(", "))
    }
}
