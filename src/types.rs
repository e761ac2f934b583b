//! Core data types for the replayer

use serde::{Serialize, Deserialize};
use std::fmt;
use std::path::PathBuf;
use crate::header::Mismatch;
use crate::statistics::Statistics;

/// Trace file format version (`major,minor` on line 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    /// Create a new version
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An object identifier as it appeared in the recording.
///
/// Zero is reserved: it means "no object", which for a creation call means
/// the call failed when it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    pub const NULL: HandleId = HandleId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Object categories tracked by the identity map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Pool,
    Allocation,
    DefragmentationContext,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Pool => "Pool",
            Category::Allocation => "Allocation",
            Category::DefragmentationContext => "Defragmentation context",
        };
        f.write_str(name)
    }
}

/// How much the replayer reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Verbosity {
    /// Count everything, print only the summary
    Minimum,
    #[default]
    Default,
    /// Also report "both failed" notes and device identity mismatches
    Maximum,
}

impl Verbosity {
    /// Map a numeric level (0, 1, 2) to a verbosity
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Verbosity::Minimum),
            1 => Some(Verbosity::Default),
            2 => Some(Verbosity::Maximum),
            _ => None,
        }
    }
}

/// Blake3 digest of a run's statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatsDigest(pub [u8; 32]);

impl fmt::Display for StatsDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Warning totals for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningSummary {
    pub total: usize,
    pub printed: usize,
    pub suppressed: usize,
}

/// Objects still alive in the identity map when the trace ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub pools: usize,
    pub allocations: usize,
    pub defragmentation_contexts: usize,
    /// Whether the leftovers were destroyed through the live API
    pub cleaned_up: bool,
}

impl LeakReport {
    pub fn total(&self) -> usize {
        self.pools + self.allocations + self.defragmentation_contexts
    }
}

/// Result of replaying one trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    pub format_version: FormatVersion,
    pub statistics: Statistics,
    pub digest: StatsDigest,
    pub warnings: WarningSummary,
    pub config_mismatches: Vec<Mismatch>,
    pub config_warnings: Vec<String>,
    pub leaks: LeakReport,
    pub snapshots: Vec<PathBuf>,
    pub performance_metrics: PerformanceMetrics,
}

/// Performance metrics for a replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_duration_ms: u64,
    pub lines_per_second: f64,
    pub average_line_time_us: f64,
}

impl fmt::Display for ReplayResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.statistics;
        writeln!(f, "Format version: {}", self.format_version)?;
        writeln!(
            f,
            "Lines: {} dispatched, {} skipped",
            stats.lines_dispatched, stats.lines_skipped
        )?;
        writeln!(f, "Function calls: {}", stats.total_calls())?;
        for (operation, count) in &stats.calls {
            writeln!(f, "    {}: {}", operation, count)?;
        }
        writeln!(f, "Recorded threads: {}", stats.calls_by_thread.len())?;
        writeln!(
            f,
            "Created: {} pools, {} buffers, {} images, {} allocations",
            stats.pools.count, stats.buffers.count, stats.images.count, stats.allocations.count
        )?;
        if stats.defragmentation.passes > 0 {
            writeln!(
                f,
                "Defragmentation: {} passes, {} bytes / {} allocations moved",
                stats.defragmentation.passes,
                stats.defragmentation.bytes_moved,
                stats.defragmentation.allocations_moved
            )?;
        }
        writeln!(f, "Snapshots written: {}", self.snapshots.len())?;
        writeln!(f, "Configuration mismatches: {}", self.config_mismatches.len())?;
        writeln!(
            f,
            "Warnings: {} ({} suppressed)",
            self.warnings.total, self.warnings.suppressed
        )?;
        if self.leaks.total() > 0 {
            writeln!(
                f,
                "Leaked at end: {} pools, {} allocations, {} defragmentation contexts{}",
                self.leaks.pools,
                self.leaks.allocations,
                self.leaks.defragmentation_contexts,
                if self.leaks.cleaned_up { " (destroyed)" } else { "" }
            )?;
        }
        writeln!(
            f,
            "Duration: {} ms ({:.0} lines/s)",
            self.performance_metrics.total_duration_ms, self.performance_metrics.lines_per_second
        )?;
        write!(f, "Statistics digest: {}", self.digest)
    }
}
