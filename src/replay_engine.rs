//! Core replay engine with builder pattern for trace replay

use crate::context::ReplayContext;
use crate::dispatcher::Dispatcher;
use crate::error::{CommandLineError, ReplayError, SourceFileError};
use crate::hasher::StatisticsHasher;
use crate::header::{parse_header, Mismatch, TraceHeader};
use crate::identity_map::IdentityMap;
use crate::lexer::LineSplit;
use crate::options::ReplayOptions;
use crate::range_filter::RangeSet;
use crate::scheduler::{ActionRunner, ActionSchedule};
use crate::serialization::SnapshotWriter;
use crate::traits::LiveAllocator;
use crate::types::{Category, LeakReport, PerformanceMetrics, ReplayResult, Verbosity};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Read a whole trace file. An empty file is an error.
pub fn load_trace_file(path: &Path) -> Result<Vec<u8>, SourceFileError> {
    let data = fs::read(path).map_err(|e| SourceFileError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if data.is_empty() {
        return Err(SourceFileError::Empty {
            path: path.display().to_string(),
        });
    }
    Ok(data)
}

/// Replays one trace against a live allocator it owns
#[derive(Debug)]
pub struct ReplayEngine<A: LiveAllocator> {
    live: A,
    identity: IdentityMap,
    context: ReplayContext,
    ranges: RangeSet,
    schedule: ActionSchedule,
    writer: SnapshotWriter,
}

impl<A: LiveAllocator> ReplayEngine<A> {
    /// Validate `options` and set up an engine around `live`
    pub fn new(live: A, options: ReplayOptions) -> Result<Self, ReplayError> {
        let ranges = options.validate()?;
        let schedule = Self::schedule_for(&options);
        let writer = SnapshotWriter::new(
            options.output_dir.clone(),
            options.snapshot_prefix.clone(),
            options.snapshot_format,
        );

        Ok(Self {
            live,
            identity: IdentityMap::new(),
            context: ReplayContext::new(options),
            ranges,
            schedule,
            writer,
        })
    }

    /// Create a builder for constructing a replay engine
    pub fn builder() -> ReplayEngineBuilder<A> {
        ReplayEngineBuilder::new()
    }

    fn schedule_for(options: &ReplayOptions) -> ActionSchedule {
        ActionSchedule::new(
            &options.dump_stats_after_lines,
            &options.dump_detailed_stats_after_lines,
            &options.defragment_after_lines,
        )
    }

    /// Read and replay the trace at `path`
    pub fn replay_file(&mut self, path: &Path) -> Result<ReplayResult, ReplayError> {
        let data = load_trace_file(path)?;
        self.replay(&data)
    }

    /// Replay a whole trace and return the run summary.
    ///
    /// Per-line problems are counted warnings. Only a malformed preamble, a
    /// fatal live error or a failed snapshot write end the run early.
    pub fn replay(&mut self, data: &[u8]) -> Result<ReplayResult, ReplayError> {
        let start_time = Instant::now();
        self.reset();

        let mut lines = LineSplit::new(data);
        let header = parse_header(&mut lines, &self.context.options().format_tag)?;
        self.context.logger.info(format!("File format version: {}", header.version));
        let config_mismatches = self.check_environment(&header);

        let mut snapshots = Vec::new();
        let mut last_line = 0;
        while let Some(line) = lines.next_line() {
            if line.is_blank() {
                continue;
            }
            last_line = line.number;
            if !self.ranges.includes(line.number) {
                self.context.statistics.record_line_skipped();
                continue;
            }

            self.context.statistics.record_line_dispatched();
            Dispatcher::new(&mut self.live, &mut self.identity, &mut self.context).dispatch(&line)?;
            self.run_due_actions(line.number, &mut snapshots)?;
        }

        let leaks = self.finish(last_line)?;
        let digest = StatisticsHasher::new().hash(&self.context.statistics)?;
        let performance_metrics = self.performance(start_time);

        let result = ReplayResult {
            format_version: header.version,
            statistics: self.context.statistics.clone(),
            digest,
            warnings: self.context.logger.summary(),
            config_mismatches,
            config_warnings: header.warnings,
            leaks,
            snapshots,
            performance_metrics,
        };
        self.log_summary(&result);
        Ok(result)
    }

    fn reset(&mut self) {
        let options = self.context.options().clone();
        self.schedule = Self::schedule_for(&options);
        self.context = ReplayContext::new(options);
        self.identity = IdentityMap::new();
    }

    /// Compare the recorded environment with the live one. Mismatches are
    /// reported, never fatal.
    fn check_environment(&mut self, header: &TraceHeader) -> Vec<Mismatch> {
        let verbosity = self.context.verbosity();
        for warning in &header.warnings {
            self.context.logger.info(format!("Config: {}", warning));
        }
        let Some(config) = &header.config else {
            return Vec::new();
        };

        let mismatches = config.compare(&self.live.environment(), verbosity);
        if !mismatches.is_empty() && verbosity > Verbosity::Minimum {
            tracing::warn!(
                "Configuration differs from the recording in {} places",
                mismatches.len()
            );
            for mismatch in &mismatches {
                tracing::warn!("  {}", mismatch);
            }
        }
        mismatches
    }

    fn run_due_actions(
        &mut self,
        line: usize,
        snapshots: &mut Vec<PathBuf>,
    ) -> Result<(), ReplayError> {
        let mut runner =
            ActionRunner::new(&mut self.live, &self.identity, &mut self.context, &self.writer);
        self.schedule.advance_to(line, |action| -> Result<(), ReplayError> {
            snapshots.extend(runner.execute(action, line)?);
            Ok(())
        })?;
        Ok(())
    }

    /// Count what the trace left alive and destroy it when cleanup is on
    fn finish(&mut self, last_line: usize) -> Result<LeakReport, ReplayError> {
        let cleanup = self.context.options().cleanup_leaks;
        let leaks = LeakReport {
            pools: self.identity.len(Category::Pool),
            allocations: self.identity.len(Category::Allocation),
            defragmentation_contexts: self.identity.len(Category::DefragmentationContext),
            cleaned_up: cleanup,
        };
        if leaks.total() == 0 {
            return Ok(leaks);
        }

        self.context.logger.info(format!(
            "Objects not destroyed by the trace: {} pools, {} allocations, \
             {} defragmentation contexts",
            leaks.pools, leaks.allocations, leaks.defragmentation_contexts
        ));
        if !cleanup {
            return Ok(leaks);
        }

        for (id, object) in self.identity.drain() {
            match object.destroy(&mut self.live) {
                Ok(()) => {}
                Err(error) if error.is_fatal() => {
                    return Err(ReplayError::LiveApi {
                        line: last_line,
                        source: error,
                    })
                }
                Err(error) => {
                    self.context.logger.warn(
                        last_line,
                        None,
                        format!("Cleanup of {} {} failed ({}).", object.category(), id, error),
                    );
                }
            }
        }
        Ok(leaks)
    }

    fn performance(&self, start_time: Instant) -> PerformanceMetrics {
        let duration = start_time.elapsed();
        let lines = self.context.statistics.lines_dispatched;
        let seconds = duration.as_secs_f64();

        PerformanceMetrics {
            total_duration_ms: duration.as_millis() as u64,
            lines_per_second: if seconds > 0.0 { lines as f64 / seconds } else { 0.0 },
            average_line_time_us: if lines > 0 {
                duration.as_micros() as f64 / lines as f64
            } else {
                0.0
            },
        }
    }

    fn log_summary(&mut self, result: &ReplayResult) {
        let statistics = &result.statistics;
        self.context.logger.info(format!(
            "Done. Lines dispatched: {}, skipped: {}, calls: {}, warnings: {} ({} suppressed)",
            statistics.lines_dispatched,
            statistics.lines_skipped,
            statistics.total_calls(),
            result.warnings.total,
            result.warnings.suppressed,
        ));
        if self.context.verbosity() == Verbosity::Maximum {
            for (operation, count) in &statistics.calls {
                self.context.logger.info(format!("  {}: {}", operation, count));
            }
        }
    }

    /// Get the live allocator
    pub fn live(&self) -> &A {
        &self.live
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn context(&self) -> &ReplayContext {
        &self.context
    }

    pub fn options(&self) -> &ReplayOptions {
        self.context.options()
    }

    /// Give the live allocator back, e.g. to inspect what is still alive
    pub fn into_live(self) -> A {
        self.live
    }
}

/// Builder for constructing replay engines with a fluent API
pub struct ReplayEngineBuilder<A: LiveAllocator> {
    live: Option<A>,
    options: Option<ReplayOptions>,
}

impl<A: LiveAllocator> ReplayEngineBuilder<A> {
    pub fn new() -> Self {
        Self {
            live: None,
            options: None,
        }
    }

    /// Set the live allocator calls are replayed against
    pub fn with_live(mut self, live: A) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_options(mut self, options: ReplayOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Build the replay engine; options default when not given
    pub fn build(self) -> Result<ReplayEngine<A>, ReplayError> {
        let live = self.live.ok_or_else(|| CommandLineError::InvalidOptions {
            reason: "a live allocator is required".to_string(),
        })?;
        ReplayEngine::new(live, self.options.unwrap_or_default())
    }
}

impl<A: LiveAllocator> Default for ReplayEngineBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FormatError, LiveError};
    use crate::operation::Operation;
    use crate::sim::SimulatedAllocator;
    use crate::types::HandleId;

    const EXAMPLE: &str =
        "FMT\n1,8\n0,0.0,0,CreatePool,0,0,1048576,1,1,0,0xA\n0,0.1,0,DestroyPool,0xA\n";

    fn options() -> ReplayOptions {
        ReplayOptions::builder().with_format_tag("FMT").build().unwrap()
    }

    fn engine() -> ReplayEngine<SimulatedAllocator> {
        ReplayEngine::new(SimulatedAllocator::new(), options()).unwrap()
    }

    #[test]
    fn test_replay_pool_round_trip() {
        let mut engine = engine();
        let result = engine.replay(EXAMPLE.as_bytes()).unwrap();

        assert_eq!(engine.identity().len(Category::Pool), 0);
        assert_eq!(result.warnings.total, 0);
        assert_eq!(result.statistics.pools.count, 1);
        assert_eq!(result.statistics.call_count(Operation::CreatePool), 1);
        assert_eq!(result.statistics.lines_dispatched, 2);
        assert_eq!(result.leaks.total(), 0);
        assert_eq!(engine.live().pool_count(), 0);
    }

    #[test]
    fn test_replay_engine_builder() {
        let engine = ReplayEngine::builder()
            .with_live(SimulatedAllocator::new())
            .with_options(options())
            .build();
        assert!(engine.is_ok());
        assert_eq!(engine.unwrap().options().format_tag, "FMT");
    }

    #[test]
    fn test_replay_engine_builder_missing_live() {
        let result = ReplayEngineBuilder::<SimulatedAllocator>::new().build();
        assert!(matches!(result, Err(ReplayError::CommandLine(_))));
    }

    #[test]
    fn test_bad_range_rejected_at_construction() {
        let options = ReplayOptions::builder().with_lines("9-3").build();
        let result = options
            .map_err(ReplayError::from)
            .and_then(|o| ReplayEngine::new(SimulatedAllocator::new(), o));
        assert!(matches!(result, Err(ReplayError::CommandLine(_))));
    }

    #[test]
    fn test_header_errors_are_fatal() {
        let mut engine = engine();
        let result = engine.replay(b"Other\n1,8\n");
        assert!(matches!(result, Err(ReplayError::Format(FormatError::BadTag { .. }))));

        let result = engine.replay(b"FMT\n2,0\n");
        assert!(matches!(result, Err(ReplayError::Format(FormatError::UnsupportedVersion { .. }))));
    }

    #[test]
    fn test_blank_lines_are_not_counted() {
        let mut engine = engine();
        let trace = "FMT\n1,8\n\n0,0.0,0,CreateAllocator\n\n\n0,0.1,0,DestroyAllocator\n";
        let result = engine.replay(trace.as_bytes()).unwrap();
        assert_eq!(result.statistics.lines_dispatched, 2);
        assert_eq!(result.statistics.lines_skipped, 0);
    }

    #[test]
    fn test_leaks_are_reported_and_cleaned() {
        let mut engine = engine();
        let trace = "FMT\n1,8\n0,0.0,0,CreatePool,0,0,1048576,1,1,0,0xA\n\
                     0,0.1,0,AllocateMemory,64,16,15,0,1,0,0,0,0,0xB\n";
        let result = engine.replay(trace.as_bytes()).unwrap();

        assert_eq!(result.leaks.pools, 1);
        assert_eq!(result.leaks.allocations, 1);
        assert!(result.leaks.cleaned_up);
        assert!(engine.identity().is_empty());
        assert_eq!(engine.into_live().live_object_count(), 0);
    }

    #[test]
    fn test_leaks_kept_without_cleanup() {
        let options = ReplayOptions::builder()
            .with_format_tag("FMT")
            .with_cleanup(false)
            .build()
            .unwrap();
        let mut engine = ReplayEngine::new(SimulatedAllocator::new(), options).unwrap();
        let trace = "FMT\n1,8\n0,0.0,0,CreatePool,0,0,1048576,1,1,0,0xA\n";
        let result = engine.replay(trace.as_bytes()).unwrap();

        assert_eq!(result.leaks.pools, 1);
        assert!(!result.leaks.cleaned_up);
        assert!(engine.identity().contains(Category::Pool, HandleId(0xA)));
        assert_eq!(engine.live().pool_count(), 1);
    }

    #[test]
    fn test_device_loss_is_fatal_with_line() {
        let live = SimulatedAllocator::new().with_device_lost_after(1);
        let mut engine = ReplayEngine::new(live, options()).unwrap();
        let trace = "FMT\n1,8\n0,0.0,0,CreatePool,0,0,1048576,1,1,0,0xA\n\
                     0,0.1,0,CreatePool,0,0,1048576,1,1,0,0xB\n";
        match engine.replay(trace.as_bytes()) {
            Err(ReplayError::LiveApi { line, source }) => {
                assert_eq!(line, 4);
                assert!(matches!(source, LiveError::DeviceLost { .. }));
            }
            other => panic!("expected fatal live error, got {:?}", other.map(|r| r.warnings)),
        }
    }

    #[test]
    fn test_load_empty_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        fs::write(&path, b"").unwrap();
        assert!(matches!(load_trace_file(&path), Err(SourceFileError::Empty { .. })));
        assert!(matches!(
            load_trace_file(&dir.path().join("missing.csv")),
            Err(SourceFileError::Unreadable { .. })
        ));
    }
}
