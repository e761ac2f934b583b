//! Allocator Trace Replayer
//!
//! A library for replaying recorded GPU memory allocator call traces
//! against a live allocator, reconciling every recorded outcome with the
//! live one and aggregating statistics about the recorded workload.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod exit_codes;
pub mod hasher;
pub mod header;
pub mod identity_map;
pub mod lexer;
pub mod live;
pub mod logging;
pub mod operation;
pub mod options;
pub mod range_filter;
pub mod reconciler;
pub mod replay_engine;
pub mod result_comparison;
pub mod scheduler;
pub mod serialization;
pub mod sim;
pub mod statistics;
pub mod traits;
pub mod types;

// Re-export core types and traits
pub use context::ReplayContext;
pub use dispatcher::{DispatchStatus, Dispatcher, RecordedCall};
pub use error::{
    CommandLineError, FormatError, LiveError, RangeParseError, ReplayError, SerializationError,
    SourceFileError,
};
pub use exit_codes::ExitCode;
pub use hasher::StatisticsHasher;
pub use header::{parse_header, Mismatch, ReplayConfig, TraceHeader};
pub use identity_map::{BoundResource, IdentityMap, LiveObject};
pub use logging::{LogEntry, LogLevel, ReplayLogger};
pub use operation::Operation;
pub use options::{ReplayOptions, ReplayOptionsBuilder};
pub use range_filter::{LineRange, RangeSet};
pub use reconciler::{Outcome, Reconciliation, Reconciler};
pub use replay_engine::{load_trace_file, ReplayEngine, ReplayEngineBuilder};
pub use result_comparison::{RunComparator, RunComparison};
pub use scheduler::{ActionKind, ActionSchedule, ScheduledAction};
pub use serialization::{SnapshotFormat, SnapshotWriter};
pub use sim::SimulatedAllocator;
pub use statistics::Statistics;
pub use traits::{LiveAllocator, LiveResult};
pub use types::{
    Category, FormatVersion, HandleId, LeakReport, PerformanceMetrics, ReplayResult, StatsDigest,
    Verbosity, WarningSummary,
};
