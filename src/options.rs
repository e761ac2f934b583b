//! Replay options
//!
//! [`ReplayOptions`] is what the library reads. It can be assembled with
//! [`ReplayOptionsBuilder`], deserialized from JSON, or filled in by the
//! command line front end.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::error::CommandLineError;
use crate::header::DEFAULT_FORMAT_TAG;
use crate::live::ExtensionToggles;
use crate::logging::DEFAULT_MAX_PRINTED_WARNINGS;
use crate::range_filter::RangeSet;
use crate::serialization::SnapshotFormat;
use crate::types::Verbosity;

/// File name prefix of snapshot artifacts
pub const DEFAULT_SNAPSHOT_PREFIX: &str = "AllocReplay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayOptions {
    pub verbosity: Verbosity,
    /// Number of complete replays of the trace
    pub iterations: u32,
    /// Line range list; empty replays every line
    pub lines: String,
    pub physical_device_index: usize,
    pub extensions: ExtensionToggles,
    /// Forward recorded user data and pool names to the live API
    pub user_data: bool,
    pub dump_stats_after_lines: Vec<usize>,
    pub dump_detailed_stats_after_lines: Vec<usize>,
    pub defragment_after_lines: Vec<usize>,
    pub defragmentation_flags: u32,
    pub max_printed_warnings: usize,
    /// Destroy objects still alive at the end of the trace
    pub cleanup_leaks: bool,
    pub output_dir: PathBuf,
    pub snapshot_prefix: String,
    pub snapshot_format: SnapshotFormat,
    pub format_tag: String,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Default,
            iterations: 1,
            lines: String::new(),
            physical_device_index: 0,
            extensions: ExtensionToggles::default(),
            user_data: true,
            dump_stats_after_lines: Vec::new(),
            dump_detailed_stats_after_lines: Vec::new(),
            defragment_after_lines: Vec::new(),
            defragmentation_flags: 0,
            max_printed_warnings: DEFAULT_MAX_PRINTED_WARNINGS,
            cleanup_leaks: true,
            output_dir: PathBuf::from("."),
            snapshot_prefix: DEFAULT_SNAPSHOT_PREFIX.to_string(),
            snapshot_format: SnapshotFormat::Json,
            format_tag: DEFAULT_FORMAT_TAG.to_string(),
        }
    }
}

impl ReplayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ReplayOptionsBuilder {
        ReplayOptionsBuilder::new()
    }

    /// Load options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, CommandLineError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| CommandLineError::InvalidOptions {
                reason: e.to_string(),
            })?;
        options.validate()?;
        Ok(options)
    }

    /// Check option consistency and return the parsed line filter
    pub fn validate(&self) -> Result<RangeSet, CommandLineError> {
        if self.iterations == 0 {
            return Err(CommandLineError::InvalidValue {
                option: "iterations".to_string(),
                value: "0".to_string(),
            });
        }
        if self.format_tag.is_empty() {
            return Err(CommandLineError::InvalidOptions {
                reason: "format tag must not be empty".to_string(),
            });
        }
        if self.snapshot_prefix.is_empty() {
            return Err(CommandLineError::InvalidOptions {
                reason: "snapshot prefix must not be empty".to_string(),
            });
        }

        let line_lists = [
            ("dump-stats-after-line", &self.dump_stats_after_lines),
            ("dump-detailed-stats-after-line", &self.dump_detailed_stats_after_lines),
            ("defragment-after-line", &self.defragment_after_lines),
        ];
        for (option, lines) in line_lists {
            if lines.contains(&0) {
                return Err(CommandLineError::InvalidValue {
                    option: option.to_string(),
                    value: "0".to_string(),
                });
            }
        }

        self.range_set()
    }

    pub fn range_set(&self) -> Result<RangeSet, CommandLineError> {
        Ok(RangeSet::parse(&self.lines)?)
    }
}

/// Fluent construction of [`ReplayOptions`]
#[derive(Debug, Clone, Default)]
pub struct ReplayOptionsBuilder {
    options: ReplayOptions,
}

impl ReplayOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.options.verbosity = verbosity;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.options.iterations = iterations;
        self
    }

    pub fn with_lines(mut self, lines: impl Into<String>) -> Self {
        self.options.lines = lines.into();
        self
    }

    pub fn with_physical_device(mut self, index: usize) -> Self {
        self.options.physical_device_index = index;
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionToggles) -> Self {
        self.options.extensions = extensions;
        self
    }

    pub fn with_user_data(mut self, enabled: bool) -> Self {
        self.options.user_data = enabled;
        self
    }

    pub fn with_stats_dumps(mut self, lines: impl IntoIterator<Item = usize>) -> Self {
        self.options.dump_stats_after_lines.extend(lines);
        self
    }

    pub fn with_detailed_stats_dumps(mut self, lines: impl IntoIterator<Item = usize>) -> Self {
        self.options.dump_detailed_stats_after_lines.extend(lines);
        self
    }

    pub fn with_defragmentations(mut self, lines: impl IntoIterator<Item = usize>) -> Self {
        self.options.defragment_after_lines.extend(lines);
        self
    }

    pub fn with_defragmentation_flags(mut self, flags: u32) -> Self {
        self.options.defragmentation_flags = flags;
        self
    }

    pub fn with_max_printed_warnings(mut self, max: usize) -> Self {
        self.options.max_printed_warnings = max;
        self
    }

    pub fn with_cleanup(mut self, enabled: bool) -> Self {
        self.options.cleanup_leaks = enabled;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.output_dir = dir.into();
        self
    }

    pub fn with_snapshot_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.snapshot_prefix = prefix.into();
        self
    }

    pub fn with_snapshot_format(mut self, format: SnapshotFormat) -> Self {
        self.options.snapshot_format = format;
        self
    }

    pub fn with_format_tag(mut self, tag: impl Into<String>) -> Self {
        self.options.format_tag = tag.into();
        self
    }

    pub fn build(self) -> Result<ReplayOptions, CommandLineError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Parse `on`/`off` (also `1`/`0`, `true`/`false`)
pub fn parse_toggle(value: &str) -> Result<bool, CommandLineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(CommandLineError::InvalidValue {
            option: "toggle".to_string(),
            value: value.to_string(),
        }),
    }
}
