//! alloc-replay command line front end

use alloc_replay::options::parse_toggle;
use alloc_replay::{
    load_trace_file, CommandLineError, ExitCode, ReplayEngine, ReplayError, ReplayOptions,
    ReplayResult, RunComparator, SimulatedAllocator, SnapshotFormat, StatisticsHasher, Verbosity,
};
use clap::error::ErrorKind;
use clap::Parser;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alloc-replay")]
#[command(version, about = "Replay a recorded GPU memory allocator call trace", long_about = None)]
struct Cli {
    /// Recorded trace file
    file: PathBuf,

    /// 0 minimum, 1 default, 2 maximum
    #[arg(short, long)]
    verbosity: Option<u8>,

    /// Number of complete replays
    #[arg(short, long)]
    iterations: Option<u32>,

    /// Line ranges to replay, e.g. "10-20,30-"
    #[arg(long)]
    lines: Option<String>,

    #[arg(long)]
    physical_device: Option<usize>,

    #[arg(long, value_parser = parse_toggle)]
    dedicated_allocation: Option<bool>,

    #[arg(long, value_parser = parse_toggle)]
    bind_memory2: Option<bool>,

    #[arg(long, value_parser = parse_toggle)]
    memory_budget: Option<bool>,

    /// Forward recorded user data and pool names
    #[arg(long, value_parser = parse_toggle)]
    user_data: Option<bool>,

    #[arg(long, value_delimiter = ',')]
    dump_stats_after_line: Vec<usize>,

    #[arg(long, value_delimiter = ',')]
    dump_detailed_stats_after_line: Vec<usize>,

    #[arg(long, value_delimiter = ',')]
    defragment_after_line: Vec<usize>,

    #[arg(long)]
    defragmentation_flags: Option<u32>,

    /// Warnings printed before the rest are only counted
    #[arg(long)]
    max_warnings: Option<usize>,

    /// Leave objects the trace never destroyed alive
    #[arg(long)]
    no_cleanup: bool,

    /// Directory for statistics snapshots
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, value_parser = parse_snapshot_format)]
    snapshot_format: Option<SnapshotFormat>,

    /// Expected first line of the trace
    #[arg(long)]
    format_tag: Option<String>,

    /// JSON options file; command line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed of the simulated allocator's failure injection
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Probability that a simulated creating call fails
    #[arg(long, default_value_t = 0.0)]
    fail_rate: f64,
}

fn parse_snapshot_format(value: &str) -> Result<SnapshotFormat, CommandLineError> {
    SnapshotFormat::from_name(value).ok_or_else(|| CommandLineError::InvalidValue {
        option: "snapshot-format".to_string(),
        value: value.to_string(),
    })
}

impl Cli {
    /// Options file first, then every flag given on the command line
    fn options(&self) -> Result<ReplayOptions, CommandLineError> {
        let mut options = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| CommandLineError::InvalidValue {
                    option: "config".to_string(),
                    value: format!("{} ({})", path.display(), e),
                })?;
                ReplayOptions::from_json(&text)?
            }
            None => ReplayOptions::default(),
        };

        if let Some(level) = self.verbosity {
            options.verbosity =
                Verbosity::from_level(level).ok_or_else(|| CommandLineError::InvalidValue {
                    option: "verbosity".to_string(),
                    value: level.to_string(),
                })?;
        }
        if let Some(iterations) = self.iterations {
            options.iterations = iterations;
        }
        if let Some(lines) = &self.lines {
            options.lines = lines.clone();
        }
        if let Some(index) = self.physical_device {
            options.physical_device_index = index;
        }
        if let Some(enabled) = self.dedicated_allocation {
            options.extensions.dedicated_allocation = enabled;
        }
        if let Some(enabled) = self.bind_memory2 {
            options.extensions.bind_memory2 = enabled;
        }
        if let Some(enabled) = self.memory_budget {
            options.extensions.memory_budget = enabled;
        }
        if let Some(enabled) = self.user_data {
            options.user_data = enabled;
        }
        options
            .dump_stats_after_lines
            .extend(&self.dump_stats_after_line);
        options
            .dump_detailed_stats_after_lines
            .extend(&self.dump_detailed_stats_after_line);
        options
            .defragment_after_lines
            .extend(&self.defragment_after_line);
        if let Some(flags) = self.defragmentation_flags {
            options.defragmentation_flags = flags;
        }
        if let Some(max) = self.max_warnings {
            options.max_printed_warnings = max;
        }
        if self.no_cleanup {
            options.cleanup_leaks = false;
        }
        if let Some(dir) = &self.output_dir {
            options.output_dir = dir.clone();
        }
        if let Some(format) = self.snapshot_format {
            options.snapshot_format = format;
        }
        if let Some(tag) = &self.format_tag {
            options.format_tag = tag.clone();
        }

        if !(0.0..=1.0).contains(&self.fail_rate) {
            return Err(CommandLineError::InvalidValue {
                option: "fail-rate".to_string(),
                value: self.fail_rate.to_string(),
            });
        }
        options.validate()?;
        Ok(options)
    }
}

fn init_tracing(verbosity: Verbosity) {
    let default_level = match verbosity {
        Verbosity::Minimum => "error",
        Verbosity::Default => "info",
        Verbosity::Maximum => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run(cli: &Cli, options: ReplayOptions) -> Result<(), ReplayError> {
    let data = load_trace_file(&cli.file)?;
    let comparator = RunComparator::new();
    let mut baseline: Option<ReplayResult> = None;
    let mut digests = Vec::new();

    for iteration in 1..=options.iterations {
        let live = SimulatedAllocator::for_device(options.physical_device_index)?
            .with_seed(cli.seed)
            .with_fail_rate(cli.fail_rate)
            .with_extensions(options.extensions);
        let mut engine = ReplayEngine::new(live, options.clone())?;
        let result = engine.replay(&data)?;
        tracing::info!(
            "Iteration {}: {} lines in {} ms, digest {}",
            iteration,
            result.statistics.lines_dispatched,
            result.performance_metrics.total_duration_ms,
            result.digest
        );
        digests.push(result.digest);

        match &baseline {
            Some(first) => {
                let comparison = comparator.compare(first, &result);
                if comparison.are_identical() {
                    tracing::debug!("Iteration {}: {}", iteration, comparison.summary());
                } else {
                    tracing::warn!("Iteration {}: {}", iteration, comparison.summary());
                }
            }
            None => baseline = Some(result),
        }
    }

    if digests.len() > 1 {
        tracing::info!("Combined digest {}", StatisticsHasher::new().hash_chain(&digests));
    }
    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::Success,
                _ => ExitCode::CommandLine,
            };
            let _ = error.print();
            std::process::exit(code.as_i32());
        }
    };

    let options = cli.options();
    init_tracing(options.as_ref().map_or(Verbosity::Default, |o| o.verbosity));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let options = options.map_err(ReplayError::from)?;
        run(&cli, options)
    }));
    let code = match outcome {
        Ok(Ok(())) => ExitCode::Success,
        Ok(Err(error)) => {
            tracing::error!("{}", error);
            ExitCode::from(&error)
        }
        Err(_) => {
            tracing::error!("Internal error");
            ExitCode::Internal
        }
    };
    std::process::exit(code.as_i32());
}
