use alloc_replay::{
    Category, Operation, ReplayEngine, ReplayError, ReplayOptions, SimulatedAllocator, Verbosity,
};
use proptest::prelude::*;

const EXAMPLE: &str =
    "FMT\n1,8\n0,0.0,0,CreatePool,0,0,1048576,1,1,0,0xA\n0,0.1,0,DestroyPool,0xA\n";

fn options() -> ReplayOptions {
    ReplayOptions::builder().with_format_tag("FMT").build().unwrap()
}

fn engine_with(options: ReplayOptions) -> ReplayEngine<SimulatedAllocator> {
    ReplayEngine::new(SimulatedAllocator::new(), options).unwrap()
}

/// One generated trace step: `kind` picks the call, `value` sizes it
#[derive(Debug, Clone, Copy)]
struct Step {
    kind: u8,
    value: u64,
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec((0u8..6, 1u64..512).prop_map(|(kind, value)| Step { kind, value }), 0..80)
}

/// Build a well-formed trace. With `close_all` every created object is
/// destroyed before the end.
fn build_trace(steps: &[Step], close_all: bool) -> String {
    let mut out = String::from("FMT\n1,8\n0,0.000,0,CreateAllocator\n");
    let mut next_id = 0x100u64;
    let mut allocations: Vec<(u64, bool)> = Vec::new();
    let mut pools: Vec<u64> = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        let time = format!("{}.{:03}", index / 1000, index % 1000);
        match step.kind {
            0 | 1 => {
                let id = next_id;
                next_id += 1;
                out.push_str(&format!(
                    "1,{},0,AllocateMemory,{},16,15,0,1,0,0,0,0,{:#x},\n",
                    time,
                    step.value * 64,
                    id
                ));
                allocations.push((id, false));
            }
            2 => {
                let id = next_id;
                next_id += 1;
                out.push_str(&format!(
                    "2,{},0,CreateBuffer,0,{},130,0,0,1,0,0,0,0,{:#x}\n",
                    time,
                    step.value * 256,
                    id
                ));
                allocations.push((id, true));
            }
            3 => {
                let id = next_id;
                next_id += 1;
                out.push_str(&format!("1,{},0,CreatePool,1,0,1048576,0,4,0,{:#x}\n", time, id));
                pools.push(id);
            }
            4 => {
                if let Some((id, is_buffer)) = allocations.pop() {
                    let operation = if is_buffer { "DestroyBuffer" } else { "FreeMemory" };
                    out.push_str(&format!("1,{},0,{},{:#x}\n", time, operation, id));
                }
            }
            _ => {
                out.push_str(&format!(
                    "1,{},{},SetCurrentFrameIndex,{}\n",
                    time, step.value, step.value
                ));
            }
        }
    }

    if close_all {
        for (id, is_buffer) in allocations.into_iter().rev() {
            let operation = if is_buffer { "DestroyBuffer" } else { "FreeMemory" };
            out.push_str(&format!("1,9.000,0,{},{:#x}\n", operation, id));
        }
        for id in pools {
            out.push_str(&format!("1,9.000,0,DestroyPool,{:#x}\n", id));
        }
    }
    out.push_str("0,9.999,0,DestroyAllocator\n");
    out
}

fn data_line_count(trace: &str) -> u64 {
    trace.lines().skip(2).filter(|line| !line.trim().is_empty()).count() as u64
}

#[test]
fn test_create_and_destroy_pool_example() {
    let mut engine = engine_with(options());
    let result = engine.replay(EXAMPLE.as_bytes()).unwrap();

    assert_eq!(engine.identity().len(Category::Pool), 0);
    assert_eq!(result.warnings.total, 0);
    assert_eq!(result.statistics.pools.count, 1);
    assert_eq!(result.format_version.minor, 8);
    assert!(result.config_mismatches.is_empty());
}

#[test]
fn test_crlf_trace_replays_like_lf() {
    let crlf = EXAMPLE.replace('\n', "\r\n");
    let lf = engine_with(options()).replay(EXAMPLE.as_bytes()).unwrap();
    let cr = engine_with(options()).replay(crlf.as_bytes()).unwrap();
    assert_eq!(lf.digest, cr.digest);
    assert_eq!(cr.warnings.total, 0);
}

#[test]
fn test_default_format_tag() {
    let trace = EXAMPLE.replace("FMT", "Vulkan Memory Allocator,Calls recording");
    let mut engine = engine_with(ReplayOptions::default());
    let result = engine.replay(trace.as_bytes()).unwrap();
    assert_eq!(result.statistics.call_count(Operation::DestroyPool), 1);
}

#[test]
fn test_line_filter_skips_but_counts_lines() {
    let options = ReplayOptions::builder().with_format_tag("FMT").with_lines("4-").build().unwrap();
    let mut engine = engine_with(options);
    let result = engine.replay(EXAMPLE.as_bytes()).unwrap();

    // The CreatePool on line 3 is skipped, so the destroy names an unknown pool.
    assert_eq!(result.statistics.lines_skipped, 1);
    assert_eq!(result.statistics.lines_dispatched, 1);
    assert_eq!(result.statistics.call_count(Operation::CreatePool), 0);
    assert_eq!(result.warnings.total, 1);
}

#[test]
fn test_malformed_lines_only_warn() {
    let trace = "FMT\n1,8\n\
                 0,0.0\n\
                 0,0.0,0,NoSuchCall,1\n\
                 0,0.0,0,CreatePool,0,0\n\
                 0,0.0,0,CreatePool,x,0,1048576,1,1,0,0xA\n\
                 0,0.0,0,DestroyPool,0xB\n";
    let mut engine = engine_with(options());
    let result = engine.replay(trace.as_bytes()).unwrap();

    assert_eq!(result.warnings.total, 5);
    assert_eq!(result.statistics.lines_dispatched, 5);
    assert_eq!(result.statistics.pools.count, 0);
}

#[test]
fn test_minimum_verbosity_still_counts_warnings() {
    let options = ReplayOptions::builder()
        .with_format_tag("FMT")
        .with_verbosity(Verbosity::Minimum)
        .build()
        .unwrap();
    let mut engine = engine_with(options);
    let trace = b"FMT\n1,8\n0,0.0,0,DestroyPool,0xA\n0,0.0,0,FreeMemory,0xB\n";
    let result = engine.replay(trace).unwrap();

    assert_eq!(result.warnings.total, 2);
    assert_eq!(result.warnings.printed, 0);
}

#[test]
fn test_warning_throttle() {
    let options = ReplayOptions::builder()
        .with_format_tag("FMT")
        .with_max_printed_warnings(3)
        .build()
        .unwrap();
    let mut trace = String::from("FMT\n1,8\n");
    for id in 1..=10 {
        trace.push_str(&format!("0,0.0,0,FreeMemory,{:#x}\n", id));
    }
    let result = engine_with(options).replay(trace.as_bytes()).unwrap();

    assert_eq!(result.warnings.total, 10);
    assert_eq!(result.warnings.printed, 3);
    assert_eq!(result.warnings.suppressed, 7);
}

#[test]
fn test_images_and_dedicated_allocations() {
    let trace = "FMT\n1,8\n\
                 0,0.0,0,CreateImage,0,1,37,256,256,1,1,1,1,0,6,0,0,0,1,0,0,0,0,0x10,\n\
                 0,0.0,0,AllocateMemoryForImage,1048576,1024,15,1,1,0,1,0,0,0,0,0x11\n\
                 0,0.0,0,AllocateMemoryForBuffer,65536,256,15,0,0,0,3,0,0,0,0,0x12,tag\n\
                 0,0.0,0,DestroyImage,0x10\n\
                 0,0.0,0,FreeMemory,0x11\n\
                 0,0.0,0,FreeMemory,0x12\n";
    let mut engine = engine_with(options());
    let result = engine.replay(trace.as_bytes()).unwrap();

    assert_eq!(result.warnings.total, 0);
    assert_eq!(result.statistics.images.count, 1);
    assert_eq!(result.statistics.allocations.count, 2);
    assert_eq!(result.leaks.total(), 0);
    assert_eq!(engine.live().image_count(), 0);
    assert_eq!(engine.live().allocation_count(), 0);
}

#[test]
fn test_fatal_error_reports_line() {
    let live = SimulatedAllocator::new().with_device_lost_after(0);
    let mut engine = ReplayEngine::new(live, options()).unwrap();
    let result = engine.replay(EXAMPLE.as_bytes());
    assert!(matches!(result, Err(ReplayError::LiveApi { line: 3, .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying the same trace twice against fresh allocators gives the
    /// same statistics, digest and warning count.
    #[test]
    fn property_replay_is_idempotent(steps in arb_steps()) {
        let trace = build_trace(&steps, false);
        let first = engine_with(options()).replay(trace.as_bytes()).unwrap();
        let second = engine_with(options()).replay(trace.as_bytes()).unwrap();

        prop_assert_eq!(first.digest, second.digest);
        prop_assert_eq!(&first.statistics, &second.statistics);
        prop_assert_eq!(first.warnings, second.warnings);
        prop_assert_eq!(first.leaks, second.leaks);
    }

    /// Every non-blank data line is either dispatched or skipped.
    #[test]
    fn property_dispatched_line_count(steps in arb_steps(), from in 1usize..40) {
        let trace = build_trace(&steps, true);
        let lines = format!("{}-", from);
        let options = ReplayOptions::builder()
            .with_format_tag("FMT")
            .with_lines(lines)
            .build()
            .unwrap();
        let result = engine_with(options).replay(trace.as_bytes()).unwrap();

        let total = data_line_count(&trace);
        let statistics = &result.statistics;
        prop_assert_eq!(statistics.lines_dispatched + statistics.lines_skipped, total);
        let expected_skipped = (from.saturating_sub(3) as u64).min(total);
        prop_assert_eq!(result.statistics.lines_skipped, expected_skipped);
    }

    /// A trace that destroys everything it creates leaves nothing behind,
    /// even without end-of-run cleanup.
    #[test]
    fn property_create_destroy_round_trip(steps in arb_steps()) {
        let trace = build_trace(&steps, true);
        let options = ReplayOptions::builder()
            .with_format_tag("FMT")
            .with_cleanup(false)
            .build()
            .unwrap();
        let mut engine = engine_with(options);
        let result = engine.replay(trace.as_bytes()).unwrap();

        prop_assert_eq!(result.warnings.total, 0);
        prop_assert_eq!(result.leaks.total(), 0);
        prop_assert!(engine.identity().is_empty());
        prop_assert_eq!(engine.live().live_object_count(), 0);
    }
}
