use alloc_replay::{
    Operation, ReplayEngine, ReplayOptions, ReplayResult, RunComparator, SimulatedAllocator,
};

const TRACE: &str = "FMT\n1,8\n\
                     0,0.0,0,CreatePool,1,0,1048576,0,1,0,0xA\n\
                     0,0.0,0,AllocateMemory,4096,256,15,0,1,0,0,0,0xA,0xB\n\
                     0,0.0,0,AllocateMemory,8192,256,15,0,1,0,0,0,0,0xC\n\
                     0,0.0,0,FreeMemory,0xB\n\
                     0,0.0,0,FreeMemory,0xC\n\
                     0,0.0,0,DestroyPool,0xA\n";

fn run(live: SimulatedAllocator) -> ReplayResult {
    let options = ReplayOptions::builder().with_format_tag("FMT").build().unwrap();
    ReplayEngine::new(live, options).unwrap().replay(TRACE.as_bytes()).unwrap()
}

#[test]
fn test_repeated_iterations_are_identical() {
    let comparator = RunComparator::new();
    let baseline = run(SimulatedAllocator::new());
    for _ in 0..3 {
        let comparison = comparator.compare(&baseline, &run(SimulatedAllocator::new()));
        assert!(comparison.are_identical(), "{}", comparison.summary());
        assert!(comparison.call_differences.is_empty());
        assert!(comparison.summary().starts_with("Runs are identical"));
    }
}

#[test]
fn test_divergent_live_behavior_is_detected() {
    let baseline = run(SimulatedAllocator::new());
    // The second allocation fails live, so its free warns and the digests
    // no longer agree.
    let diverged = run(SimulatedAllocator::new().with_forced_failures([3]));
    let comparison = RunComparator::new().compare(&baseline, &diverged);

    assert!(!comparison.are_identical());
    assert!(!comparison.warnings_match);
    assert!(comparison.call_counts_match);
    assert!(comparison.summary().contains("warning counts differ"));
}

#[test]
fn test_call_count_differences_name_the_operation() {
    let baseline = run(SimulatedAllocator::new());
    let options = ReplayOptions::builder()
        .with_format_tag("FMT")
        .with_lines("1-5")
        .build()
        .unwrap();
    let partial = ReplayEngine::new(SimulatedAllocator::new(), options)
        .unwrap()
        .replay(TRACE.as_bytes())
        .unwrap();

    let comparison = RunComparator::new().compare(&baseline, &partial);
    let operations: Vec<Operation> =
        comparison.call_differences.iter().map(|d| d.operation).collect();
    assert_eq!(operations, vec![Operation::DestroyPool, Operation::FreeMemory]);
    assert!(!comparison.leaks_match);
}
