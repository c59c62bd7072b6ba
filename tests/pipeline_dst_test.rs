//! Pipeline DST Tests
//!
//! Deterministic simulation tests (seed-based) for the ingestion pipeline.
//! Each run feeds a generated multi-stream workload through the pipeline
//! into a fault-injecting store and then checks stored objects against the
//! emitted checkpoints.
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, verify basic correctness
//! - **Moderate tests**: Some faults, verify resilience
//! - **Chaos tests**: Many faults, small batches, early disconnects

use objsink::pipeline::{
    run_dst_batch, summarize_batch, OutputFormat, PipelineDSTConfig, PipelineDSTHarness,
};

fn failed_seeds(results: &[objsink::pipeline::PipelineDSTResult]) -> Vec<u64> {
    results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect()
}

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_pipeline_dst_single_calm() {
    let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::calm(12345));

    harness.run().await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert!(result.pipeline_succeeded());
    assert_eq!(result.records_stored, result.records_sent);
}

#[tokio::test]
async fn test_pipeline_dst_single_moderate() {
    let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::moderate(54321));

    harness.run().await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    println!("Store stats: {:?}", result.store_stats);

    assert!(result.is_success(), "{:?}", result.invariant_violations);
}

#[tokio::test]
async fn test_pipeline_dst_single_chaos() {
    let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::chaos(99999));

    harness.run().await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    println!("Store stats: {:?}", result.store_stats);

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.store_stats.put_attempts >= result.objects_stored as u64);
}

// =============================================================================
// Multi-Seed Batch Tests (DST)
// =============================================================================

#[tokio::test]
async fn test_pipeline_dst_100_seeds_calm() {
    let results = run_dst_batch(0, 100, PipelineDSTConfig::calm).await;

    println!("100 Seeds Calm:\n{}", summarize_batch(&results));

    assert!(
        failed_seeds(&results).is_empty(),
        "All calm runs should pass. Failed seeds: {:?}",
        failed_seeds(&results)
    );
    // Calm runs that did not disconnect store every record
    for r in results.iter().filter(|r| !r.disconnected) {
        assert!(r.pipeline_succeeded(), "seed {}: {:?}", r.seed, r.pipeline_error);
        assert_eq!(r.records_stored, r.records_sent, "seed {}", r.seed);
    }
}

#[tokio::test]
async fn test_pipeline_dst_100_seeds_moderate() {
    let results = run_dst_batch(1000, 100, PipelineDSTConfig::moderate).await;

    println!("100 Seeds Moderate:\n{}", summarize_batch(&results));

    assert!(
        failed_seeds(&results).is_empty(),
        "Invariants must hold under faults. Failed seeds: {:?}",
        failed_seeds(&results)
    );
    let succeeded = results.iter().filter(|r| r.pipeline_succeeded()).count();
    assert!(
        succeeded >= 95,
        "Retryable faults should be absorbed by retries. Succeeded: {}/{}",
        succeeded,
        results.len()
    );
}

#[tokio::test]
async fn test_pipeline_dst_50_seeds_chaos() {
    let results = run_dst_batch(2000, 50, PipelineDSTConfig::chaos).await;

    println!("50 Seeds Chaos:\n{}", summarize_batch(&results));

    assert!(
        failed_seeds(&results).is_empty(),
        "Failed seeds: {:?}",
        failed_seeds(&results)
    );
    let injected: u64 = results
        .iter()
        .map(|r| r.store_stats.transient_failures + r.store_stats.throttles)
        .sum();
    assert!(injected > 0, "Chaos mode should inject faults");
}

#[tokio::test]
async fn test_pipeline_dst_20_seeds_each_format() {
    for format in [OutputFormat::Csv, OutputFormat::Segment] {
        let results =
            run_dst_batch(3000, 20, |seed| PipelineDSTConfig::moderate(seed).with_format(format))
                .await;
        println!("20 Seeds {:?}:\n{}", format, summarize_batch(&results));
        assert!(failed_seeds(&results).is_empty(), "{:?}: {:?}", format, failed_seeds(&results));
    }
}

// =============================================================================
// Disconnects
// =============================================================================

#[tokio::test]
async fn test_pipeline_dst_disconnect_stress() {
    let results = run_dst_batch(4000, 30, |seed| {
        let mut config = PipelineDSTConfig::calm(seed);
        config.disconnect_probability = 0.01;
        config
    })
    .await;

    println!("Disconnect Stress:\n{}", summarize_batch(&results));

    assert!(results.iter().any(|r| r.disconnected), "Should have some disconnects");
    assert!(failed_seeds(&results).is_empty());
}

// =============================================================================
// Determinism Verification
// =============================================================================

#[tokio::test]
async fn test_pipeline_dst_determinism() {
    // Workload generation is fully seed-driven
    fn workload(seed: u64) -> (usize, usize, bool) {
        let harness = PipelineDSTHarness::new(PipelineDSTConfig::chaos(seed));
        let w = harness.workload();
        (w.records(), w.steps.len(), w.disconnected)
    }

    let seed = 42424242;
    assert_eq!(workload(seed), workload(seed));
}
