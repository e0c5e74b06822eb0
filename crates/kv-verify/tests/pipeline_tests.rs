//! End-to-end pipeline tests over in-memory stores.
//!
//! Each test seeds a source and a destination, runs the full orchestrator
//! and checks the summary it returns.

use std::sync::Arc;
use std::time::Duration;

use kv_verify::{
    CheckConfig, Key, MemoryStore, Orchestrator, RangePartitioner, Row, RunStatus, ScanProgress,
    TokenDomain, VerifyError,
};
use tokio_util::sync::CancellationToken;

fn seeded_pair(n: usize) -> (Arc<MemoryStore>, Arc<MemoryStore>) {
    let source = Arc::new(MemoryStore::new("source"));
    let destination = Arc::new(MemoryStore::new("destination"));
    for i in 0..n {
        let row = Row::new(format!("user:{}", i), format!("payload-{}", i), Some(86_400));
        source.insert(row.clone());
        destination.insert(row);
    }
    (source, destination)
}

fn small_check() -> CheckConfig {
    CheckConfig {
        token_ranges: 32,
        batch_size: 64,
        origin_read_parallelism: 4,
        target_read_parallelism: 8,
        page_size: 50,
        ..Default::default()
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_identical_stores_are_all_success() {
    let (source, destination) = seeded_pair(1_000);
    let mut check = small_check();
    check.expected_key_count = Some(1_000);

    let summary = Orchestrator::with_stores(source, destination, check)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.totals.success, 1_000);
    assert_eq!(summary.totals.fail, 0);
    assert_eq!(summary.totals.error, 0);
    assert_eq!(summary.rows_scanned, 1_000);
    assert_eq!(summary.ranges_scanned, 32);
    assert!(summary.failed_keys.is_empty());
    assert!(summary.is_clean());
}

#[tokio::test]
async fn test_every_source_key_looked_up_exactly_once() {
    let (source, destination) = seeded_pair(700);

    Orchestrator::with_stores(source.clone(), destination.clone(), small_check())
        .run(CancellationToken::new())
        .await
        .unwrap();

    let counts = destination.lookup_counts();
    assert_eq!(counts.len(), source.len());
    assert!(counts.values().all(|&n| n == 1));
}

#[tokio::test]
async fn test_extra_destination_rows_are_ignored() {
    let (source, destination) = seeded_pair(100);
    destination.insert(Row::new("only-in-destination", "x", None));

    let summary = Orchestrator::with_stores(source, destination.clone(), small_check())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_clean());
    assert_eq!(summary.totals.checked(), 100);
    assert_eq!(destination.lookups_of(&Key::from("only-in-destination")), 0);
}

// =============================================================================
// Mismatches
// =============================================================================

#[tokio::test]
async fn test_single_differing_value_is_one_fail() {
    let (source, destination) = seeded_pair(1_000);
    destination.insert(Row::new("user:417", "corrupted", Some(86_400)));

    let summary = Orchestrator::with_stores(source, destination, small_check())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.totals.success, 999);
    assert_eq!(summary.totals.fail, 1);
    assert_eq!(summary.totals.error, 0);
    assert_eq!(summary.failed_keys, vec![Key::from("user:417")]);
    assert!(!summary.is_clean());
}

#[tokio::test]
async fn test_missing_and_ttl_drift_rows_fail() {
    let (source, destination) = seeded_pair(200);
    destination.remove(&Key::from("user:3"));
    destination.insert(Row::new("user:4", "payload-4", Some(86_399)));

    let summary = Orchestrator::with_stores(source.clone(), destination.clone(), small_check())
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.totals.fail, 2);

    let mut failed: Vec<String> = summary.failed_keys.iter().map(|k| k.to_string()).collect();
    failed.sort();
    assert_eq!(failed, vec!["user:3", "user:4"]);

    // A one-second tolerance accepts the drifted ttl but not the missing row.
    let mut tolerant = small_check();
    tolerant.ttl_tolerance_secs = Some(1);
    let summary = Orchestrator::with_stores(source, destination, tolerant)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.totals.fail, 1);
    assert_eq!(summary.failed_keys, vec![Key::from("user:3")]);
}

#[tokio::test]
async fn test_stalled_lookup_times_out_without_blocking_batch() {
    let (source, destination) = seeded_pair(512);
    destination.stall_lookup("user:99", Duration::from_secs(30));

    let check = CheckConfig {
        token_ranges: 1,
        batch_size: 512,
        origin_read_parallelism: 1,
        target_read_parallelism: 1,
        page_size: 1_000,
        lookup_timeout_ms: Some(50),
        ..Default::default()
    };

    let summary = Orchestrator::with_stores(source, destination, check)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.totals.error, 1);
    assert_eq!(summary.totals.success, 511);
    assert_eq!(summary.totals.fail, 0);
    assert_eq!(summary.failed_keys, vec![Key::from("user:99")]);
}

#[tokio::test]
async fn test_failing_lookup_counts_as_error() {
    let (source, destination) = seeded_pair(300);
    destination.fail_lookup("user:12");
    destination.fail_lookup("user:250");

    let summary = Orchestrator::with_stores(source, destination, small_check())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.totals.error, 2);
    assert_eq!(summary.totals.success, 298);
    assert_eq!(summary.status, RunStatus::Completed);
}

// =============================================================================
// Scan failures
// =============================================================================

#[tokio::test]
async fn test_failed_range_is_abandoned_and_reported() {
    let (source, destination) = seeded_pair(1_000);
    let check = small_check();

    let victim = source.token_of(&Key::from("user:500")).unwrap();
    let partitioner = RangePartitioner::new(TokenDomain::FULL, check.token_ranges).unwrap();
    let range = partitioner
        .ranges()
        .find(|r| r.contains(victim))
        .unwrap();
    let rows_in_range = source.count_in_range(&range) as u64;
    source.fail_scan_at(victim, 0);

    let summary = Orchestrator::with_stores(source, destination.clone(), check)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.ranges_failed, 1);
    assert_eq!(summary.ranges_scanned, 31);
    assert_eq!(summary.failed_ranges.len(), 1);
    assert_eq!(summary.failed_ranges[0].range, range);
    assert_eq!(summary.totals.success, 1_000 - rows_in_range);
    assert_eq!(destination.lookups_of(&Key::from("user:500")), 0);
    assert!(!summary.is_clean());
}

// =============================================================================
// Cancellation and faults
// =============================================================================

#[tokio::test]
async fn test_cancellation_ends_run_quietly() {
    let source = Arc::new(MemoryStore::new("source").with_latency(Duration::from_millis(5)));
    let destination = Arc::new(MemoryStore::new("destination"));
    for i in 0..5_000 {
        let row = Row::new(format!("k{}", i), "v", None);
        source.insert(row.clone());
        destination.insert(row);
    }

    let check = CheckConfig {
        token_ranges: 1_000,
        page_size: 10,
        ..small_check()
    };
    let orchestrator = Orchestrator::with_stores(source, destination, check);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(cancel))
        .await
        .expect("run should stop promptly after cancellation")
        .unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert!(summary.ranges_scanned < 1_000);
    assert!(!summary.is_clean());
}

#[tokio::test]
async fn test_invalid_domain_is_config_error() {
    let (source, destination) = seeded_pair(1);
    let check = CheckConfig {
        token_min: Some(5),
        token_max: Some(1),
        ..small_check()
    };

    let err = Orchestrator::with_stores(source, destination, check)
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Config(_)));
}

#[tokio::test]
async fn test_zero_sized_settings_are_config_errors() {
    for check in [
        CheckConfig {
            origin_read_parallelism: 0,
            ..small_check()
        },
        CheckConfig {
            target_read_parallelism: 0,
            ..small_check()
        },
        CheckConfig {
            batch_size: 0,
            ..small_check()
        },
        CheckConfig {
            status_interval_secs: 0,
            ..small_check()
        },
    ] {
        let (source, destination) = seeded_pair(10);
        let err = Orchestrator::with_stores(source, destination.clone(), check)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Config(_)), "got {:?}", err);
        assert_eq!(destination.lookup_calls(), 0);
    }
}

#[tokio::test]
async fn test_restricted_domain_only_checks_its_tokens() {
    let (source, destination) = seeded_pair(1_000);
    let check = CheckConfig {
        token_min: Some(0),
        token_max: Some(i64::MAX),
        ..small_check()
    };
    let expected = source.count_in_range(&kv_verify::TokenRange::new(0, i64::MAX)) as u64;

    let summary = Orchestrator::with_stores(source, destination, check)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.totals.success, expected);
    assert_eq!(summary.rows_scanned, expected);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_stalled_verifiers_hold_back_the_scanners() {
    let source = Arc::new(MemoryStore::new("source"));
    let destination =
        Arc::new(MemoryStore::new("destination").with_latency(Duration::from_secs(60)));
    for i in 0..2_000 {
        let row = Row::new(format!("k{}", i), "v", None);
        source.insert(row.clone());
        destination.insert(row);
    }

    let check = CheckConfig {
        token_ranges: 8,
        batch_size: 8,
        origin_read_parallelism: 2,
        target_read_parallelism: 2,
        page_size: 16,
        ..Default::default()
    };
    // Row queue, batch queue, batches held by verifiers, and the batcher's
    // pending batch.
    let bound = (check.row_queue_capacity()
        + check.batch_size * (2 * check.target_read_parallelism + 1)) as u64;
    let row_queue = check.row_queue_capacity() as u64;

    let progress = Arc::new(ScanProgress::new());
    let orchestrator = Orchestrator::with_stores(source, destination, check)
        .with_progress(progress.clone());
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    let mut peak = 0;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        peak = peak.max(progress.rows_scanned());
    }
    assert!(peak >= row_queue, "pipeline never filled: {}", peak);
    assert!(peak <= bound, "scanned {} rows past a bound of {}", peak, bound);

    cancel.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run should stop promptly after cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert!(summary.rows_scanned <= bound);
    assert_eq!(summary.totals.checked(), 0);
}
