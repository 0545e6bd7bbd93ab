//! End-to-end scenarios for the capture engine against the in-memory source.
//!
//! Run with:
//!   cargo test -p rivven-backfill --test engine_scenarios

mod common;

use common::*;
use rivven_backfill::checkpoint::{FileCheckpointSink, MemoryCheckpointSink};
use rivven_backfill::common::{ChangeOp, KeyRange, RowKey, TableId};
use rivven_backfill::memory::{MemorySink, MemorySource};
use rivven_backfill::{Capabilities, CdcError, LateDiscoveryPolicy, StartupMode};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Snapshot phase
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_keys_make_ten_splits_and_concurrent_delete_is_honored() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 1000);

    let deleted = Arc::new(AtomicBool::new(false));
    let flag = deleted.clone();
    source.set_scan_hook(move |src: &MemorySource, table: &TableId, range: &KeyRange| {
        if range.contains(&RowKey::int(150)) && !flag.swap(true, Ordering::SeqCst) {
            src.delete(table, RowKey::int(150));
        }
    });

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .chunk_size(100)
        .parallelism(4)
        .startup_mode(StartupMode::SnapshotOnly)
        .build()
        .unwrap();

    start_in_memory(config, &source, &sink, &checkpoints)
        .join()
        .await
        .unwrap();

    assert!(deleted.load(Ordering::SeqCst));
    let state = checkpoints.latest().unwrap();
    let ranges: Vec<KeyRange> = state.splits_of(&products()).map(|s| s.range.clone()).collect();
    assert_eq!(ranges.len(), 10);
    assert_eq!(ranges[0], KeyRange::new(None, Some(RowKey::int(100))));
    assert_eq!(
        ranges[1],
        KeyRange::new(Some(RowKey::int(100)), Some(RowKey::int(200)))
    );
    assert_eq!(ranges[9], KeyRange::new(Some(RowKey::int(900)), None));
    assert!(state.all_finished());

    let output = sink.final_state();
    assert!(!output.contains_key(&(products(), RowKey::int(150))));
    assert_eq!(output.len(), 999);
    assert_eq!(output, source_state(&source, &[products()]));
    assert!(sink.events().iter().all(|e| e.op == ChangeOp::Insert));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_split_mode_snapshots_whole_table() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 300);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .parallel_snapshot(false)
        .startup_mode(StartupMode::SnapshotOnly)
        .build()
        .unwrap();

    start_in_memory(config, &source, &sink, &checkpoints)
        .join()
        .await
        .unwrap();

    let state = checkpoints.latest().unwrap();
    assert_eq!(state.splits.len(), 1);
    assert!(state.splits[0].range.is_unbounded());
    assert_eq!(sink.len(), 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_scan_failures_are_retried() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 200);
    source.fail_next_scans(2);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .chunk_size(50)
        .parallelism(2)
        .max_retries(3)
        .startup_mode(StartupMode::SnapshotOnly)
        .build()
        .unwrap();

    let running = start_in_memory(config, &source, &sink, &checkpoints);
    let handle = running.handle.clone();
    running.join().await.unwrap();

    let stats = handle.stats();
    assert_eq!(stats.splits_failed, 2);
    assert_eq!(stats.splits_finished, 4);
    assert_eq!(sink.final_state(), source_state(&source, &[products()]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_halt_the_engine() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 20);
    source.fail_next_scans(100);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .parallelism(1)
        .max_retries(1)
        .startup_mode(StartupMode::SnapshotOnly)
        .build()
        .unwrap();

    let err = start_in_memory(config, &source, &sink, &checkpoints)
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, CdcError::SplitExecution { .. }));
    // nothing may be checkpointed after a fatal error
    assert!(checkpoints.latest().is_none());
    assert!(sink.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_backfill_buffer_throttles_tail_and_converges() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 300);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .chunk_size(100)
        .parallelism(3)
        .backfill_buffer_size(2)
        .build()
        .unwrap();
    let capabilities = Capabilities {
        scanner: Arc::new(SlowScanner::new(source.clone(), Duration::from_millis(2))),
        log: Arc::new(source.clone()),
        sink: Arc::new(sink.clone()),
        checkpoints: checkpoints.clone(),
    };
    let running = start(config, capabilities);

    // many distinct keys change while the scans are still running
    for i in 0..200i64 {
        let key = (i * 7) % 300 + 1;
        if i % 4 == 0 {
            source.delete(&products(), RowKey::int(key));
        } else {
            source.update(&products(), RowKey::int(key), row(key, i as u32));
        }
        if i % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }

    assert!(stream_started(&running.handle).await);
    assert!(converges(&source, &sink, &[products()]).await);
    let handle = running.handle.clone();
    running.stop().await.unwrap();
    let splits = checkpoints.latest().unwrap().splits.len() as u64;
    assert!(splits > 1);
    assert_eq!(handle.stats().splits_finished, splits);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_watermark_regression_is_fatal() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 10);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config().parallelism(1).build().unwrap();
    // startup, discovery and the low watermark read honestly; the high one goes back
    let capabilities = Capabilities {
        scanner: Arc::new(source.clone()),
        log: Arc::new(RewindingLog::new(source.clone(), 3, 5)),
        sink: Arc::new(sink.clone()),
        checkpoints: checkpoints.clone(),
    };
    let running = start(config, capabilities);
    let handle = running.handle.clone();

    let err = running.join().await.unwrap_err();
    assert!(matches!(err, CdcError::WatermarkRegression { .. }));
    assert!(err.is_fatal());
    assert!(checkpoints.latest().is_none());
    assert!(handle.checkpoint().await.is_err());
    assert!(sink.is_empty());
}

// ============================================================================
// Snapshot to stream
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_converge_through_stream() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 500);

    // every scan races one update inside its own range
    let scans = Arc::new(AtomicU32::new(0));
    let counter = scans.clone();
    source.set_scan_hook(move |src: &MemorySource, table: &TableId, range: &KeyRange| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let key = range
            .lower
            .as_ref()
            .and_then(RowKey::as_single_int)
            .unwrap_or(1);
        src.update(table, RowKey::int(key), row(key, 100 + n));
    });
    source.fail_open_streams(1);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .chunk_size(50)
        .parallelism(3)
        .stream_batch_size(16)
        .build()
        .unwrap();
    let running = start_in_memory(config, &source, &sink, &checkpoints);

    let writer = {
        let source = source.clone();
        tokio::spawn(async move {
            for i in 0..300i64 {
                let key = (i * 37) % 600 + 1;
                match i % 3 {
                    0 => source.update(&products(), RowKey::int(key), row(key, i as u32)),
                    1 => source.delete(&products(), RowKey::int(key)),
                    _ => source.insert(&products(), RowKey::int(key), row(key, i as u32)),
                };
                if i % 20 == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
        })
    };
    writer.await.unwrap();

    assert!(stream_started(&running.handle).await);
    source.update(&products(), RowKey::int(2), row(2, 999));
    assert!(converges(&source, &sink, &[products()]).await);
    assert!(scans.load(Ordering::SeqCst) > 0);

    let handle = running.handle.clone();
    running.stop().await.unwrap();
    let stats = handle.stats();
    assert!(stats.stream_events_emitted > 0);
    let splits = checkpoints.latest().unwrap().splits.len() as u64;
    assert_eq!(stats.splits_finished, splits);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_table_is_captured_by_stream_alone() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 0);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let running = start_in_memory(base_config().build().unwrap(), &source, &sink, &checkpoints);
    assert!(stream_started(&running.handle).await);

    let state = running.handle.state().await.unwrap();
    assert_eq!(state.table(&products()).unwrap().split_count, 0);

    source.insert(&products(), RowKey::int(1), row(1, 0));
    source.update(&products(), RowKey::int(1), row(1, 1));
    assert!(converges(&source, &sink, &[products()]).await);
    assert_eq!(sink.len(), 2);
    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_periodic_checkpoints_are_taken() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 10);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .checkpoint_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    let running = start_in_memory(config, &source, &sink, &checkpoints);
    assert!(eventually(|| checkpoints.persisted_count() >= 3).await);
    running.stop().await.unwrap();
    assert!(checkpoints.latest().unwrap().all_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_watermark_regression_is_fatal() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 10);

    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config().build().unwrap();
    // the third write after the snapshot shows up older than its predecessors
    let capabilities = Capabilities {
        scanner: Arc::new(source.clone()),
        log: Arc::new(MisorderedLog::new(source.clone(), 13, 2)),
        sink: Arc::new(sink.clone()),
        checkpoints: checkpoints.clone(),
    };
    let running = start(config, capabilities);
    let handle = running.handle.clone();
    assert!(stream_started(&handle).await);

    for k in 11..=13 {
        source.insert(&products(), RowKey::int(k), row(k, 0));
    }

    let err = running.join().await.unwrap_err();
    assert!(matches!(err, CdcError::WatermarkRegression { .. }));
    assert!(checkpoints.latest().is_none());
    assert!(handle.checkpoint().await.is_err());
    assert!(sink.events().iter().all(|e| e.position <= 12));
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_from_mid_snapshot_checkpoint() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 1000);
    let downstream = MemorySink::new();

    // first run: three splits delivered, the fourth stuck in the sink
    let gated = Arc::new(GatedSink::hold_after(downstream.clone(), 3));
    let first_checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config().chunk_size(100).parallelism(1).build().unwrap();
    let first = start(
        config.clone(),
        capabilities(&source, gated.clone(), first_checkpoints.clone()),
    );
    assert!(eventually(|| first.handle.stats().splits_finished == 3 && gated.held() == 1).await);
    let mid = first.handle.checkpoint().await.unwrap();
    first.stop().await.unwrap();

    assert_eq!(mid.finished.len(), 3);
    assert_eq!(mid.pending_splits(), 7);
    assert_eq!(downstream.len(), 300);

    // writes while the engine is down
    source.update(&products(), RowKey::int(5), row(5, 1));
    source.delete(&products(), RowKey::int(950));
    source.insert(&products(), RowKey::int(1001), row(1001, 0));

    let second_checkpoints = Arc::new(MemoryCheckpointSink::with_state(mid));
    let second = start_in_memory(config, &source, &downstream, &second_checkpoints);
    assert!(stream_started(&second.handle).await);
    assert!(converges(&source, &downstream, &[products()]).await);
    let handle = second.handle.clone();
    second.stop().await.unwrap();
    assert_eq!(handle.stats().splits_finished, 7);

    // an uninterrupted run ends in the same per-key state
    let fresh = MemorySink::new();
    let config = base_config()
        .chunk_size(100)
        .startup_mode(StartupMode::SnapshotOnly)
        .build()
        .unwrap();
    start_in_memory(config, &source, &fresh, &Arc::new(MemoryCheckpointSink::new()))
        .join()
        .await
        .unwrap();
    assert_eq!(fresh.final_state(), downstream.final_state());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_resumes_after_restart_without_duplicates() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 20);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config().build().unwrap();

    let first = start_in_memory(config.clone(), &source, &sink, &checkpoints);
    assert!(stream_started(&first.handle).await);
    source.update(&products(), RowKey::int(3), row(3, 1));
    assert!(converges(&source, &sink, &[products()]).await);
    assert!(stream_progress_reaches(&first.handle, 21).await);
    first.stop().await.unwrap();
    let delivered = sink.len();

    source.update(&products(), RowKey::int(4), row(4, 1));
    let second = start_in_memory(config, &source, &sink, &checkpoints);
    assert!(converges(&source, &sink, &[products()]).await);
    assert!(eventually(|| sink.len() == delivered + 1).await);
    second.stop().await.unwrap();
    assert_eq!(sink.len(), delivered + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_checkpoint_survives_restart() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backfill.json");
    let source = MemorySource::new();
    seed_table(&source, &products(), 120);
    let sink = MemorySink::new();
    let config = base_config()
        .chunk_size(40)
        .startup_mode(StartupMode::SnapshotOnly)
        .build()
        .unwrap();

    let file = Arc::new(FileCheckpointSink::<u64>::new(&path, Uuid::new_v4()).await.unwrap());
    start(config.clone(), capabilities(&source, Arc::new(sink.clone()), file))
        .join()
        .await
        .unwrap();
    assert_eq!(sink.len(), 120);

    // every split is finished, so a second run emits nothing
    let file = Arc::new(FileCheckpointSink::<u64>::new(&path, Uuid::new_v4()).await.unwrap());
    start(config, capabilities(&source, Arc::new(sink.clone()), file.clone()))
        .join()
        .await
        .unwrap();
    assert_eq!(sink.len(), 120);
    let envelope = file.read_envelope().await.unwrap().unwrap();
    assert!(envelope.state.all_finished());
    assert!(envelope.checkpoint_id >= 2);
}

// ============================================================================
// Late table discovery
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_table_is_resnapshotted() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 100);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .chunk_size(25)
        .parallelism(3)
        .late_discovery(LateDiscoveryPolicy::Resnapshot)
        .build()
        .unwrap();

    let running = start_in_memory(config, &source, &sink, &checkpoints);
    assert!(stream_started(&running.handle).await);

    seed_table(&source, &orders(), 200);
    source.update(&products(), RowKey::int(1), row(1, 1));
    source.update(&orders(), RowKey::int(7), row(7, 1));

    assert!(running.handle.discover_table(orders()).await.unwrap());
    assert!(!running.handle.discover_table(orders()).await.unwrap());

    source.delete(&orders(), RowKey::int(8));
    source.update(&products(), RowKey::int(2), row(2, 1));

    assert!(converges(&source, &sink, &[products(), orders()]).await);
    assert!(stream_started(&running.handle).await);
    let state = running.handle.state().await.unwrap();
    assert_eq!(state.splits_of(&orders()).count(), 8);
    assert!(state.all_finished());
    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_table_is_rejected_and_stream_continues() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 50);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .tables(["inventory.products"])
        .late_discovery(LateDiscoveryPolicy::Reject)
        .build()
        .unwrap();

    let running = start_in_memory(config, &source, &sink, &checkpoints);
    assert!(stream_started(&running.handle).await);

    seed_table(&source, &orders(), 10);
    let err = running.handle.discover_table(orders()).await.unwrap_err();
    assert!(matches!(err, CdcError::LateTableDiscoveryConflict(_)));

    source.update(&products(), RowKey::int(9), row(9, 1));
    assert!(converges(&source, &sink, &[products()]).await);
    assert!(sink.events().iter().all(|e| e.table == products()));
    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_table_added_while_down_is_rejected_after_stream_phase_restart() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 20);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .late_discovery(LateDiscoveryPolicy::Reject)
        .build()
        .unwrap();

    let first = start_in_memory(config.clone(), &source, &sink, &checkpoints);
    assert!(stream_started(&first.handle).await);
    first.stop().await.unwrap();
    assert!(checkpoints.latest().unwrap().stream_start.is_some());

    seed_table(&source, &orders(), 30);
    let second = start_in_memory(config, &source, &sink, &checkpoints);
    source.update(&products(), RowKey::int(1), row(1, 1));
    assert!(converges(&source, &sink, &[products()]).await);

    let state = second.handle.state().await.unwrap();
    assert!(!state.contains_table(&orders()));
    assert_eq!(state.splits_of(&orders()).count(), 0);
    assert!(sink.events().iter().all(|e| e.table == products()));
    assert!(!second.task.is_finished());
    second.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_table_added_while_down_is_resnapshotted_after_stream_phase_restart() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 20);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .late_discovery(LateDiscoveryPolicy::Resnapshot)
        .build()
        .unwrap();

    let first = start_in_memory(config.clone(), &source, &sink, &checkpoints);
    assert!(stream_started(&first.handle).await);
    first.stop().await.unwrap();
    let stream_start = checkpoints.latest().unwrap().stream_start;
    assert!(stream_start.is_some());

    seed_table(&source, &orders(), 30);
    let second = start_in_memory(config, &source, &sink, &checkpoints);
    source.update(&orders(), RowKey::int(5), row(5, 1));
    assert!(converges(&source, &sink, &[products(), orders()]).await);
    assert!(stream_started(&second.handle).await);

    let state = second.handle.state().await.unwrap();
    assert_eq!(state.splits_of(&orders()).count(), 1);
    assert!(state.all_finished());
    assert_eq!(state.stream_start, stream_start);
    second.stop().await.unwrap();
}

// ============================================================================
// Stream-only startup modes
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_latest_offset_skips_existing_rows() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 100);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .startup_mode(StartupMode::LatestOffset)
        .build()
        .unwrap();

    let running = start_in_memory(config, &source, &sink, &checkpoints);
    assert!(stream_started(&running.handle).await);
    source.update(&products(), RowKey::int(10), row(10, 1));
    source.insert(&products(), RowKey::int(101), row(101, 0));

    assert!(eventually(|| sink.len() == 2).await);
    let events = sink.events();
    assert!(events.iter().all(|e| e.position > 100));
    assert_eq!(events[0].op, ChangeOp::Update);
    assert_eq!(running.handle.stats().splits_assigned, 0);
    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_specific_offset_is_inclusive() {
    init_test_logging();
    let source = MemorySource::new();
    seed_table(&source, &products(), 10);
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpointSink::new());
    let config = base_config()
        .startup_mode(StartupMode::SpecificOffset("8".into()))
        .build()
        .unwrap();

    let running = start_in_memory(config, &source, &sink, &checkpoints);
    assert!(eventually(|| sink.len() == 3).await);
    let positions: Vec<u64> = sink.events().iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![8, 9, 10]);
    running.stop().await.unwrap();
}
