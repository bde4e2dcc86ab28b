mod common;

use async_trait::async_trait;
use std::sync::Arc;

use vault_yield_pipeline::error::{ErrorKind, ReadError};
use vault_yield_pipeline::models::batch_record::{BatchRecord, ColumnValue};
use vault_yield_pipeline::models::snapshot::{Checkpoint, MetricsSnapshot};
use vault_yield_pipeline::models::table_schema::TableSchema;
use vault_yield_pipeline::services::backoff::BackoffPolicy;
use vault_yield_pipeline::services::batch_writer::BatchWriter;
use vault_yield_pipeline::services::cancellation::CancellationFlag;
use vault_yield_pipeline::services::memory_store::MemoryStore;
use vault_yield_pipeline::services::onchain_reader::OnChainReader;
use vault_yield_pipeline::services::pipeline::{PipelineOrchestrator, RunState};
use vault_yield_pipeline::services::static_vault_reader::StaticVaultReader;

use crate::common::{assert_close, orchestrator, pps, scenario_config, scenario_reader, HEAD, VAULT};

/// Reader that trips the run's cancellation flag after its first read
struct CancellingReader {
    inner: Arc<StaticVaultReader>,
    cancel: CancellationFlag,
}

#[async_trait]
impl OnChainReader for CancellingReader {
    async fn read_snapshot(
        &self,
        vault_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<MetricsSnapshot, ReadError> {
        let snapshot = self.inner.read_snapshot(vault_id, checkpoint).await;
        self.cancel.cancel();
        snapshot
    }
}

#[tokio::test]
async fn test_concrete_scenario_yields() {
    let store = Arc::new(MemoryStore::upserting());

    let report = orchestrator(scenario_config(), scenario_reader(), store.clone())
        .run(&CancellationFlag::new())
        .await
        .expect("run should complete");

    let heights: Vec<u64> = report.checkpoints.iter().map(|c| c.height).collect();
    assert_eq!(heights, vec![100, 50, 0]);

    assert_eq!(report.yields.len(), 2);
    let first = &report.yields[0];
    assert_eq!(first.start_checkpoint().height, 0);
    assert_eq!(first.end_checkpoint().height, 50);
    assert_eq!(first.elapsed_units(), 50);
    assert_close(first.period_return(), 0.05);

    let latest = report.latest_yield().expect("latest yield");
    assert_eq!(latest.start_checkpoint().height, 50);
    assert_eq!(latest.end_checkpoint().height, 100);
    assert_close(latest.period_return(), 1.10 / 1.05 - 1.0);
    assert_close(latest.period_return(), 0.047619047619047);

    let expected_apy = ((1.0 + 1.10 / 1.05 - 1.0f64).powf(730.0) - 1.0) * 100.0;
    assert!(latest.annualized_percent().is_finite());
    assert!(latest.annualized_percent() > 1e16);
    assert!((latest.annualized_percent() - expected_apy).abs() / expected_apy < 1e-6);

    assert_eq!(store.row_count("vault_snapshots"), 3);
    assert_eq!(store.row_count("vault_yields"), 2);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_reading() {
    let config = scenario_config();
    let head = Arc::new(StaticVaultReader::new(VAULT, 18, HEAD));
    let reader = Arc::new(StaticVaultReader::new(VAULT, 18, HEAD));
    reader.fail_always_transient();
    let store = Arc::new(MemoryStore::upserting());

    let failure = PipelineOrchestrator::new(config.clone(), head, reader.clone(), store.clone())
        .run(&CancellationFlag::new())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RunState::Reading);
    assert_eq!(failure.kind, ErrorKind::TransientRead);
    assert!(failure.checkpoint.is_some());
    for height in [100, 50, 0] {
        assert_eq!(reader.attempts_at(height), config.max_retries + 1);
    }
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_permanent_read_failure_names_checkpoint() {
    let reader = scenario_reader();
    reader.fail_permanently_at(50);
    let store = Arc::new(MemoryStore::upserting());

    let failure = orchestrator(scenario_config(), reader.clone(), store.clone())
        .run(&CancellationFlag::new())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RunState::Reading);
    assert_eq!(failure.kind, ErrorKind::PermanentRead);
    assert_eq!(failure.checkpoint.map(|c| c.height), Some(50));
    assert_eq!(reader.attempts_at(50), 1);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_transient_read_recovers() {
    let reader = scenario_reader();
    reader.fail_transiently_at(0, 2);
    let store = Arc::new(MemoryStore::upserting());

    let report = orchestrator(scenario_config(), reader.clone(), store)
        .run(&CancellationFlag::new())
        .await
        .expect("run should recover");

    assert_eq!(reader.attempts_at(0), 3);
    assert_eq!(report.yields.len(), 2);
}

#[tokio::test]
async fn test_rerun_is_idempotent_with_upsert() {
    let store = Arc::new(MemoryStore::upserting());
    let pipeline = orchestrator(scenario_config(), scenario_reader(), store.clone());

    pipeline.run(&CancellationFlag::new()).await.expect("first run");
    pipeline.run(&CancellationFlag::new()).await.expect("second run");

    assert_eq!(store.row_count("vault_snapshots"), 3);
    assert_eq!(store.row_count("vault_yields"), 2);
}

#[tokio::test]
async fn test_rerun_is_idempotent_with_existence_check() {
    let store = Arc::new(MemoryStore::append_only());
    let pipeline = orchestrator(scenario_config(), scenario_reader(), store.clone());

    pipeline.run(&CancellationFlag::new()).await.expect("first run");
    let second = pipeline.run(&CancellationFlag::new()).await.expect("second run");

    assert_eq!(second.snapshot_write.rows_already_present, 3);
    assert_eq!(second.yield_write.rows_already_present, 2);
    assert_eq!(store.row_count("vault_snapshots"), 3);
    assert_eq!(store.row_count("vault_yields"), 2);
}

#[tokio::test]
async fn test_decimals_change_fails_computing() {
    let reader = scenario_reader();
    reader.set_state(50, pps(105), Default::default(), Default::default(), 6);
    let store = Arc::new(MemoryStore::upserting());

    let failure = orchestrator(scenario_config(), reader, store.clone())
        .run(&CancellationFlag::new())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RunState::Computing);
    assert_eq!(failure.kind, ErrorKind::DataConsistency);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let store = Arc::new(MemoryStore::upserting());
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let failure = orchestrator(scenario_config(), scenario_reader(), store.clone())
        .run(&cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.stage, RunState::Scheduled);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_cancel_stops_new_reads() {
    let config = scenario_config();
    let reader = scenario_reader();
    let cancel = CancellationFlag::new();
    let cancelling = Arc::new(CancellingReader {
        inner: reader.clone(),
        cancel: cancel.clone(),
    });
    let store = Arc::new(MemoryStore::upserting());

    let failure = PipelineOrchestrator::new(
        vault_yield_pipeline::PipelineConfig {
            concurrency_limit: 1,
            ..config
        },
        reader.clone(),
        cancelling,
        store.clone(),
    )
    .run(&cancel)
    .await
    .unwrap_err();

    assert_eq!(failure.stage, RunState::Reading);
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(reader.total_attempts(), 1);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_cancel_stops_transient_retries() {
    let config = scenario_config();
    let head = Arc::new(StaticVaultReader::new(VAULT, 18, HEAD));
    let reader = Arc::new(StaticVaultReader::new(VAULT, 18, HEAD));
    reader.fail_always_transient();
    let cancel = CancellationFlag::new();
    let cancelling = Arc::new(CancellingReader {
        inner: reader.clone(),
        cancel: cancel.clone(),
    });
    let store = Arc::new(MemoryStore::upserting());

    let failure = PipelineOrchestrator::new(
        vault_yield_pipeline::PipelineConfig {
            concurrency_limit: 1,
            max_retries: 5,
            ..config
        },
        head,
        cancelling,
        store.clone(),
    )
    .run(&cancel)
    .await
    .unwrap_err();

    assert_eq!(failure.stage, RunState::Reading);
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(reader.total_attempts(), 1);
    assert_eq!(store.insert_calls(), 0);
}

#[tokio::test]
async fn test_chunk_isolation_on_permanent_failure() {
    let store = Arc::new(MemoryStore::upserting());
    store.script_inserts([None, None, Some(ErrorKind::PermanentWrite)]);
    let schema = TableSchema::vault_snapshots("vault_snapshots");

    let records: Vec<BatchRecord> = (0..10u64)
        .map(|height| {
            let snapshot = MetricsSnapshot::new(
                VAULT,
                Checkpoint::new(0, height, format!("block {height}")),
                pps(100),
                Default::default(),
                Default::default(),
                18,
                chrono::Utc::now(),
            )
            .expect("valid snapshot");
            snapshot.to_batch_record(schema.name())
        })
        .collect();

    let report = BatchWriter::new(store.clone(), BackoffPolicy::immediate(3))
        .write(&schema, &records, 3, &CancellationFlag::new())
        .await;

    assert!(!report.complete);
    assert_eq!(report.committed_chunks, 2);
    assert_eq!(report.rows_committed, 6);
    assert_eq!(report.failed_chunks.len(), 1);
    assert_eq!(report.failed_chunks[0].index, 2);
    assert_eq!(report.failed_chunks[0].kind, ErrorKind::PermanentWrite);
    assert_eq!(report.resume_offset(), Some(6));

    let expected: Vec<String> = records[6..].iter().map(|r| r.dedupe_key().to_string()).collect();
    assert_eq!(report.uncommitted_keys, expected);

    // permanent failures are not retried and later chunks are never sent
    assert_eq!(store.insert_calls(), 3);
    assert_eq!(store.row_count("vault_snapshots"), 6);
}

#[tokio::test]
async fn test_resume_after_partial_failure() {
    let store = Arc::new(MemoryStore::append_only());
    store.script_inserts([None, Some(ErrorKind::PermanentWrite)]);
    let schema = TableSchema::vault_yields("vault_yields");
    let records: Vec<BatchRecord> = (0..4u64)
        .map(|i| {
            BatchRecord::new("vault_yields", format!("{VAULT}:{i}-{}", i + 1))
                .with_column("vault_id", ColumnValue::String(VAULT.to_string()))
                .with_column("start_height", ColumnValue::UInt64(i))
                .with_column("end_height", ColumnValue::UInt64(i + 1))
                .with_column("start_label", ColumnValue::String(format!("block {i}")))
                .with_column("end_label", ColumnValue::String(format!("block {}", i + 1)))
                .with_column("elapsed_units", ColumnValue::UInt64(1))
                .with_column("period_return", ColumnValue::Float64(0.0))
                .with_column("annualized_percent", ColumnValue::Float64(0.0))
                .with_column("computed_at", ColumnValue::DateTime(chrono::Utc::now()))
        })
        .collect();
    let writer = BatchWriter::new(store.clone(), BackoffPolicy::immediate(0));

    let first = writer.write(&schema, &records, 2, &CancellationFlag::new()).await;
    assert_eq!(first.rows_committed, 2);

    let offset = first.resume_offset().expect("partial failure");
    let second = writer
        .write(&schema, &records[offset..], 2, &CancellationFlag::new())
        .await;

    assert!(second.complete);
    assert_eq!(store.row_count("vault_yields"), 4);
    assert_eq!(store.distinct_keys("vault_yields").len(), 4);
}
