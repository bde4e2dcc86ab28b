//! Snapshot-and-yield run orchestration
//!
//! One run moves through `Scheduled -> Reading -> Computing -> Writing ->
//! Completed`, or drops to `Failed` from any non-terminal state. Every
//! transition is logged with the run id.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, ReadError, WriteError};
use crate::models::snapshot::{Checkpoint, MetricsSnapshot};
use crate::models::table_schema::TableSchema;
use crate::models::yield_result::YieldResult;
use crate::services::backoff::BackoffPolicy;
use crate::services::batch_writer::{BatchWriter, WriteReport};
use crate::services::cancellation::CancellationFlag;
use crate::services::checkpoint_scheduler::CheckpointScheduler;
use crate::services::clickhouse_store::ClickHouseStore;
use crate::services::columnar_store::ColumnarStore;
use crate::services::memory_store::MemoryStore;
use crate::services::onchain_reader::{HeadSource, OnChainReader, RetryingReader};
use crate::services::rpc_vault_reader::{load_abi, RpcVaultReader};
use crate::services::yield_calculator::compute_yield;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Scheduled,
    Reading,
    Computing,
    Writing,
    Completed,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Scheduled => "scheduled",
            RunState::Reading => "reading",
            RunState::Computing => "computing",
            RunState::Writing => "writing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a run stopped, with whatever it had already committed
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("run failed while {stage}: {kind}: {message}")]
pub struct PipelineFailure {
    /// State the run was in when it failed
    pub stage: RunState,
    pub kind: ErrorKind,
    pub checkpoint: Option<Checkpoint>,
    pub table: Option<String>,
    pub committed: Vec<WriteReport>,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(stage: RunState, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            checkpoint: None,
            table: None,
            committed: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_committed(mut self, committed: Vec<WriteReport>) -> Self {
        self.committed = committed;
        self
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub vault_id: String,
    pub checkpoints: Vec<Checkpoint>,
    /// Ascending by height
    pub snapshots: Vec<MetricsSnapshot>,
    pub yields: Vec<YieldResult>,
    pub snapshot_write: WriteReport,
    pub yield_write: WriteReport,
}

impl RunReport {
    /// Yield over the most recent window
    pub fn latest_yield(&self) -> Option<&YieldResult> {
        self.yields.last()
    }
}

struct RunTracker {
    run_id: Uuid,
    state: RunState,
}

impl RunTracker {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Scheduled,
        }
    }

    fn advance(&mut self, next: RunState) {
        info!(run_id = %self.run_id, from = %self.state, to = %next, "Run state transition");
        self.state = next;
    }

    fn fail(&mut self, failure: PipelineFailure) -> PipelineFailure {
        error!(
            run_id = %self.run_id,
            from = %self.state,
            kind = %failure.kind,
            checkpoint = ?failure.checkpoint.as_ref().map(|c| c.height),
            table = ?failure.table,
            error = %failure.message,
            "Run failed"
        );
        self.state = RunState::Failed;
        failure
    }
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    scheduler: CheckpointScheduler,
    policy: BackoffPolicy,
    head: Arc<dyn HeadSource>,
    reader: RetryingReader<Arc<dyn OnChainReader>>,
    writer: BatchWriter<Arc<dyn ColumnarStore>>,
    snapshot_schema: TableSchema,
    yield_schema: TableSchema,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        head: Arc<dyn HeadSource>,
        reader: Arc<dyn OnChainReader>,
        store: Arc<dyn ColumnarStore>,
    ) -> Self {
        let policy = config.backoff_policy();
        Self {
            scheduler: CheckpointScheduler::new(config.blocks_per_unit, config.unit_label.clone()),
            reader: RetryingReader::new(reader, policy.clone()),
            writer: BatchWriter::new(store, policy.clone()),
            snapshot_schema: TableSchema::vault_snapshots(config.store.snapshot_table.clone()),
            yield_schema: TableSchema::vault_yields(config.store.yield_table.clone()),
            policy,
            head,
            config,
        }
    }

    /// Replace the retry policy used for reads and writes
    pub fn with_backoff_policy(mut self, policy: BackoffPolicy) -> Self {
        self.reader = RetryingReader::new(self.reader.into_inner(), policy.clone());
        self.writer = BatchWriter::new(self.writer.into_store(), policy.clone());
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one full run
    pub async fn run(&self, cancel: &CancellationFlag) -> Result<RunReport, PipelineFailure> {
        let run_id = Uuid::new_v4();
        let mut tracker = RunTracker::new(run_id);

        info!(
            run_id = %run_id,
            vault = %self.config.vault_id,
            lookback_units = self.config.lookback_units,
            sampling_interval_units = self.config.sampling_interval_units,
            "Starting vault yield run"
        );

        let checkpoints = self
            .schedule(cancel)
            .await
            .map_err(|f| tracker.fail(f))?;

        tracker.advance(RunState::Reading);
        let snapshots = self
            .read_all(&checkpoints, cancel)
            .await
            .map_err(|f| tracker.fail(f))?;

        tracker.advance(RunState::Computing);
        let yields = self.compute(&snapshots).map_err(|f| tracker.fail(f))?;

        tracker.advance(RunState::Writing);
        let (snapshot_write, yield_write) = self
            .write_all(&snapshots, &yields, cancel)
            .await
            .map_err(|f| tracker.fail(f))?;

        tracker.advance(RunState::Completed);

        if let Some(latest) = yields.last() {
            info!(
                run_id = %run_id,
                vault = %self.config.vault_id,
                window = %format!("{} -> {}", latest.start_checkpoint(), latest.end_checkpoint()),
                period_return = latest.period_return(),
                apy_percent = latest.annualized_percent(),
                "Latest vault yield"
            );
        }

        Ok(RunReport {
            run_id,
            vault_id: self.config.vault_id.clone(),
            checkpoints,
            snapshots,
            yields,
            snapshot_write,
            yield_write,
        })
    }

    async fn schedule(&self, cancel: &CancellationFlag) -> Result<Vec<Checkpoint>, PipelineFailure> {
        if cancel.is_cancelled() {
            return Err(PipelineFailure::new(
                RunState::Scheduled,
                ErrorKind::Cancelled,
                "run cancelled before scheduling",
            ));
        }

        let latest = self
            .policy
            .retry(cancel, "latest_height", ReadError::is_transient, |_| {
                self.head.latest_height()
            })
            .await
            .map_err(|e| PipelineFailure::new(RunState::Scheduled, e.kind(), e.to_string()))?;

        let checkpoints = self
            .scheduler
            .schedule(
                latest,
                self.config.lookback_units,
                self.config.sampling_interval_units,
            )
            .map_err(|e| PipelineFailure::new(RunState::Scheduled, e.kind(), e.to_string()))?;

        info!(
            latest_height = latest,
            checkpoints = checkpoints.len(),
            "Scheduled checkpoints"
        );
        Ok(checkpoints)
    }

    /// Read every checkpoint with bounded concurrency. All reads run to
    /// completion; the first failure in schedule order is reported. Once
    /// `cancel` trips, no read starts or retries.
    async fn read_all(
        &self,
        checkpoints: &[Checkpoint],
        cancel: &CancellationFlag,
    ) -> Result<Vec<MetricsSnapshot>, PipelineFailure> {
        let vault_id = self.config.vault_id.as_str();

        let mut results: Vec<(Checkpoint, Result<MetricsSnapshot, (ErrorKind, String)>)> =
            stream::iter(checkpoints.iter().cloned())
                .map(|checkpoint| async move {
                    let result = self
                        .reader
                        .read_snapshot(vault_id, &checkpoint, cancel)
                        .await
                        .map_err(|e| (e.kind(), e.to_string()));
                    (checkpoint, result)
                })
                .buffer_unordered(self.config.concurrency_limit.max(1))
                .collect()
                .await;

        results.sort_by_key(|(checkpoint, _)| checkpoint.sequence_index);

        let mut snapshots = Vec::with_capacity(results.len());
        for (checkpoint, result) in results {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                Err((kind, message)) => {
                    return Err(PipelineFailure::new(RunState::Reading, kind, message)
                        .with_checkpoint(checkpoint));
                }
            }
        }

        info!(snapshots = snapshots.len(), "Read all checkpoints");
        Ok(snapshots)
    }

    /// Sort snapshots by height, check they describe one consistent series,
    /// and derive a yield for every adjacent pair.
    fn compute(&self, snapshots: &[MetricsSnapshot]) -> Result<Vec<YieldResult>, PipelineFailure> {
        let mut ordered: Vec<&MetricsSnapshot> = snapshots.iter().collect();
        ordered.sort_by_key(|s| s.height());

        let consistency = |snapshot: &MetricsSnapshot, message: String| {
            PipelineFailure::new(RunState::Computing, ErrorKind::DataConsistency, message)
                .with_checkpoint(snapshot.checkpoint().clone())
        };

        for pair in ordered.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            if start.height() == end.height() {
                return Err(consistency(end, format!("duplicate snapshot at block {}", end.height())));
            }
            if start.vault_id() != end.vault_id() {
                return Err(consistency(
                    end,
                    format!("snapshot for {} mixed into run for {}", end.vault_id(), start.vault_id()),
                ));
            }
            if start.decimals() != end.decimals() {
                return Err(consistency(
                    end,
                    format!(
                        "decimals changed from {} to {} at block {}",
                        start.decimals(),
                        end.decimals(),
                        end.height()
                    ),
                ));
            }
        }

        let computed_at = Utc::now();
        let blocks_per_unit = self.scheduler.blocks_per_unit();

        let yields = ordered
            .windows(2)
            .map(|pair| {
                let (start, end) = (pair[0], pair[1]);
                let elapsed_units = (end.height() - start.height()) / blocks_per_unit;
                compute_yield(start, end, elapsed_units, self.config.units_per_year, computed_at)
                    .map_err(|e| {
                        PipelineFailure::new(RunState::Computing, e.kind(), e.to_string())
                            .with_checkpoint(end.checkpoint().clone())
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(yields = yields.len(), "Computed yields");
        Ok(yields)
    }

    /// Write both tables concurrently; each table's chunks go in order
    async fn write_all(
        &self,
        snapshots: &[MetricsSnapshot],
        yields: &[YieldResult],
        cancel: &CancellationFlag,
    ) -> Result<(WriteReport, WriteReport), PipelineFailure> {
        let snapshot_records: Vec<_> = snapshots
            .iter()
            .map(|s| s.to_batch_record(self.snapshot_schema.name()))
            .collect();
        let yield_records: Vec<_> = yields
            .iter()
            .map(|y| y.to_batch_record(self.yield_schema.name()))
            .collect();

        let (snapshot_write, yield_write) = tokio::join!(
            self.writer.write(
                &self.snapshot_schema,
                &snapshot_records,
                self.config.chunk_size,
                cancel
            ),
            self.writer.write(
                &self.yield_schema,
                &yield_records,
                self.config.chunk_size,
                cancel
            ),
        );

        let failed = [&snapshot_write, &yield_write]
            .into_iter()
            .find(|report| !report.complete)
            .map(|report| {
                let message = report
                    .failed_chunks
                    .first()
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| "write incomplete".to_string());
                (
                    report.table.clone(),
                    report.failure_kind().unwrap_or(ErrorKind::PermanentWrite),
                    message,
                )
            });

        if let Some((table, kind, message)) = failed {
            if kind == ErrorKind::Cancelled {
                warn!(table = %table, "Write stopped by cancellation");
            }
            return Err(PipelineFailure::new(RunState::Writing, kind, message)
                .with_table(table)
                .with_committed(vec![snapshot_write, yield_write]));
        }

        Ok((snapshot_write, yield_write))
    }
}

/// Run the pipeline against the configured ledger node and store.
///
/// Dry runs write into a throwaway in-memory store. The configured run
/// deadline, if any, is layered on top of `cancel` before any setup call.
pub async fn run_pipeline(
    config: PipelineConfig,
    cancel: CancellationFlag,
) -> Result<RunReport, PipelineFailure> {
    let setup = |kind: ErrorKind, message: String| PipelineFailure::new(RunState::Scheduled, kind, message);

    config.validate().map_err(|e| setup(e.kind(), e.to_string()))?;

    let cancel = match config.run_deadline() {
        Some(deadline) => cancel.with_timeout(deadline),
        None => cancel,
    };

    let abi = load_abi(&config.abi_path).map_err(|e| setup(e.kind(), e.to_string()))?;
    let reader = Arc::new(
        RpcVaultReader::new(&config.rpc_url, abi).map_err(|e| setup(e.kind(), e.to_string()))?,
    );
    config
        .backoff_policy()
        .retry(&cancel, "verify_connection", ReadError::is_transient, |_| {
            reader.verify_connection()
        })
        .await
        .map_err(|e| setup(e.kind(), e.to_string()))?;

    let store: Arc<dyn ColumnarStore> = if config.dry_run {
        info!("Dry run, writing to in-memory store");
        Arc::new(MemoryStore::upserting())
    } else {
        let clickhouse = ClickHouseStore::new(&config.store).map_err(|e| setup(e.kind(), e.to_string()))?;
        let policy = config.backoff_policy();
        for schema in [
            TableSchema::vault_snapshots(config.store.snapshot_table.clone()),
            TableSchema::vault_yields(config.store.yield_table.clone()),
        ] {
            policy
                .retry(&cancel, "ensure_table", WriteError::is_transient, |_| {
                    clickhouse.ensure_table(&schema)
                })
                .await
                .map_err(|e| setup(e.kind(), e.to_string()).with_table(schema.name()))?;
        }
        Arc::new(clickhouse)
    };

    PipelineOrchestrator::new(config, reader.clone(), reader, store)
        .run(&cancel)
        .await
}
