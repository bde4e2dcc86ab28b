//! Chunked, retrying, idempotent batch writes
//!
//! Records are split into chunks of at most `chunk_size` rows, submitted one
//! at a time in order. Every chunk succeeds or fails on its own, so a failed
//! run can resume from the first uncommitted chunk without rewriting the
//! ones before it.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, WriteError};
use crate::models::batch_record::BatchRecord;
use crate::models::table_schema::TableSchema;
use crate::services::backoff::BackoffPolicy;
use crate::services::cancellation::CancellationFlag;
use crate::services::columnar_store::ColumnarStore;

/// A chunk that did not commit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkFailure {
    pub index: usize,
    /// Offset of the chunk's first row in the input
    pub first_row: usize,
    pub rows: usize,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one `write` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReport {
    pub table: String,
    pub rows_attempted: usize,
    pub rows_committed: usize,
    /// Rows found already stored by the existence check and not re-sent
    pub rows_already_present: usize,
    pub committed_chunks: usize,
    pub failed_chunks: Vec<ChunkFailure>,
    /// Dedupe keys of every row that is not known to be stored
    pub uncommitted_keys: Vec<String>,
    pub complete: bool,
}

impl WriteReport {
    fn new(table: &str, rows_attempted: usize) -> Self {
        Self {
            table: table.to_string(),
            rows_attempted,
            rows_committed: 0,
            rows_already_present: 0,
            committed_chunks: 0,
            failed_chunks: Vec::new(),
            uncommitted_keys: Vec::new(),
            complete: false,
        }
    }

    /// Kind of the first failed chunk, if any
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.failed_chunks.first().map(|f| f.kind)
    }

    /// Row offset to resume from after a partial failure
    pub fn resume_offset(&self) -> Option<usize> {
        self.failed_chunks.first().map(|f| f.first_row)
    }
}

pub struct BatchWriter<S> {
    store: S,
    policy: BackoffPolicy,
}

impl<S: ColumnarStore> BatchWriter<S> {
    pub fn new(store: S, policy: BackoffPolicy) -> Self {
        Self { store, policy }
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Write `records` into `schema`'s table in chunks of `chunk_size`.
    ///
    /// Transient chunk failures are retried per the backoff policy. Any other
    /// failure stops the write; the failing chunk and every later row are
    /// reported as uncommitted. Cancellation is checked between chunks and
    /// between retry attempts; a submission already in flight completes.
    pub async fn write(
        &self,
        schema: &TableSchema,
        records: &[BatchRecord],
        chunk_size: u32,
        cancel: &CancellationFlag,
    ) -> WriteReport {
        let mut report = WriteReport::new(schema.name(), records.len());
        let chunk_size = chunk_size as usize;

        if chunk_size == 0 {
            fail_from(
                &mut report,
                records,
                0,
                0,
                records.len(),
                ErrorKind::PreconditionViolation,
                "chunk size must be greater than zero".to_string(),
            );
            return report;
        }

        let total_chunks = records.len().div_ceil(chunk_size);

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            let first_row = index * chunk_size;

            if cancel.is_cancelled() {
                warn!(
                    table = %schema.name(),
                    chunk = index,
                    "Write cancelled before chunk submission"
                );
                fail_from(
                    &mut report,
                    records,
                    index,
                    first_row,
                    chunk.len(),
                    ErrorKind::Cancelled,
                    WriteError::Cancelled.to_string(),
                );
                return report;
            }

            if let Err(e) = chunk.iter().try_for_each(|record| schema.validate(record)) {
                error!(table = %schema.name(), chunk = index, error = %e, "Chunk failed schema validation");
                fail_from(&mut report, records, index, first_row, chunk.len(), e.kind(), e.to_string());
                return report;
            }

            let operation = format!("insert {}#{}", schema.name(), index);
            let result = self
                .policy
                .retry(cancel, &operation, WriteError::is_transient, |_| {
                    self.submit_chunk(schema, chunk)
                })
                .await;

            match result {
                Ok(already_present) => {
                    report.rows_committed += chunk.len();
                    report.rows_already_present += already_present;
                    report.committed_chunks += 1;
                    info!(
                        table = %schema.name(),
                        chunk = index + 1,
                        total_chunks = total_chunks,
                        rows = chunk.len(),
                        already_present = already_present,
                        total_committed = report.rows_committed,
                        "Inserted chunk"
                    );
                }
                Err(e) => {
                    error!(
                        table = %schema.name(),
                        chunk = index,
                        kind = %e.kind(),
                        error = %e,
                        "Chunk write failed, aborting remaining chunks"
                    );
                    fail_from(&mut report, records, index, first_row, chunk.len(), e.kind(), e.to_string());
                    return report;
                }
            }
        }

        report.complete = report.rows_committed == report.rows_attempted;
        info!(
            table = %schema.name(),
            rows = report.rows_committed,
            chunks = report.committed_chunks,
            "Write complete"
        );
        report
    }

    /// Send one chunk. Without upsert support, rows whose key is already
    /// stored or repeated earlier in the chunk are dropped first. Returns how
    /// many rows were not sent.
    async fn submit_chunk(&self, schema: &TableSchema, chunk: &[BatchRecord]) -> Result<usize, WriteError> {
        if self.store.supports_upsert() {
            self.store.insert_chunk(schema, chunk).await?;
            return Ok(0);
        }

        let keys: Vec<String> = chunk.iter().map(|r| r.dedupe_key().to_string()).collect();
        let mut seen = self.store.existing_keys(schema, &keys).await?;
        // inserting a key marks it seen, so later repeats in the chunk drop too
        let missing: Vec<BatchRecord> = chunk
            .iter()
            .filter(|r| seen.insert(r.dedupe_key().to_string()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            self.store.insert_chunk(schema, &missing).await?;
        }
        Ok(chunk.len() - missing.len())
    }
}

/// Record chunk `index` as failed and everything from `first_row` on as uncommitted
fn fail_from(
    report: &mut WriteReport,
    records: &[BatchRecord],
    index: usize,
    first_row: usize,
    rows: usize,
    kind: ErrorKind,
    message: String,
) {
    report.failed_chunks.push(ChunkFailure {
        index,
        first_row,
        rows,
        kind,
        message,
    });
    report.uncommitted_keys = records[first_row..]
        .iter()
        .map(|r| r.dedupe_key().to_string())
        .collect();
    report.complete = false;
}
