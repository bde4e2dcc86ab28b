//! In-memory columnar store
//!
//! Backs dry runs and tests. In upsert mode rows are replaced by dedupe key;
//! in append mode every insert adds rows, so duplicates are only avoided by
//! the writer's existence check. Insert outcomes can be scripted to simulate
//! store failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{ErrorKind, WriteError};
use crate::models::batch_record::BatchRecord;
use crate::models::table_schema::TableSchema;
use crate::services::columnar_store::ColumnarStore;

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<BatchRecord>>,
    script: VecDeque<Option<ErrorKind>>,
    insert_calls: usize,
}

pub struct MemoryStore {
    upsert: bool,
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Store that replaces rows sharing a dedupe key
    pub fn upserting() -> Self {
        Self {
            upsert: true,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Store that blindly appends rows
    pub fn append_only() -> Self {
        Self {
            upsert: false,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Script the outcome of upcoming insert calls in order: `None` lets the
    /// call through, `Some(kind)` fails it with that kind.
    pub fn script_inserts(&self, outcomes: impl IntoIterator<Item = Option<ErrorKind>>) {
        self.tables.lock().script.extend(outcomes);
    }

    pub fn insert_calls(&self) -> usize {
        self.tables.lock().insert_calls
    }

    /// Physical rows stored for `table`, duplicates included
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .rows
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn distinct_keys(&self, table: &str) -> HashSet<String> {
        self.tables
            .lock()
            .rows
            .get(table)
            .map(|rows| rows.iter().map(|r| r.dedupe_key().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> Vec<BatchRecord> {
        self.tables
            .lock()
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

fn scripted_error(kind: ErrorKind, call: usize) -> WriteError {
    let message = format!("scripted failure on insert call {}", call);
    match kind {
        ErrorKind::TransientWrite | ErrorKind::TransientRead => WriteError::Transient(message),
        ErrorKind::Schema => WriteError::Schema(message),
        ErrorKind::Cancelled => WriteError::Cancelled,
        _ => WriteError::Permanent(message),
    }
}

#[async_trait]
impl ColumnarStore for MemoryStore {
    fn supports_upsert(&self) -> bool {
        self.upsert
    }

    async fn insert_chunk(&self, schema: &TableSchema, rows: &[BatchRecord]) -> Result<(), WriteError> {
        let mut tables = self.tables.lock();
        let call = tables.insert_calls;
        tables.insert_calls += 1;

        if let Some(Some(kind)) = tables.script.pop_front() {
            return Err(scripted_error(kind, call));
        }

        let stored = tables.rows.entry(schema.name().to_string()).or_default();
        for row in rows {
            if self.upsert {
                if let Some(existing) = stored
                    .iter_mut()
                    .find(|r| r.dedupe_key() == row.dedupe_key())
                {
                    *existing = row.clone();
                    continue;
                }
            }
            stored.push(row.clone());
        }

        Ok(())
    }

    async fn existing_keys(
        &self,
        schema: &TableSchema,
        keys: &[String],
    ) -> Result<HashSet<String>, WriteError> {
        let tables = self.tables.lock();
        let Some(stored) = tables.rows.get(schema.name()) else {
            return Ok(HashSet::new());
        };
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        Ok(stored
            .iter()
            .filter(|r| wanted.contains(r.dedupe_key()))
            .map(|r| r.dedupe_key().to_string())
            .collect())
    }
}
