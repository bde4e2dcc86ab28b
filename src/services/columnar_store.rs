//! Columnar store boundary

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::WriteError;
use crate::models::batch_record::BatchRecord;
use crate::models::table_schema::TableSchema;

/// Destination for batch inserts
#[async_trait]
pub trait ColumnarStore: Send + Sync {
    /// Whether rows with an already stored dedupe key replace the old row.
    /// When false the writer checks for existing keys before inserting.
    fn supports_upsert(&self) -> bool;

    /// Insert `rows` as a single atomic statement, preserving order
    async fn insert_chunk(&self, schema: &TableSchema, rows: &[BatchRecord]) -> Result<(), WriteError>;

    /// Subset of `keys` already present in the table
    async fn existing_keys(
        &self,
        schema: &TableSchema,
        keys: &[String],
    ) -> Result<HashSet<String>, WriteError>;
}

#[async_trait]
impl<T: ColumnarStore + ?Sized> ColumnarStore for Arc<T> {
    fn supports_upsert(&self) -> bool {
        (**self).supports_upsert()
    }

    async fn insert_chunk(&self, schema: &TableSchema, rows: &[BatchRecord]) -> Result<(), WriteError> {
        (**self).insert_chunk(schema, rows).await
    }

    async fn existing_keys(
        &self,
        schema: &TableSchema,
        keys: &[String],
    ) -> Result<HashSet<String>, WriteError> {
        (**self).existing_keys(schema, keys).await
    }
}
