//! ClickHouse store
//!
//! Rows go out as RowBinary through typed [`Row`] structs, one insert per
//! chunk. The insert block size is pinned to the chunk length, so ClickHouse
//! commits every chunk as a single part or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{sql::Identifier, Client, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{ConfigError, WriteError};
use crate::models::batch_record::{BatchRecord, ColumnValue};
use crate::models::table_schema::{TableKind, TableSchema};
use crate::services::columnar_store::ColumnarStore;

/// Exception codes meaning the payload does not fit the table
const SCHEMA_ERROR_CODES: [u32; 10] = [6, 16, 26, 27, 41, 53, 60, 70, 72, 117];

/// Exception codes worth retrying (timeouts, overload, too many parts)
const TRANSIENT_ERROR_CODES: [u32; 7] = [159, 202, 209, 210, 241, 242, 252];

#[derive(Debug, Row, Serialize, Deserialize)]
struct KeyRow {
    dedupe_key: String,
}

/// `vault_snapshots` row. UInt256 travels as 32 little-endian bytes.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
struct SnapshotRow {
    dedupe_key: String,
    vault_id: String,
    height: u64,
    sequence_index: u32,
    label: String,
    price_per_share: [u8; 32],
    total_assets: [u8; 32],
    total_supply: [u8; 32],
    decimals: u8,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    observed_at: DateTime<Utc>,
}

/// `vault_yields` row
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
struct YieldRow {
    dedupe_key: String,
    vault_id: String,
    start_height: u64,
    end_height: u64,
    start_label: String,
    end_label: String,
    elapsed_units: u64,
    period_return: f64,
    annualized_percent: f64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    computed_at: DateTime<Utc>,
}

fn column<'a, T>(
    record: &'a BatchRecord,
    name: &str,
    extract: impl FnOnce(&'a ColumnValue) -> Option<T>,
) -> Result<T, WriteError> {
    record.get(name).and_then(extract).ok_or_else(|| {
        WriteError::Schema(format!(
            "record {} has no {} column of the declared type",
            record.dedupe_key(),
            name
        ))
    })
}

fn u256_bytes(record: &BatchRecord, name: &str) -> Result<[u8; 32], WriteError> {
    column(record, name, ColumnValue::as_u256).map(|v| v.to_le_bytes::<32>())
}

impl TryFrom<&BatchRecord> for SnapshotRow {
    type Error = WriteError;

    fn try_from(record: &BatchRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            dedupe_key: record.dedupe_key().to_string(),
            vault_id: column(record, "vault_id", ColumnValue::as_str)?.to_string(),
            height: column(record, "height", ColumnValue::as_u64)?,
            sequence_index: column(record, "sequence_index", ColumnValue::as_u32)?,
            label: column(record, "label", ColumnValue::as_str)?.to_string(),
            price_per_share: u256_bytes(record, "price_per_share")?,
            total_assets: u256_bytes(record, "total_assets")?,
            total_supply: u256_bytes(record, "total_supply")?,
            decimals: column(record, "decimals", ColumnValue::as_u8)?,
            observed_at: column(record, "observed_at", ColumnValue::as_datetime)?,
        })
    }
}

impl TryFrom<&BatchRecord> for YieldRow {
    type Error = WriteError;

    fn try_from(record: &BatchRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            dedupe_key: record.dedupe_key().to_string(),
            vault_id: column(record, "vault_id", ColumnValue::as_str)?.to_string(),
            start_height: column(record, "start_height", ColumnValue::as_u64)?,
            end_height: column(record, "end_height", ColumnValue::as_u64)?,
            start_label: column(record, "start_label", ColumnValue::as_str)?.to_string(),
            end_label: column(record, "end_label", ColumnValue::as_str)?.to_string(),
            elapsed_units: column(record, "elapsed_units", ColumnValue::as_u64)?,
            period_return: column(record, "period_return", ColumnValue::as_f64)?,
            annualized_percent: column(record, "annualized_percent", ColumnValue::as_f64)?,
            computed_at: column(record, "computed_at", ColumnValue::as_datetime)?,
        })
    }
}

#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    database: String,
    upsert: bool,
}

impl ClickHouseStore {
    pub fn new(config: &StoreConfig) -> Result<Self, ConfigError> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "CLICKHOUSE_URL",
                reason: format!("expected an http(s) URL, got {}", config.url),
            });
        }

        let mut client = Client::default()
            .with_url(config.url.trim_end_matches('/'))
            .with_user(&config.user)
            .with_database(&config.database);
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }

        info!(
            url = %config.url,
            database = %config.database,
            upsert = config.upsert,
            "Initialized ClickHouse store"
        );

        Ok(Self::from_client(client, &config.database, config.upsert))
    }

    fn from_client(client: Client, database: &str, upsert: bool) -> Self {
        Self {
            client,
            database: database.to_string(),
            upsert,
        }
    }

    /// Create a pipeline table if it does not exist yet
    pub async fn ensure_table(&self, schema: &TableSchema) -> Result<(), WriteError> {
        let ddl = schema.create_table_sql(&self.database, self.upsert);
        self.client
            .query(&ddl)
            .execute()
            .await
            .map_err(classify_error)?;
        info!(table = %schema.name(), upsert = self.upsert, "Ensured table exists");
        Ok(())
    }

    /// Convert every row up front, then stream them as one insert. Dropping
    /// the insert before `end` aborts it, so a failure leaves nothing behind.
    async fn insert_rows<T>(&self, table: &str, records: &[BatchRecord]) -> Result<(), WriteError>
    where
        T: Row + Serialize + Send + Sync + for<'a> TryFrom<&'a BatchRecord, Error = WriteError>,
    {
        let rows = records
            .iter()
            .map(T::try_from)
            .collect::<Result<Vec<T>, _>>()?;

        let client = insert_settings(rows.len())
            .into_iter()
            .fold(self.client.clone(), |client, (name, value)| {
                client.with_option(name, value)
            });

        let mut insert = client.insert::<T>(table).map_err(classify_error)?;
        for row in &rows {
            insert.write(row).await.map_err(classify_error)?;
        }
        insert.end().await.map_err(classify_error)
    }
}

/// Settings that keep `rows` inside one insert block
fn insert_settings(rows: usize) -> [(&'static str, String); 2] {
    let rows = rows.max(1).to_string();
    [
        ("max_insert_block_size", rows.clone()),
        ("min_insert_block_size_rows", rows),
    ]
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    fn supports_upsert(&self) -> bool {
        self.upsert
    }

    async fn insert_chunk(&self, schema: &TableSchema, rows: &[BatchRecord]) -> Result<(), WriteError> {
        if rows.is_empty() {
            return Ok(());
        }

        match schema.kind() {
            TableKind::Snapshots => self.insert_rows::<SnapshotRow>(schema.name(), rows).await?,
            TableKind::Yields => self.insert_rows::<YieldRow>(schema.name(), rows).await?,
        }

        debug!(table = %schema.name(), rows = rows.len(), "Inserted chunk");
        Ok(())
    }

    async fn existing_keys(
        &self,
        schema: &TableSchema,
        keys: &[String],
    ) -> Result<HashSet<String>, WriteError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let rows = self
            .client
            .query("SELECT DISTINCT ?fields FROM ? WHERE has(?, dedupe_key)")
            .bind(Identifier(schema.name()))
            .bind(keys)
            .fetch_all::<KeyRow>()
            .await
            .map_err(classify_error)?;

        Ok(rows.into_iter().map(|row| row.dedupe_key).collect())
    }
}

fn classify_error(err: clickhouse::error::Error) -> WriteError {
    use clickhouse::error::Error;

    match err {
        Error::Network(e) => WriteError::Transient(format!("ClickHouse unreachable: {}", e)),
        Error::TimedOut => WriteError::Transient("ClickHouse request timed out".to_string()),
        Error::BadResponse(message) => classify_exception(&message),
        other => WriteError::Permanent(format!("ClickHouse client error: {}", other)),
    }
}

/// Replies without an exception code come from a proxy in front of the
/// server, not from the server itself, and are retried.
fn classify_exception(message: &str) -> WriteError {
    let message = message.trim();
    match exception_code(message) {
        Some(code) if SCHEMA_ERROR_CODES.contains(&code) => WriteError::Schema(message.to_string()),
        Some(code) if TRANSIENT_ERROR_CODES.contains(&code) => {
            WriteError::Transient(message.to_string())
        }
        Some(_) => WriteError::Permanent(message.to_string()),
        None => WriteError::Transient(message.to_string()),
    }
}

/// Parse `Code: N` out of a server exception
fn exception_code(message: &str) -> Option<u32> {
    let start = message.find("Code: ")? + "Code: ".len();
    let digits: String = message[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{Checkpoint, MetricsSnapshot};
    use crate::services::backoff::BackoffPolicy;
    use crate::services::batch_writer::BatchWriter;
    use crate::services::cancellation::CancellationFlag;
    use alloy::primitives::U256;
    use chrono::TimeZone;
    use clickhouse::test::{handlers, status, Mock};

    fn store(mock: &Mock, upsert: bool) -> ClickHouseStore {
        ClickHouseStore::from_client(Client::default().with_url(mock.url()), "default", upsert)
    }

    fn yield_record(start: u64) -> BatchRecord {
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        BatchRecord::new("vault_yields", format!("v:{}-{}", start, start + 1))
            .with_column("vault_id", ColumnValue::String("v".into()))
            .with_column("start_height", ColumnValue::UInt64(start))
            .with_column("end_height", ColumnValue::UInt64(start + 1))
            .with_column("start_label", ColumnValue::String(format!("block {start}")))
            .with_column("end_label", ColumnValue::String(format!("block {}", start + 1)))
            .with_column("elapsed_units", ColumnValue::UInt64(1))
            .with_column("period_return", ColumnValue::Float64(0.001))
            .with_column("annualized_percent", ColumnValue::Float64(f64::INFINITY))
            .with_column("computed_at", ColumnValue::DateTime(ts))
    }

    #[test]
    fn test_block_size_follows_chunk_length() {
        let [(max_name, max), (min_name, min)] = insert_settings(250_000);
        assert_eq!((max_name, max.as_str()), ("max_insert_block_size", "250000"));
        assert_eq!((min_name, min.as_str()), ("min_insert_block_size_rows", "250000"));

        let [(_, max), _] = insert_settings(0);
        assert_eq!(max, "1");
    }

    #[test]
    fn test_snapshot_row_from_record() {
        let snapshot = MetricsSnapshot::new(
            "0xvault",
            Checkpoint::new(2, 900, "day 2"),
            U256::from(10u64).pow(U256::from(30u64)),
            U256::from(5u64),
            U256::from(6u64),
            18,
            Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
        )
        .unwrap();
        let record = snapshot.to_batch_record("vault_snapshots");

        let row = SnapshotRow::try_from(&record).unwrap();

        assert_eq!(row.dedupe_key, record.dedupe_key());
        assert_eq!(row.height, 900);
        assert_eq!(row.sequence_index, 2);
        assert_eq!(
            U256::from_le_bytes(row.price_per_share),
            U256::from(10u64).pow(U256::from(30u64))
        );
        assert_eq!(U256::from_le_bytes(row.total_supply), U256::from(6u64));
    }

    #[test]
    fn test_mistyped_column_is_schema_error() {
        let record = BatchRecord::new("vault_yields", "v:1-2")
            .with_column("vault_id", ColumnValue::UInt64(1));
        let err = YieldRow::try_from(&record).unwrap_err();
        assert!(matches!(err, WriteError::Schema(_)));
    }

    #[test]
    fn test_exception_classification() {
        assert!(matches!(
            classify_exception("Code: 53. DB::Exception: Type mismatch"),
            WriteError::Schema(_)
        ));
        assert!(matches!(
            classify_exception("Code: 252. DB::Exception: Too many parts"),
            WriteError::Transient(_)
        ));
        assert!(matches!(
            classify_exception("Code: 497. DB::Exception: Not enough privileges"),
            WriteError::Permanent(_)
        ));
        assert!(matches!(
            classify_exception("502 Bad Gateway"),
            WriteError::Transient(_)
        ));
        assert_eq!(exception_code("Code: 60. DB::Exception: Table does not exist"), Some(60));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = StoreConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(ClickHouseStore::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_insert_chunk_sends_typed_rows() {
        let mock = Mock::new();
        let store = store(&mock, true);
        let recording = mock.add(handlers::record::<YieldRow>());
        let schema = TableSchema::vault_yields("vault_yields");
        let records = vec![yield_record(0), yield_record(1)];

        store.insert_chunk(&schema, &records).await.unwrap();

        let rows: Vec<YieldRow> = recording.collect().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].dedupe_key, "v:0-1");
        assert_eq!(rows[1].start_height, 1);
        assert!(rows[1].annualized_percent.is_infinite());
        assert_eq!(rows[0].computed_at, Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_server_is_transient() {
        let mock = Mock::new();
        let store = store(&mock, true);
        mock.add(handlers::failure(status::SERVICE_UNAVAILABLE));
        let schema = TableSchema::vault_yields("vault_yields");

        let err = store.insert_chunk(&schema, &[yield_record(0)]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_ensure_table_engine_follows_upsert_flag() {
        let mock = Mock::new();
        let schema = TableSchema::vault_snapshots("vault_snapshots");

        let ddl = mock.add(handlers::record_ddl());
        store(&mock, false).ensure_table(&schema).await.unwrap();
        let query = ddl.query().await;
        assert!(query.contains("ENGINE = MergeTree"));

        let ddl = mock.add(handlers::record_ddl());
        store(&mock, true).ensure_table(&schema).await.unwrap();
        let query = ddl.query().await;
        assert!(query.contains("ENGINE = ReplacingMergeTree(observed_at)"));
    }

    #[tokio::test]
    async fn test_existing_keys_reads_stored_subset() {
        let mock = Mock::new();
        let store = store(&mock, false);
        mock.add(handlers::provide(vec![KeyRow {
            dedupe_key: "v:0-1".to_string(),
        }]));
        let schema = TableSchema::vault_yields("vault_yields");

        let existing = store
            .existing_keys(&schema, &["v:0-1".to_string(), "v:1-2".to_string()])
            .await
            .unwrap();

        assert_eq!(existing, HashSet::from(["v:0-1".to_string()]));
        assert!(store.existing_keys(&schema, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_only_writer_skips_stored_keys() {
        let mock = Mock::new();
        let store = store(&mock, false);
        mock.add(handlers::provide(vec![KeyRow {
            dedupe_key: "v:0-1".to_string(),
        }]));
        let recording = mock.add(handlers::record::<YieldRow>());
        let schema = TableSchema::vault_yields("vault_yields");

        let report = BatchWriter::new(store, BackoffPolicy::immediate(0))
            .write(&schema, &[yield_record(0), yield_record(1)], 10, &CancellationFlag::new())
            .await;

        assert!(report.complete);
        assert_eq!(report.rows_already_present, 1);
        let rows: Vec<YieldRow> = recording.collect().await;
        let keys: Vec<&str> = rows.iter().map(|r| r.dedupe_key.as_str()).collect();
        assert_eq!(keys, vec!["v:1-2"]);
    }
}
