// src/lib.rs

pub mod models {
    pub mod batch_record;
    pub mod snapshot;
    pub mod table_schema;
    pub mod yield_result;
}

pub mod services {
    pub mod backoff;
    pub mod batch_writer;
    pub mod cancellation;
    pub mod checkpoint_scheduler;
    pub mod clickhouse_store;
    pub mod columnar_store;
    pub mod memory_store;
    pub mod onchain_reader;
    pub mod pipeline;
    pub mod rpc_vault_reader;
    pub mod static_vault_reader;
    pub mod yield_calculator;
}

pub mod jobs {
    pub mod vault_yield_sync;
}

pub mod config;
pub mod error;

pub use config::{PipelineConfig, StoreConfig};
pub use error::ErrorKind;
pub use services::cancellation::CancellationFlag;
pub use services::pipeline::{run_pipeline, PipelineFailure, PipelineOrchestrator, RunReport, RunState};
