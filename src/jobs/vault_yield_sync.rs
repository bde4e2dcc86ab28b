//! Vault Yield Sync Job
//!
//! Runs the snapshot-and-yield pipeline on a fixed interval.
//! Supports graceful shutdown via SIGINT: the current run stops issuing new
//! reads and chunk writes, lets in-flight work finish, then the job exits.

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::ErrorKind;
use crate::services::cancellation::CancellationFlag;
use crate::services::pipeline::{run_pipeline, PipelineFailure, RunReport};

/// Start the vault yield sync job
///
/// Spawns a background task that:
/// 1. Schedules checkpoints back from the chain head
/// 2. Reads vault metrics and computes yields
/// 3. Writes snapshots and yields to ClickHouse (or memory in dry run)
///
/// # Arguments
///
/// * `config` - Pipeline configuration, usually from [`PipelineConfig::from_env`]
pub async fn start_vault_yield_sync_job(config: PipelineConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            vault = %config.vault_id,
            rpc_url = %config.rpc_url,
            run_interval_secs = config.run_interval_secs,
            dry_run = config.dry_run,
            "Initializing vault yield sync job"
        );

        let mut interval = interval(TokioDuration::from_secs(config.run_interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping vault yield sync job gracefully");
                    break;
                }
                _ = interval.tick() => {
                    info!("Starting vault yield sync");

                    let cancel = CancellationFlag::new();
                    let run = run_pipeline(config.clone(), cancel.clone());
                    tokio::pin!(run);

                    let finished = tokio::select! {
                        result = &mut run => Some(result),
                        _ = tokio::signal::ctrl_c() => None,
                    };

                    let shutdown = finished.is_none();
                    let result = match finished {
                        Some(result) => result,
                        None => {
                            info!("Shutdown signal received, finishing in-flight work");
                            cancel.cancel();
                            run.await
                        }
                    };

                    log_outcome(&result);

                    if shutdown {
                        break;
                    }
                }
            }
        }

        info!("Vault yield sync job stopped");
    })
}

fn log_outcome(result: &Result<RunReport, PipelineFailure>) {
    match result {
        Ok(report) => {
            info!(
                run_id = %report.run_id,
                snapshots = report.snapshot_write.rows_committed,
                yields = report.yield_write.rows_committed,
                apy_percent = ?report.latest_yield().map(|y| y.annualized_percent()),
                "Vault yield sync completed"
            );
        }
        Err(failure) if failure.kind == ErrorKind::Cancelled => {
            warn!(
                stage = %failure.stage,
                uncommitted = failure.committed.iter().map(|r| r.uncommitted_keys.len()).sum::<usize>(),
                "Vault yield sync cancelled"
            );
        }
        Err(failure) => {
            error!(
                stage = %failure.stage,
                kind = %failure.kind,
                checkpoint = ?failure.checkpoint,
                table = ?failure.table,
                error = %failure.message,
                "Vault yield sync failed, will retry next interval"
            );
        }
    }
}
