use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vault_yield_pipeline::config::PipelineConfig;
use vault_yield_pipeline::jobs::vault_yield_sync::start_vault_yield_sync_job;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vault_yield_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Loads .env as well
    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid pipeline configuration");
            std::process::exit(1);
        }
    };

    let job = start_vault_yield_sync_job(config).await;

    if let Err(e) = job.await {
        tracing::error!(error = %e, "Vault yield sync job panicked");
        std::process::exit(1);
    }
}
