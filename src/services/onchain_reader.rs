//! On-chain reader capability
//!
//! [`OnChainReader`] is the only way the pipeline touches the ledger. Reads
//! at different checkpoints are independent and may run concurrently.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::ReadError;
use crate::models::snapshot::{Checkpoint, MetricsSnapshot};
use crate::services::backoff::BackoffPolicy;
use crate::services::cancellation::CancellationFlag;

/// Reads vault metrics pinned to a historical block
#[async_trait]
pub trait OnChainReader: Send + Sync {
    /// Fails with [`ReadError::Transient`] when the node is unreachable and
    /// [`ReadError::Permanent`] when the vault is invalid or the call reverts.
    async fn read_snapshot(
        &self,
        vault_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<MetricsSnapshot, ReadError>;
}

/// Source of the latest known block height
#[async_trait]
pub trait HeadSource: Send + Sync {
    async fn latest_height(&self) -> Result<u64, ReadError>;
}

#[async_trait]
impl<T: OnChainReader + ?Sized> OnChainReader for Arc<T> {
    async fn read_snapshot(
        &self,
        vault_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<MetricsSnapshot, ReadError> {
        (**self).read_snapshot(vault_id, checkpoint).await
    }
}

#[async_trait]
impl<T: HeadSource + ?Sized> HeadSource for Arc<T> {
    async fn latest_height(&self) -> Result<u64, ReadError> {
        (**self).latest_height().await
    }
}

/// Wraps a reader with a backoff policy. Only transient errors are retried,
/// so a read is attempted at most `max_retries + 1` times, and never again
/// once the run is cancelled.
pub struct RetryingReader<R> {
    inner: R,
    policy: BackoffPolicy,
}

impl<R: OnChainReader> RetryingReader<R> {
    pub fn new(inner: R, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one checkpoint, retrying transient failures until `cancel` trips
    pub async fn read_snapshot(
        &self,
        vault_id: &str,
        checkpoint: &Checkpoint,
        cancel: &CancellationFlag,
    ) -> Result<MetricsSnapshot, ReadError> {
        let operation = format!("read_snapshot@{}", checkpoint.height);
        self.policy
            .retry(cancel, &operation, ReadError::is_transient, |attempt| {
                debug!(
                    vault = %vault_id,
                    height = checkpoint.height,
                    attempt = attempt,
                    "Reading vault snapshot"
                );
                self.inner.read_snapshot(vault_id, checkpoint)
            })
            .await
    }
}
