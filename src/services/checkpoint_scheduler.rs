//! Checkpoint scheduling
//!
//! Turns a trailing time window into block heights to sample. The block
//! production rate is injected, so the same scheduler works for any chain.

use tracing::debug;

use crate::error::ScheduleError;
use crate::models::snapshot::Checkpoint;

#[derive(Debug, Clone)]
pub struct CheckpointScheduler {
    blocks_per_unit: u64,
    unit_label: String,
}

impl CheckpointScheduler {
    /// # Arguments
    ///
    /// * `blocks_per_unit` - Estimated blocks produced per time unit (e.g. 7200 per day)
    /// * `unit_label` - Label prefix for checkpoints (e.g. "day")
    pub fn new(blocks_per_unit: u64, unit_label: impl Into<String>) -> Self {
        Self {
            blocks_per_unit,
            unit_label: unit_label.into(),
        }
    }

    pub fn blocks_per_unit(&self) -> u64 {
        self.blocks_per_unit
    }

    /// Compute checkpoints covering `lookback_units` back from `latest_height`,
    /// most recent first.
    ///
    /// Produces `lookback_units / sampling_interval_units + 1` checkpoints,
    /// checkpoint `i` at `latest_height - i * sampling_interval_units * blocks_per_unit`.
    pub fn schedule(
        &self,
        latest_height: u64,
        lookback_units: u32,
        sampling_interval_units: u32,
    ) -> Result<Vec<Checkpoint>, ScheduleError> {
        if sampling_interval_units == 0 {
            return Err(ScheduleError::ZeroSamplingInterval);
        }
        if self.blocks_per_unit == 0 {
            return Err(ScheduleError::ZeroBlocksPerUnit);
        }

        let count = (lookback_units / sampling_interval_units)
            .checked_add(1)
            .ok_or(ScheduleError::WindowOverflow {
                lookback: lookback_units,
            })?;
        let step = u64::from(sampling_interval_units)
            .checked_mul(self.blocks_per_unit)
            .ok_or(ScheduleError::WindowOverflow {
                lookback: lookback_units,
            })?;

        let checkpoints = (0..count)
            .map(|i| {
                let offset = step
                    .checked_mul(u64::from(i))
                    .ok_or(ScheduleError::WindowOverflow {
                        lookback: lookback_units,
                    })?;
                let height = latest_height
                    .checked_sub(offset)
                    .ok_or(ScheduleError::BeforeGenesis {
                        index: i,
                        latest: latest_height,
                        step,
                    })?;
                let units_back = u64::from(i) * u64::from(sampling_interval_units);
                Ok(Checkpoint::new(
                    i,
                    height,
                    format!("{} {}", self.unit_label, units_back),
                ))
            })
            .collect::<Result<Vec<_>, ScheduleError>>()?;

        debug!(
            latest_height = latest_height,
            count = checkpoints.len(),
            step_blocks = step,
            "Scheduled checkpoints"
        );

        Ok(checkpoints)
    }
}
