//! Error taxonomy shared by every pipeline component.
//!
//! Each component returns its own error enum, and every variant maps onto one
//! [`ErrorKind`]. Only the transient kinds are ever retried.

use serde::Serialize;
use thiserror::Error;

/// Closed set of failure categories surfaced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller error: malformed input, zero interval, out-of-order pairing.
    PreconditionViolation,
    /// Ledger node temporarily unreachable.
    TransientRead,
    /// Invalid identifier or deterministic contract revert.
    PermanentRead,
    /// Store temporarily unavailable.
    TransientWrite,
    /// Store rejected the statement for a reason retrying won't fix.
    PermanentWrite,
    /// Observed data violates an expected invariant.
    DataConsistency,
    /// Payload does not match the destination table schema.
    Schema,
    /// Run-level cancellation or deadline.
    Cancelled,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientRead | ErrorKind::TransientWrite)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::PreconditionViolation => "precondition violation",
            ErrorKind::TransientRead => "transient read error",
            ErrorKind::PermanentRead => "permanent read error",
            ErrorKind::TransientWrite => "transient write error",
            ErrorKind::PermanentWrite => "permanent write error",
            ErrorKind::DataConsistency => "data consistency error",
            ErrorKind::Schema => "schema error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Marker returned by cancel-aware retries once the run stops.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("run cancelled")]
pub struct Cancelled;

/// Errors raised while constructing model values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("decimals {0} exceed the maximum of 77")]
    DecimalsOutOfRange(u8),

    #[error("elapsed units must be greater than zero")]
    ZeroElapsedUnits,

    #[error("yield window must be chronological: start height {start} >= end height {end}")]
    NonChronologicalWindow { start: u64, end: u64 },
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::DecimalsOutOfRange(_) => ErrorKind::DataConsistency,
            ModelError::ZeroElapsedUnits | ModelError::NonChronologicalWindow { .. } => {
                ErrorKind::PreconditionViolation
            }
        }
    }
}

/// Errors raised by the checkpoint scheduler. All are precondition violations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("sampling interval must be greater than zero")]
    ZeroSamplingInterval,

    #[error("blocks per unit must be greater than zero")]
    ZeroBlocksPerUnit,

    #[error("checkpoint {index} would fall below genesis (latest height {latest}, step {step})")]
    BeforeGenesis { index: u32, latest: u64, step: u64 },

    #[error("lookback window of {lookback} units overflows the schedule")]
    WindowOverflow { lookback: u32 },
}

impl ScheduleError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PreconditionViolation
    }
}

/// Errors raised by an on-chain reader.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadError {
    #[error("transient read failure: {0}")]
    Transient(String),

    #[error("permanent read failure: {0}")]
    Permanent(String),

    #[error("inconsistent on-chain data: {0}")]
    DataConsistency(String),

    #[error("read cancelled before attempt")]
    Cancelled,
}

impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReadError::Transient(_) => ErrorKind::TransientRead,
            ReadError::Permanent(_) => ErrorKind::PermanentRead,
            ReadError::DataConsistency(_) => ErrorKind::DataConsistency,
            ReadError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<Cancelled> for ReadError {
    fn from(_: Cancelled) -> Self {
        ReadError::Cancelled
    }
}

impl From<ModelError> for ReadError {
    fn from(err: ModelError) -> Self {
        ReadError::DataConsistency(err.to_string())
    }
}

/// Errors raised by the yield calculator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalcError {
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("inconsistent snapshots: {0}")]
    DataConsistency(String),
}

impl CalcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalcError::PreconditionViolation(_) => ErrorKind::PreconditionViolation,
            CalcError::DataConsistency(_) => ErrorKind::DataConsistency,
        }
    }
}

impl From<ModelError> for CalcError {
    fn from(err: ModelError) -> Self {
        match err.kind() {
            ErrorKind::DataConsistency => CalcError::DataConsistency(err.to_string()),
            _ => CalcError::PreconditionViolation(err.to_string()),
        }
    }
}

/// Errors raised by a columnar store or by the batch writer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WriteError {
    #[error("transient write failure: {0}")]
    Transient(String),

    #[error("permanent write failure: {0}")]
    Permanent(String),

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("write cancelled before submission")]
    Cancelled,
}

impl WriteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriteError::Transient(_) => ErrorKind::TransientWrite,
            WriteError::Permanent(_) => ErrorKind::PermanentWrite,
            WriteError::Schema(_) => ErrorKind::Schema,
            WriteError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<Cancelled> for WriteError {
    fn from(_: Cancelled) -> Self {
        WriteError::Cancelled
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PreconditionViolation
    }
}
