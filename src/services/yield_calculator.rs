//! Period return and compound annualization
//!
//! Pure functions, no I/O. Precondition failures are returned as errors and
//! never turned into infinities or defaults.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};

use crate::error::CalcError;
use crate::models::snapshot::MetricsSnapshot;
use crate::models::yield_result::YieldResult;

/// Return between two snapshots of the same vault:
/// `(end.pps / 10^d) / (start.pps / 10^d) - 1`.
///
/// The price ratio is reduced by its GCD in 256-bit space before converting
/// to `f64`, so scaling both prices by the same factor gives the identical
/// result.
pub fn compute_period_return(
    start: &MetricsSnapshot,
    end: &MetricsSnapshot,
) -> Result<f64, CalcError> {
    if start.decimals() != end.decimals() {
        return Err(CalcError::DataConsistency(format!(
            "decimals changed from {} at block {} to {} at block {}",
            start.decimals(),
            start.height(),
            end.decimals(),
            end.height()
        )));
    }
    if start.height() >= end.height() {
        return Err(CalcError::PreconditionViolation(format!(
            "snapshots out of order: start block {} is not before end block {}",
            start.height(),
            end.height()
        )));
    }
    if start.price_per_share().is_zero() {
        return Err(CalcError::PreconditionViolation(format!(
            "start price per share is zero at block {}",
            start.height()
        )));
    }

    let divisor = gcd(end.price_per_share(), start.price_per_share());
    let numerator = u256_to_f64(end.price_per_share() / divisor);
    let denominator = u256_to_f64(start.price_per_share() / divisor);

    Ok(numerator / denominator - 1.0)
}

/// Compound annualization in percent:
/// `((1 + period_return) ^ (units_per_year / elapsed_units) - 1) * 100`.
///
/// A total loss (`period_return == -1`) is exactly `-100.0`. Large results
/// are not clamped.
pub fn annualize(
    period_return: f64,
    elapsed_units: u64,
    units_per_year: u64,
) -> Result<f64, CalcError> {
    if elapsed_units == 0 {
        return Err(CalcError::PreconditionViolation(
            "elapsed units must be greater than zero".to_string(),
        ));
    }
    if units_per_year == 0 {
        return Err(CalcError::PreconditionViolation(
            "units per year must be greater than zero".to_string(),
        ));
    }
    if !period_return.is_finite() || period_return < -1.0 {
        return Err(CalcError::PreconditionViolation(format!(
            "period return {} is outside (-1, +inf)",
            period_return
        )));
    }
    if period_return == -1.0 {
        return Ok(-100.0);
    }

    let periods_per_year = units_per_year as f64 / elapsed_units as f64;
    Ok(((1.0 + period_return).powf(periods_per_year) - 1.0) * 100.0)
}

/// Full yield over one window
pub fn compute_yield(
    start: &MetricsSnapshot,
    end: &MetricsSnapshot,
    elapsed_units: u64,
    units_per_year: u64,
    computed_at: DateTime<Utc>,
) -> Result<YieldResult, CalcError> {
    if start.vault_id() != end.vault_id() {
        return Err(CalcError::DataConsistency(format!(
            "cannot pair snapshots of {} and {}",
            start.vault_id(),
            end.vault_id()
        )));
    }

    let period_return = compute_period_return(start, end)?;
    let annualized_percent = annualize(period_return, elapsed_units, units_per_year)?;

    let result = YieldResult::new(
        start.vault_id(),
        start.checkpoint().clone(),
        end.checkpoint().clone(),
        elapsed_units,
        period_return,
        annualized_percent,
        computed_at,
    )?;

    Ok(result)
}

fn gcd(mut a: U256, mut b: U256) -> U256 {
    while !b.is_zero() {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Correctly rounded conversion through the decimal representation
fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::INFINITY)
}
