//! Scalar reductions and order statistics.
//!
//! The column store applies one of a closed set of element-wise functions and
//! sums the result. They are plain functions so the caller picks the operator
//! at the call site and the compiler monomorphises the reduction loop.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum StatsError {
    #[error("Quantile {0} is outside the closed interval [0, 1].")]
    InvalidQuantile(f64),
    #[error("Cannot compute an order statistic of an empty sequence.")]
    EmptySequence,
    #[error("Power must be 0, 1 or 2; got {0}.")]
    InvalidPower(u32),
}

/// Indicator of a nonzero entry.
#[inline]
pub fn zero_power(x: f64) -> f64 {
    if x == 0.0 { 0.0 } else { 1.0 }
}

#[inline]
pub fn first_power(x: f64) -> f64 {
    x
}

#[inline]
pub fn second_power(x: f64) -> f64 {
    x * x
}

/// Selects which moment a summary statistic accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    /// Count of nonzero entries.
    Zero,
    /// Sum of values.
    First,
    /// Sum of squared values.
    Second,
}

impl Power {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Power::Zero => zero_power(x),
            Power::First => first_power(x),
            Power::Second => second_power(x),
        }
    }
}

impl TryFrom<u32> for Power {
    type Error = StatsError;

    fn try_from(power: u32) -> Result<Self, Self::Error> {
        match power {
            0 => Ok(Power::Zero),
            1 => Ok(Power::First),
            2 => Ok(Power::Second),
            other => Err(StatsError::InvalidPower(other)),
        }
    }
}

/// Sample quantile with linear interpolation between order statistics.
///
/// The input is copied; the caller's sequence is left untouched.
pub fn quantile(values: &[f64], q: f64) -> Result<f64, StatsError> {
    if !(0.0..=1.0).contains(&q) {
        return Err(StatsError::InvalidQuantile(q));
    }
    if values.is_empty() {
        return Err(StatsError::EmptySequence);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = (sorted.len() - 1) as f64 * q;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let fraction = position - lower as f64;
    Ok(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    quantile(values, 0.5)
}

/// Mean and population standard deviation of a sequence of fold estimates.
///
/// Returns `(NaN, NaN)` for an empty slice.
pub fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let second = values.iter().map(|v| v * v).sum::<f64>() / n;
    // Cancellation can push the difference slightly below zero.
    let variance = (second - mean * mean).max(0.0);
    (mean, variance.sqrt())
}
