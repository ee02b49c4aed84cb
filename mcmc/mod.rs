//! # Posterior Sampling
//!
//! Independence Metropolis–Hastings around the penalized mode. The proposal is
//! Gaussian, centred on the mode `β̂`, with covariance `exp(-tuning) P⁻¹` where
//! `P` is the negative Hessian of the log-posterior at the mode. The normal
//! prior variance can be Gibbs-updated between Metropolis steps.
//!
//! - `parameter`: a coefficient vector with a stored (current) copy.
//! - `mh_ratio`: one accept/reject decision.
//! - `driver`: the chain loop, proposal draws and summaries.

pub mod driver;
pub mod mh_ratio;
pub mod parameter;

use crate::ccd::CcdError;
use thiserror::Error;

pub use driver::{McmcDriver, McmcResult, McmcSettings, McmcSummary};
pub use mh_ratio::{ChainState, MhRatio, log_hastings_ratio, transformed_tuning_value};
pub use parameter::Parameter;

#[derive(Error, Debug, PartialEq)]
pub enum SamplerError {
    #[error("Solver error while sampling: {0}")]
    Ccd(#[from] CcdError),

    #[error("The precision matrix is not positive definite; cannot build the proposal.")]
    NotPositiveDefinite,

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid inverse-gamma parameters (shape {shape}, rate {rate}).")]
    InvalidVarianceConditional { shape: f64, rate: f64 },
}
