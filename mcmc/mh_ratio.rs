//! The Metropolis–Hastings accept/reject step.
//!
//! `MhRatio` caches the log-likelihood and log-prior of the current state so a
//! step costs one likelihood evaluation, at the proposal. Anything that changes
//! the target without moving the coefficients (a new prior variance, new row
//! weights) must mark the chain stale; the next step then re-reads the cache at
//! the stored coefficients.

use super::SamplerError;
use super::parameter::Parameter;
use crate::ccd::CyclicCoordinateDescent;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::Rng;

/// Per-chain switches read by every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub use_hastings_ratio: bool,
    refresh: bool,
}

impl ChainState {
    pub fn new(use_hastings_ratio: bool) -> Self {
        Self {
            use_hastings_ratio,
            refresh: false,
        }
    }

    /// The cached log-likelihood and log-prior no longer describe the
    /// current state.
    pub fn mark_stale(&mut self) {
        self.refresh = true;
    }

    pub fn is_stale(&self) -> bool {
        self.refresh
    }
}

/// Scale applied to the proposal covariance for a log-scale tuning value.
pub fn transformed_tuning_value(tuning: f64) -> f64 {
    (-tuning).exp()
}

fn check_length(what: &'static str, expected: usize, found: usize) -> Result<(), SamplerError> {
    if expected != found {
        return Err(SamplerError::DimensionMismatch { what, expected, found });
    }
    Ok(())
}

/// `log q(current) - log q(proposal)` for the Gaussian proposal centred on
/// `beta_hat` with precision `precision / exp(-tuning)`.
pub fn log_hastings_ratio(
    current: &[f64],
    proposal: &[f64],
    beta_hat: ArrayView1<f64>,
    precision: ArrayView2<f64>,
    tuning: f64,
) -> Result<f64, SamplerError> {
    let p = beta_hat.len();
    check_length("current state", p, current.len())?;
    check_length("proposal", p, proposal.len())?;
    check_length("precision rows", p, precision.nrows())?;
    check_length("precision columns", p, precision.ncols())?;

    let quadratic_form = |point: &[f64]| {
        let difference: Array1<f64> = &beta_hat - &ArrayView1::from(point);
        difference.dot(&precision.dot(&difference))
    };
    let current_form = quadratic_form(current);
    let proposal_form = quadratic_form(proposal);
    Ok(-0.5 * (current_form - proposal_form) / transformed_tuning_value(tuning))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MhRatio {
    log_likelihood: f64,
    log_prior: f64,
    alpha: f64,
}

impl MhRatio {
    /// Caches the target at the solver's current coefficients.
    pub fn new(solver: &CyclicCoordinateDescent<'_>) -> Self {
        Self {
            log_likelihood: solver.log_likelihood(),
            log_prior: solver.log_prior(),
            alpha: 1.0,
        }
    }

    pub fn current_log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn current_log_prior(&self) -> f64 {
        self.log_prior
    }

    /// Acceptance probability of the last step.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Accepts or rejects the proposal held in `beta.values()` against the
    /// state in `beta.stored()`. Draws exactly one uniform from `rng`.
    ///
    /// On acceptance the proposal is stored; on rejection it is rolled back.
    /// Either way the solver is left at the resulting current state.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate<R: Rng + ?Sized>(
        &mut self,
        chain: &mut ChainState,
        beta: &mut Parameter,
        beta_hat: ArrayView1<f64>,
        solver: &mut CyclicCoordinateDescent<'_>,
        rng: &mut R,
        precision: ArrayView2<f64>,
        tuning: f64,
    ) -> Result<bool, SamplerError> {
        if chain.refresh {
            solver.set_beta(beta.stored())?;
            self.log_likelihood = solver.log_likelihood();
            self.log_prior = solver.log_prior();
            chain.refresh = false;
        }

        solver.set_beta(beta.values())?;
        let proposal_log_likelihood = solver.log_likelihood();
        let proposal_log_prior = solver.log_prior();
        let log_metropolis =
            (proposal_log_likelihood + proposal_log_prior) - (self.log_likelihood + self.log_prior);
        let log_hastings = if chain.use_hastings_ratio {
            log_hastings_ratio(beta.stored(), beta.values(), beta_hat, precision, tuning)?
        } else {
            0.0
        };

        let ratio = if log_metropolis.is_finite() && log_hastings.is_finite() {
            (log_metropolis + log_hastings).exp()
        } else {
            log::warn!(
                "Non-finite acceptance ratio (Metropolis {}, Hastings {}); rejecting the proposal.",
                log_metropolis,
                log_hastings
            );
            0.0
        };
        self.alpha = ratio.min(1.0);
        let uniform: f64 = rng.r#gen::<f64>();

        if self.alpha > uniform {
            beta.store();
            beta.set_changed(true);
            self.log_likelihood = proposal_log_likelihood;
            self.log_prior = proposal_log_prior;
            Ok(true)
        } else {
            beta.restore();
            beta.set_changed(false);
            solver.set_beta(beta.values())?;
            Ok(false)
        }
    }
}
