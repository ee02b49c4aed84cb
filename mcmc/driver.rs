//! The sampling loop.
//!
//! The proposal whitens the coefficient space with the Cholesky factor of the
//! precision at the mode: with `P = L Lᵀ`, a draw is
//! `β̂ + sqrt(exp(-tuning)) L⁻ᵀ z` for standard normal `z`, which has
//! covariance `exp(-tuning) P⁻¹`.

use super::SamplerError;
use super::mh_ratio::{ChainState, MhRatio, transformed_tuning_value};
use super::parameter::Parameter;
use crate::ccd::CyclicCoordinateDescent;
use crate::prior::PriorType;
use crate::stats::mean_and_std_dev;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use serde::{Deserialize, Serialize};

/// Inverse-gamma hyperprior on the normal prior variance.
const VARIANCE_PRIOR_SHAPE: f64 = 1.0;
const VARIANCE_PRIOR_RATE: f64 = 1.0;
/// Robbins–Monro gain exponent; the gain at iteration `i` is `(i + 1)^-0.6`.
const ADAPTATION_DECAY: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct McmcSettings {
    pub samples: usize,
    pub burn_in: usize,
    pub tuning: f64,
    pub use_hastings_ratio: bool,
    pub sample_variance: bool,
    pub adapt_tuning: bool,
    pub target_acceptance: f64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            samples: 1000,
            burn_in: 100,
            tuning: 0.0,
            use_hastings_ratio: true,
            sample_variance: false,
            adapt_tuning: false,
            target_acceptance: 0.234,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct McmcResult {
    /// One coefficient vector per retained iteration.
    pub samples: Vec<Vec<f64>>,
    /// Prior variance at each retained iteration.
    pub variances: Vec<f64>,
    /// Share of accepted proposals after burn-in.
    pub acceptance_rate: f64,
    /// Tuning value at the end of the run.
    pub tuning: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcSummary {
    pub samples: usize,
    pub acceptance_rate: f64,
    pub tuning: f64,
    pub mean: Vec<f64>,
    pub std_dev: Vec<f64>,
    pub mean_variance: Option<f64>,
}

impl McmcResult {
    pub fn summary(&self, sampled_variance: bool) -> McmcSummary {
        let p = self.samples.first().map_or(0, Vec::len);
        let (mean, std_dev) = (0..p)
            .map(|j| {
                let trace: Vec<f64> = self.samples.iter().map(|row| row[j]).collect();
                mean_and_std_dev(&trace)
            })
            .unzip();
        let mean_variance = (sampled_variance && !self.variances.is_empty())
            .then(|| self.variances.iter().sum::<f64>() / self.variances.len() as f64);
        McmcSummary {
            samples: self.samples.len(),
            acceptance_rate: self.acceptance_rate,
            tuning: self.tuning,
            mean,
            std_dev,
            mean_variance,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct McmcDriver {
    settings: McmcSettings,
}

impl McmcDriver {
    pub fn new(settings: McmcSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &McmcSettings {
        &self.settings
    }

    /// Runs a chain from the solver's current coefficients, which should be
    /// the penalized mode. The solver's coefficients and prior variance are
    /// restored afterwards.
    pub fn run<R: Rng + ?Sized>(
        &self,
        solver: &mut CyclicCoordinateDescent<'_>,
        rng: &mut R,
    ) -> Result<McmcResult, SamplerError> {
        let settings = &self.settings;
        let mode = solver.beta().to_vec();
        let original_variance = solver.prior().variance();
        let p = mode.len();

        let precision = solver.hessian();
        let factor = DMatrix::from_fn(p, p, |i, j| precision[[i, j]])
            .cholesky()
            .ok_or(SamplerError::NotPositiveDefinite)?;
        let upper = factor.l().transpose();
        let beta_hat = Array1::from(mode.clone());

        let sample_variance = settings.sample_variance && can_sample_variance(solver);
        if settings.sample_variance && !sample_variance {
            warn!("Variance sampling needs a non-hierarchical normal prior with positive variance; keeping it fixed.");
        }

        let mut ratio = MhRatio::new(solver);
        let mut chain = ChainState::new(settings.use_hastings_ratio);
        let mut beta = Parameter::new(mode.clone());
        let mut tuning = settings.tuning;
        let mut samples = Vec::with_capacity(settings.samples);
        let mut variances = Vec::with_capacity(settings.samples);
        let mut accepted = 0usize;

        for iteration in 0..settings.burn_in + settings.samples {
            let z = DVector::from_fn(p, |_, _| rng.sample::<f64, _>(StandardNormal));
            let direction = upper
                .solve_upper_triangular(&z)
                .ok_or(SamplerError::NotPositiveDefinite)?;
            let scale = transformed_tuning_value(tuning).sqrt();
            let proposal: Vec<f64> = mode
                .iter()
                .zip(direction.iter())
                .map(|(center, step)| center + scale * step)
                .collect();
            beta.set_values(&proposal)?;

            let step_accepted = ratio.evaluate(
                &mut chain,
                &mut beta,
                beta_hat.view(),
                solver,
                rng,
                precision.view(),
                tuning,
            )?;

            let burning_in = iteration < settings.burn_in;
            if burning_in && settings.adapt_tuning {
                let gain = ((iteration + 1) as f64).powf(-ADAPTATION_DECAY);
                let outcome = if step_accepted { 1.0 } else { 0.0 };
                tuning -= gain * (outcome - settings.target_acceptance);
            }

            if sample_variance {
                let variance = draw_variance(solver, beta.values(), rng)?;
                solver.set_hyperprior(variance);
                chain.mark_stale();
            }

            if !burning_in {
                if step_accepted {
                    accepted += 1;
                }
                samples.push(beta.values().to_vec());
                variances.push(solver.prior().variance());
            }
            if (iteration + 1) % 1000 == 0 {
                debug!(
                    "MCMC iteration {}: alpha {:.3}, tuning {:.4}.",
                    iteration + 1,
                    ratio.alpha(),
                    tuning
                );
            }
        }

        solver.set_beta(&mode)?;
        solver.set_hyperprior(original_variance);

        let acceptance_rate = if samples.is_empty() {
            0.0
        } else {
            accepted as f64 / samples.len() as f64
        };
        info!(
            "MCMC finished: {} samples after {} burn-in iterations, acceptance rate {:.3}.",
            samples.len(),
            settings.burn_in,
            acceptance_rate
        );
        Ok(McmcResult {
            samples,
            variances,
            acceptance_rate,
            tuning,
        })
    }
}

fn can_sample_variance(solver: &CyclicCoordinateDescent<'_>) -> bool {
    let prior = solver.prior();
    prior.kind() == PriorType::Normal && !prior.is_hierarchical() && prior.variance() > 0.0
}

/// Draws the normal prior variance from its inverse-gamma full conditional.
fn draw_variance<R: Rng + ?Sized>(
    solver: &CyclicCoordinateDescent<'_>,
    beta: &[f64],
    rng: &mut R,
) -> Result<f64, SamplerError> {
    let (count, squares) = solver.prior().penalized_sum_of_squares(beta);
    let shape = VARIANCE_PRIOR_SHAPE + count as f64 / 2.0;
    let rate = VARIANCE_PRIOR_RATE + squares / 2.0;
    let gamma = Gamma::new(shape, 1.0 / rate)
        .map_err(|_| SamplerError::InvalidVarianceConditional { shape, rate })?;
    Ok(1.0 / gamma.sample(rng))
}
