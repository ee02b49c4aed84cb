// engine/ccd.rs

//! # Cyclic Coordinate Descent
//!
//! The solver maximizes the penalized log-likelihood `ℓ(β) + log π(β)` one
//! coefficient at a time. For coordinate `j` it computes the gradient `g` and
//! curvature `h` of the negative log-likelihood along column `j`, asks the
//! prior for its Newton-type step, and clips that step to a per-coordinate
//! trust region:
//!
//! ```text
//! δ ← clamp(δ, −Δ_j, Δ_j),    Δ_j ← max(2|δ|, Δ_j / 2)
//! ```
//!
//! # Design
//!
//! The solver borrows an immutable, finalized `ModelData` and owns everything
//! it mutates: coefficients, row weights, trust regions. Cloning a solver is
//! therefore enough to run independent fits in parallel over the same data.
//!
//! `log_likelihood()` always rebuilds the linear predictor from the
//! coefficients, so it is a pure function of the solver state. The incremental
//! predictor used inside `fit` is local to that call and rebuilt at the start
//! of every sweep.

use crate::data::ModelData;
use crate::model::{LinearPredictor, Outcome, stratum_events};
use crate::prior::Prior;
use clap::ValueEnum;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INITIAL_TRUST_REGION: f64 = 1.0;

#[derive(Error, Debug, PartialEq)]
pub enum CcdError {
    #[error("The model data must be finalized before a solver can be bound to it.")]
    NotFinalized,

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("A class-level hyperprior requires a hierarchical prior.")]
    NotHierarchical,
}

/// Stopping rule evaluated after every sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceType {
    /// Relative change of the penalized objective.
    Lange,
    /// Relative change of `Σ|η|`.
    Mittal,
    /// Relative `L1` change of the linear predictor.
    #[default]
    ZhangOles,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CcdSettings {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub convergence: ConvergenceType,
}

impl Default for CcdSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 1000,
            convergence: ConvergenceType::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    MaxIterationsReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub status: FitStatus,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub log_prior: f64,
    /// Number of coordinate steps rejected for producing non-finite values.
    pub failed_steps: usize,
}

#[derive(Debug, Clone)]
pub struct CyclicCoordinateDescent<'a> {
    data: &'a ModelData,
    prior: Prior,
    settings: CcdSettings,
    beta: Vec<f64>,
    weights: Vec<f64>,
    events: Vec<f64>,
    offset: Vec<f64>,
    trust_region: Vec<f64>,
}

impl<'a> CyclicCoordinateDescent<'a> {
    pub fn new(data: &'a ModelData, prior: Prior, settings: CcdSettings) -> Result<Self, CcdError> {
        if !data.is_finalized() {
            return Err(CcdError::NotFinalized);
        }
        let n_rows = data.n_rows();
        let p = data.n_coefficients();
        let offset = data
            .offset_column()
            .map(|column| column.fill(n_rows))
            .unwrap_or_else(|| vec![0.0; n_rows]);
        let mut solver = Self {
            data,
            prior: prior.with_exempt(data.intercept_index()),
            settings,
            beta: vec![0.0; p],
            weights: vec![1.0; n_rows],
            events: Vec::new(),
            offset,
            trust_region: vec![INITIAL_TRUST_REGION; p],
        };
        solver.refresh_events();
        Ok(solver)
    }

    fn refresh_events(&mut self) {
        self.events = self.events_for(&self.weights);
    }

    fn events_for(&self, weights: &[f64]) -> Vec<f64> {
        if self.data.model_type().is_stratified() {
            stratum_events(self.data.y(), weights, self.data.strata(), self.data.n_strata())
        } else {
            Vec::new()
        }
    }

    pub fn data(&self) -> &'a ModelData {
        self.data
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    pub fn settings(&self) -> &CcdSettings {
        &self.settings
    }

    pub fn n_coefficients(&self) -> usize {
        self.beta.len()
    }

    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    pub fn set_beta(&mut self, values: &[f64]) -> Result<(), CcdError> {
        if values.len() != self.beta.len() {
            return Err(CcdError::DimensionMismatch {
                what: "coefficients",
                expected: self.beta.len(),
                found: values.len(),
            });
        }
        self.beta.copy_from_slice(values);
        Ok(())
    }

    /// Cold start: zero coefficients and fresh trust regions.
    pub fn reset_beta(&mut self) {
        self.beta.fill(0.0);
        self.trust_region.fill(INITIAL_TRUST_REGION);
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Per-row weights; `None` restores uniform weights.
    pub fn set_weights(&mut self, weights: Option<&[f64]>) -> Result<(), CcdError> {
        match weights {
            Some(values) => {
                if values.len() != self.weights.len() {
                    return Err(CcdError::DimensionMismatch {
                        what: "row weights",
                        expected: self.weights.len(),
                        found: values.len(),
                    });
                }
                self.weights.copy_from_slice(values);
            }
            None => self.weights.fill(1.0),
        }
        self.refresh_events();
        Ok(())
    }

    pub fn set_hyperprior(&mut self, variance: f64) {
        self.prior.set_variance(variance);
    }

    pub fn set_class_hyperprior(&mut self, variance: f64) -> Result<(), CcdError> {
        if !self.prior.is_hierarchical() {
            return Err(CcdError::NotHierarchical);
        }
        self.prior.set_class_variance(variance);
        Ok(())
    }

    fn linear_predictor(&self) -> LinearPredictor {
        let n_rows = self.data.n_rows();
        let mut eta = self.offset.clone();
        for (j, coefficient) in self.beta.iter().enumerate() {
            if *coefficient == 0.0 {
                continue;
            }
            self.data
                .coefficient_column(j)
                .for_each_entry(n_rows, |row, x| eta[row] += coefficient * x);
        }
        LinearPredictor::new(eta, self.data.strata(), self.data.n_strata())
    }

    fn outcome<'s>(&'s self, weights: &'s [f64], events: &'s [f64]) -> Outcome<'s> {
        Outcome {
            y: self.data.y(),
            weights,
            strata: self.data.strata(),
            stratum_events: events,
            risk_sets: self.data.risk_sets(),
        }
    }

    /// Log-likelihood at the current coefficients under the current weights.
    pub fn log_likelihood(&self) -> f64 {
        let predictor = self.linear_predictor();
        self.data
            .model_type()
            .log_likelihood(&self.outcome(&self.weights, &self.events), &predictor)
    }

    /// Log-likelihood of the rows selected by `weights` (typically a held-out
    /// fold) at the current coefficients.
    pub fn predictive_log_likelihood(&self, weights: &[f64]) -> Result<f64, CcdError> {
        if weights.len() != self.weights.len() {
            return Err(CcdError::DimensionMismatch {
                what: "predictive weights",
                expected: self.weights.len(),
                found: weights.len(),
            });
        }
        let events = self.events_for(weights);
        let predictor = self.linear_predictor();
        Ok(self
            .data
            .model_type()
            .log_likelihood(&self.outcome(weights, &events), &predictor))
    }

    pub fn log_prior(&self) -> f64 {
        self.prior.log_density(&self.beta)
    }

    /// Runs coordinate sweeps from the current coefficients until the
    /// convergence criterion drops to the tolerance or the iteration cap is hit.
    pub fn fit(&mut self) -> FitSummary {
        let data = self.data;
        let model = data.model_type();
        let n_rows = data.n_rows();
        let strata = data.strata();
        let p = self.beta.len();

        let mut objective = self.log_likelihood() + self.log_prior();
        let mut failed_steps = 0;
        let mut status = FitStatus::MaxIterationsReached;
        let mut iterations = 0;

        while iterations < self.settings.max_iterations {
            iterations += 1;
            let mut predictor = self.linear_predictor();
            let previous_eta = predictor.eta.clone();

            for j in 0..p {
                let column = data.coefficient_column(j);
                let outcome = Outcome {
                    y: data.y(),
                    weights: &self.weights,
                    strata,
                    stratum_events: &self.events,
                    risk_sets: data.risk_sets(),
                };
                let (gradient, hessian) = model.coordinate_derivatives(&outcome, &predictor, column);
                if gradient == 0.0 && hessian == 0.0 && self.beta[j] == 0.0 {
                    // The column carries no information under the current weights.
                    continue;
                }

                let raw = self.prior.delta(j, &self.beta, gradient, hessian);
                let bound = self.trust_region[j];
                let delta = raw.clamp(-bound, bound);

                let mut finite = gradient.is_finite() && hessian.is_finite() && delta.is_finite();
                if finite && delta != 0.0 {
                    column.for_each_entry(n_rows, |row, x| {
                        finite &= (predictor.eta[row] + delta * x).is_finite();
                    });
                }
                if !finite {
                    failed_steps += 1;
                    self.trust_region[j] = bound / 2.0;
                    log::warn!(
                        "Coordinate {} produced a non-finite step (g = {}, h = {}, delta = {}); skipped.",
                        j,
                        gradient,
                        hessian,
                        raw
                    );
                    continue;
                }

                self.trust_region[j] = (2.0 * delta.abs()).max(bound / 2.0);
                if delta == 0.0 {
                    continue;
                }
                self.beta[j] += delta;
                column.for_each_entry(n_rows, |row, x| {
                    if x != 0.0 {
                        predictor.shift(row, delta * x, strata[row]);
                    }
                });
            }

            let predictor = self.linear_predictor();
            let change = match self.settings.convergence {
                ConvergenceType::Lange => {
                    let updated = model
                        .log_likelihood(&self.outcome(&self.weights, &self.events), &predictor)
                        + self.log_prior();
                    let change = (updated - objective).abs() / (updated.abs() + 1.0);
                    objective = updated;
                    change
                }
                ConvergenceType::Mittal => {
                    let new_norm: f64 = predictor.eta.iter().map(|v| v.abs()).sum();
                    let old_norm: f64 = previous_eta.iter().map(|v| v.abs()).sum();
                    (new_norm - old_norm).abs() / (1.0 + new_norm)
                }
                ConvergenceType::ZhangOles => {
                    let new_norm: f64 = predictor.eta.iter().map(|v| v.abs()).sum();
                    let moved: f64 = predictor
                        .eta
                        .iter()
                        .zip(&previous_eta)
                        .map(|(a, b)| (a - b).abs())
                        .sum();
                    moved / (1.0 + new_norm)
                }
            };
            log::debug!("CCD sweep {}: convergence criterion {:.3e}", iterations, change);

            if change <= self.settings.tolerance {
                status = FitStatus::Converged;
                break;
            }
        }

        let summary = FitSummary {
            status,
            iterations,
            log_likelihood: self.log_likelihood(),
            log_prior: self.log_prior(),
            failed_steps,
        };
        match status {
            FitStatus::Converged => log::debug!(
                "CCD converged after {} sweeps; log-likelihood {:.6}.",
                iterations,
                summary.log_likelihood
            ),
            FitStatus::MaxIterationsReached => log::warn!(
                "CCD stopped at the iteration cap ({}) before converging; log-likelihood {:.6}.",
                iterations,
                summary.log_likelihood
            ),
        }
        summary
    }

    /// Dense coefficient columns, one row per observation.
    pub fn design_matrix(&self) -> Array2<f64> {
        let n_rows = self.data.n_rows();
        let p = self.beta.len();
        let mut design = Array2::<f64>::zeros((n_rows, p));
        for j in 0..p {
            self.data
                .coefficient_column(j)
                .for_each_entry(n_rows, |row, x| design[[row, j]] = x);
        }
        design
    }

    /// Negative Hessian of the penalized log-posterior at the current
    /// coefficients.
    pub fn hessian(&self) -> Array2<f64> {
        let predictor = self.linear_predictor();
        let design = self.design_matrix();
        let information = self.data.model_type().fisher_information(
            &self.outcome(&self.weights, &self.events),
            &predictor,
            design.view(),
        );
        information + self.prior.hessian_matrix(self.beta.len())
    }
}
