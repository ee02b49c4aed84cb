// engine/model.rs

//! # Likelihood Kernels
//!
//! Each model family supplies three things to the solver:
//!
//! 1.  The log-likelihood of the outcome given a linear predictor `eta`.
//! 2.  The first and second derivative of the *negative* log-likelihood with
//!     respect to one coefficient, which drive a single coordinate step.
//! 3.  The full Fisher information (negative Hessian), used as the default
//!     precision of the sampling proposal.
//!
//! Row weights enter every family the same way: a row of weight zero is absent.
//! For the conditional families the stratum denominator is unweighted, because
//! cross-validation folds these models by whole strata.

use crate::columns::CompressedColumn;
use clap::ValueEnum;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelError {
    #[error(
        "Unknown model type '{0}'. Expected one of: ls, lr, pr, clr, sccs, cox (or their full names)."
    )]
    UnknownModel(String),
}

/// The supported generalized linear model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    LeastSquares,
    Logistic,
    Poisson,
    ConditionalLogistic,
    SelfControlledCaseSeries,
    Cox,
}

impl ModelType {
    pub fn name(self) -> &'static str {
        match self {
            ModelType::LeastSquares => "least_squares",
            ModelType::Logistic => "logistic",
            ModelType::Poisson => "poisson",
            ModelType::ConditionalLogistic => "conditional_logistic",
            ModelType::SelfControlledCaseSeries => "self_controlled_case_series",
            ModelType::Cox => "cox",
        }
    }

    /// Whether the likelihood is conditioned on strata.
    pub fn is_stratified(self) -> bool {
        matches!(
            self,
            ModelType::ConditionalLogistic | ModelType::SelfControlledCaseSeries
        )
    }

    pub fn uses_time(self) -> bool {
        matches!(self, ModelType::Cox)
    }

    /// Whether the family is meaningless without a log-exposure offset.
    pub fn expects_offset(self) -> bool {
        matches!(self, ModelType::SelfControlledCaseSeries)
    }

    pub fn log_likelihood(self, outcome: &Outcome<'_>, predictor: &LinearPredictor) -> f64 {
        let y = outcome.y;
        let w = outcome.weights;
        let eta = &predictor.eta;
        match self {
            ModelType::LeastSquares => {
                -0.5 * (0..y.len())
                    .map(|i| {
                        let residual = y[i] - eta[i];
                        w[i] * residual * residual
                    })
                    .sum::<f64>()
            }
            ModelType::Logistic => (0..y.len())
                .map(|i| w[i] * (y[i] * eta[i] - softplus(eta[i])))
                .sum(),
            ModelType::Poisson => (0..y.len())
                .map(|i| w[i] * (y[i] * eta[i] - predictor.exp_eta[i]))
                .sum(),
            ModelType::ConditionalLogistic | ModelType::SelfControlledCaseSeries => {
                let linear: f64 = (0..y.len()).map(|i| w[i] * y[i] * eta[i]).sum();
                let normalising: f64 = outcome
                    .stratum_events
                    .iter()
                    .zip(&predictor.denominators)
                    .filter(|(events, _)| **events != 0.0)
                    .map(|(events, denominator)| events * denominator.ln())
                    .sum();
                linear - normalising
            }
            ModelType::Cox => {
                let mut total = 0.0;
                let mut risk = 0.0;
                for group in outcome.risk_sets.tie_groups() {
                    for &i in group {
                        risk += w[i] * predictor.exp_eta[i];
                    }
                    for &i in group {
                        if y[i] != 0.0 && w[i] != 0.0 {
                            total += w[i] * y[i] * (eta[i] - risk.ln());
                        }
                    }
                }
                total
            }
        }
    }

    /// Gradient and curvature of the negative log-likelihood along one column.
    pub fn coordinate_derivatives(
        self,
        outcome: &Outcome<'_>,
        predictor: &LinearPredictor,
        column: &CompressedColumn,
    ) -> (f64, f64) {
        let n_rows = outcome.y.len();
        let y = outcome.y;
        let w = outcome.weights;
        match self {
            ModelType::LeastSquares | ModelType::Logistic | ModelType::Poisson => {
                let mut gradient = 0.0;
                let mut hessian = 0.0;
                column.for_each_entry(n_rows, |i, x| {
                    if w[i] == 0.0 || x == 0.0 {
                        return;
                    }
                    let (mean, variance) = self.mean_and_variance(predictor, i);
                    gradient += w[i] * x * (mean - y[i]);
                    hessian += w[i] * x * x * variance;
                });
                (gradient, hessian)
            }
            ModelType::ConditionalLogistic | ModelType::SelfControlledCaseSeries => {
                let n_strata = outcome.stratum_events.len();
                let mut first = vec![0.0; n_strata];
                let mut second = vec![0.0; n_strata];
                let mut observed = 0.0;
                column.for_each_entry(n_rows, |i, x| {
                    let k = outcome.strata[i];
                    let exp_eta = predictor.exp_eta[i];
                    first[k] += x * exp_eta;
                    second[k] += x * x * exp_eta;
                    observed += w[i] * y[i] * x;
                });
                let mut gradient = -observed;
                let mut hessian = 0.0;
                for k in 0..n_strata {
                    let events = outcome.stratum_events[k];
                    if events == 0.0 || (first[k] == 0.0 && second[k] == 0.0) {
                        continue;
                    }
                    let denominator = predictor.denominators[k];
                    let ratio = first[k] / denominator;
                    gradient += events * ratio;
                    hessian += events * (second[k] / denominator - ratio * ratio);
                }
                (gradient, hessian)
            }
            ModelType::Cox => {
                let x = column.fill(n_rows);
                let mut gradient = 0.0;
                let mut hessian = 0.0;
                let (mut risk, mut first, mut second) = (0.0, 0.0, 0.0);
                for group in outcome.risk_sets.tie_groups() {
                    for &i in group {
                        let contribution = w[i] * predictor.exp_eta[i];
                        risk += contribution;
                        first += contribution * x[i];
                        second += contribution * x[i] * x[i];
                    }
                    for &i in group {
                        if y[i] == 0.0 || w[i] == 0.0 {
                            continue;
                        }
                        let ratio = first / risk;
                        gradient += w[i] * y[i] * (ratio - x[i]);
                        hessian += w[i] * y[i] * (second / risk - ratio * ratio);
                    }
                }
                (gradient, hessian)
            }
        }
    }

    fn mean_and_variance(self, predictor: &LinearPredictor, row: usize) -> (f64, f64) {
        match self {
            ModelType::Logistic => {
                let p = logistic(predictor.eta[row]);
                (p, p * (1.0 - p))
            }
            ModelType::Poisson => {
                let mu = predictor.exp_eta[row];
                (mu, mu)
            }
            _ => (predictor.eta[row], 1.0),
        }
    }

    /// Negative Hessian of the log-likelihood over the columns of `design`
    /// (rows are observations).
    pub fn fisher_information(
        self,
        outcome: &Outcome<'_>,
        predictor: &LinearPredictor,
        design: ArrayView2<'_, f64>,
    ) -> Array2<f64> {
        let (n_rows, p) = design.dim();
        let y = outcome.y;
        let w = outcome.weights;
        let mut information = Array2::<f64>::zeros((p, p));
        match self {
            ModelType::LeastSquares | ModelType::Logistic | ModelType::Poisson => {
                for i in 0..n_rows {
                    if w[i] == 0.0 {
                        continue;
                    }
                    let (_, variance) = self.mean_and_variance(predictor, i);
                    add_outer(&mut information, &design.row(i).to_vec(), w[i] * variance);
                }
            }
            ModelType::ConditionalLogistic | ModelType::SelfControlledCaseSeries => {
                let strata = outcome.strata;
                let by_stratum = (0..n_rows)
                    .sorted_by_key(|&i| strata[i])
                    .chunk_by(|&i| strata[i]);
                for (k, rows) in &by_stratum {
                    let rows: Vec<usize> = rows.collect();
                    let events = outcome.stratum_events[k];
                    if events == 0.0 {
                        continue;
                    }
                    let denominator = predictor.denominators[k];
                    let mut mean = Array1::<f64>::zeros(p);
                    let mut second = Array2::<f64>::zeros((p, p));
                    for &i in &rows {
                        let weight = predictor.exp_eta[i] / denominator;
                        let row = design.row(i).to_vec();
                        for a in 0..p {
                            mean[a] += weight * row[a];
                        }
                        add_outer(&mut second, &row, weight);
                    }
                    let mean = mean.to_vec();
                    add_outer(&mut second, &mean, -1.0);
                    information.scaled_add(events, &second);
                }
            }
            ModelType::Cox => {
                let mut risk = 0.0;
                let mut first = vec![0.0; p];
                let mut second = Array2::<f64>::zeros((p, p));
                for group in outcome.risk_sets.tie_groups() {
                    for &i in group {
                        let contribution = w[i] * predictor.exp_eta[i];
                        let row = design.row(i).to_vec();
                        risk += contribution;
                        for a in 0..p {
                            first[a] += contribution * row[a];
                        }
                        add_outer(&mut second, &row, contribution);
                    }
                    for &i in group {
                        if y[i] == 0.0 || w[i] == 0.0 {
                            continue;
                        }
                        let scale = w[i] * y[i];
                        information.scaled_add(scale / risk, &second);
                        add_outer(&mut information, &first, -scale / (risk * risk));
                    }
                }
            }
        }
        information
    }
}

// Adds `scale * v vᵀ` to `target`.
fn add_outer(target: &mut Array2<f64>, v: &[f64], scale: f64) {
    let p = v.len();
    for a in 0..p {
        if v[a] == 0.0 {
            continue;
        }
        for b in 0..p {
            target[[a, b]] += scale * v[a] * v[b];
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ls" | "least_squares" => Ok(ModelType::LeastSquares),
            "lr" | "logistic" => Ok(ModelType::Logistic),
            "pr" | "poisson" => Ok(ModelType::Poisson),
            "clr" | "conditional_logistic" => Ok(ModelType::ConditionalLogistic),
            "sccs" | "self_controlled_case_series" => Ok(ModelType::SelfControlledCaseSeries),
            "cox" => Ok(ModelType::Cox),
            _ => Err(ModelError::UnknownModel(s.to_string())),
        }
    }
}

/// `log(1 + e^x)` without overflow.
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Rows ordered by decreasing time, split into groups of tied times.
///
/// Walking the groups in order grows the risk set: every row of a group (and
/// of all earlier groups) is at risk at that group's time.
#[derive(Debug, Clone, Default)]
pub struct RiskSetIndex {
    order: Vec<usize>,
    groups: Vec<Range<usize>>,
}

impl RiskSetIndex {
    pub fn new(time: &[f64]) -> Self {
        let mut order: Vec<usize> = (0..time.len()).collect();
        order.sort_by(|&a, &b| time[b].total_cmp(&time[a]).then(a.cmp(&b)));

        let mut groups = Vec::new();
        let mut start = 0;
        for (_, tied) in &order.iter().chunk_by(|&&i| time[i].to_bits()) {
            let size = tied.count();
            groups.push(start..start + size);
            start += size;
        }
        Self { order, groups }
    }

    pub fn tie_groups(&self) -> impl Iterator<Item = &[usize]> + '_ {
        self.groups.iter().map(|range| &self.order[range.clone()])
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Everything a kernel reads besides the linear predictor.
#[derive(Debug, Clone, Copy)]
pub struct Outcome<'a> {
    pub y: &'a [f64],
    pub weights: &'a [f64],
    pub strata: &'a [usize],
    /// Weighted outcome total per stratum; empty for unstratified families.
    pub stratum_events: &'a [f64],
    pub risk_sets: &'a RiskSetIndex,
}

/// Weighted outcome totals per stratum.
pub fn stratum_events(y: &[f64], weights: &[f64], strata: &[usize], n_strata: usize) -> Vec<f64> {
    let mut events = vec![0.0; n_strata];
    for i in 0..y.len() {
        events[strata[i]] += weights[i] * y[i];
    }
    events
}

/// The linear predictor together with the quantities derived from it.
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    pub eta: Vec<f64>,
    pub exp_eta: Vec<f64>,
    /// Unweighted `Σ exp(eta)` per stratum.
    pub denominators: Vec<f64>,
}

impl LinearPredictor {
    pub fn new(eta: Vec<f64>, strata: &[usize], n_strata: usize) -> Self {
        let exp_eta: Vec<f64> = eta.iter().map(|v| v.exp()).collect();
        let mut denominators = vec![0.0; n_strata];
        for (i, value) in exp_eta.iter().enumerate() {
            denominators[strata[i]] += value;
        }
        Self {
            eta,
            exp_eta,
            denominators,
        }
    }

    /// Moves `eta[row]` by `change`, keeping the derived quantities current.
    pub fn shift(&mut self, row: usize, change: f64, stratum: usize) {
        let old = self.exp_eta[row];
        self.eta[row] += change;
        let new = self.eta[row].exp();
        self.exp_eta[row] = new;
        if let Some(denominator) = self.denominators.get_mut(stratum) {
            *denominator += new - old;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.eta.iter().all(|v| v.is_finite())
            && self.denominators.iter().all(|v| v.is_finite())
    }
}
