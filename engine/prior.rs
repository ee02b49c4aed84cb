// engine/prior.rs

//! Priors on the regression coefficients.
//!
//! A prior contributes three things to the penalized fit: its own Newton-type
//! coordinate step (`delta`), its log density (`log_density`), and its negative
//! Hessian (`hessian_matrix`). A variance of zero (or `PriorType::None`) means
//! no penalty at all, so an unregularized fit is a prior like any other.
//!
//! # Hierarchical priors
//!
//! With a `Hierarchy` every classed coefficient is drawn around a class mean
//! with variance `σ²_e`, and each class mean around zero with variance `σ²_c`.
//! The class means are integrated out, leaving a multivariate normal whose
//! precision within a class of size `n` is
//!
//! ```text
//! Q = t1 I − t1² / (n t1 + t2) 1 1ᵀ,   t1 = 1/σ²_e,  t2 = 1/σ²_c.
//! ```

use clap::ValueEnum;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PriorType {
    None,
    #[default]
    Laplace,
    Normal,
}

/// Laplace rate `λ` from a variance: `Var = 2 / λ²`.
pub fn convert_variance_to_hyperparameter(variance: f64) -> f64 {
    (2.0 / variance).sqrt()
}

pub fn convert_hyperparameter_to_variance(lambda: f64) -> f64 {
    2.0 / (lambda * lambda)
}

/// Assignment of coefficients to classes. Coefficients without a class get an
/// independent normal prior with the element variance.
#[derive(Debug, Clone, PartialEq)]
pub struct Hierarchy {
    class_of: Vec<Option<usize>>,
    members: Vec<Vec<usize>>,
}

impl Hierarchy {
    pub fn new(class_of: Vec<Option<usize>>) -> Self {
        let n_classes = class_of.iter().flatten().map(|c| c + 1).max().unwrap_or(0);
        let mut members = vec![Vec::new(); n_classes];
        for (index, class) in class_of.iter().enumerate() {
            if let Some(class) = class {
                members[*class].push(index);
            }
        }
        Self { class_of, members }
    }

    pub fn class_of(&self, index: usize) -> Option<usize> {
        self.class_of.get(index).copied().flatten()
    }

    pub fn members(&self, class: usize) -> &[usize] {
        &self.members[class]
    }

    pub fn n_classes(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone)]
pub struct Prior {
    kind: PriorType,
    variance: f64,
    class_variance: f64,
    hierarchy: Option<Hierarchy>,
    exempt: Option<usize>,
}

impl Prior {
    pub fn new(kind: PriorType, variance: f64) -> Self {
        Self {
            kind,
            variance,
            class_variance: 0.0,
            hierarchy: None,
            exempt: None,
        }
    }

    /// A hierarchical normal prior.
    pub fn hierarchical(variance: f64, class_variance: f64, hierarchy: Hierarchy) -> Self {
        Self {
            kind: PriorType::Normal,
            variance,
            class_variance,
            hierarchy: Some(hierarchy),
            exempt: None,
        }
    }

    /// Leaves one coefficient (the intercept) unpenalized.
    pub fn with_exempt(mut self, index: Option<usize>) -> Self {
        self.exempt = index;
        self
    }

    pub fn kind(&self) -> PriorType {
        self.kind
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn class_variance(&self) -> Option<f64> {
        self.hierarchy.as_ref().map(|_| self.class_variance)
    }

    pub fn is_hierarchical(&self) -> bool {
        self.hierarchy.is_some()
    }

    pub fn set_variance(&mut self, variance: f64) {
        self.variance = variance;
    }

    /// Ignored unless the prior is hierarchical.
    pub fn set_class_variance(&mut self, variance: f64) {
        if self.hierarchy.is_some() {
            self.class_variance = variance;
        }
    }

    fn is_flat(&self) -> bool {
        self.kind == PriorType::None || self.variance == 0.0 || self.variance.is_infinite()
    }

    fn penalizes(&self, index: usize) -> bool {
        !self.is_flat() && self.exempt != Some(index)
    }

    // Class precision terms (t1, t1² / (n t1 + t2)) for a coefficient.
    fn class_terms(&self, index: usize) -> Option<(usize, f64, f64)> {
        let hierarchy = self.hierarchy.as_ref()?;
        let class = hierarchy.class_of(index)?;
        if self.class_variance == 0.0 {
            return None;
        }
        let n = hierarchy.members(class).len() as f64;
        let t1 = 1.0 / self.variance;
        let t2 = 1.0 / self.class_variance;
        Some((class, t1, t1 * t1 / (n * t1 + t2)))
    }

    /// Coordinate step for coefficient `index` given the gradient and
    /// curvature of the negative log-likelihood.
    pub fn delta(&self, index: usize, beta: &[f64], gradient: f64, hessian: f64) -> f64 {
        if !self.penalizes(index) {
            return -gradient / hessian;
        }
        let current = beta[index];
        match self.kind {
            PriorType::Laplace => {
                let lambda = convert_variance_to_hyperparameter(self.variance);
                let negative = -(gradient - lambda) / hessian;
                let positive = -(gradient + lambda) / hessian;
                if current == 0.0 {
                    if negative < 0.0 {
                        negative
                    } else if positive > 0.0 {
                        positive
                    } else {
                        0.0
                    }
                } else {
                    let step = if current < 0.0 { negative } else { positive };
                    // The step may not carry the coefficient across zero.
                    if (current + step).signum() != current.signum() || current + step == 0.0 {
                        -current
                    } else {
                        step
                    }
                }
            }
            PriorType::Normal => match self.class_terms(index) {
                Some((class, t1, coupling)) => {
                    let class_sum: f64 = self
                        .hierarchy
                        .as_ref()
                        .map(|h| h.members(class).iter().map(|&m| beta[m]).sum())
                        .unwrap_or(0.0);
                    let prior_gradient = t1 * current - coupling * class_sum;
                    let prior_hessian = t1 - coupling;
                    -(gradient + prior_gradient) / (hessian + prior_hessian)
                }
                None => {
                    let precision = 1.0 / self.variance;
                    -(gradient + current * precision) / (hessian + precision)
                }
            },
            PriorType::None => -gradient / hessian,
        }
    }

    pub fn log_density(&self, beta: &[f64]) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        match self.kind {
            PriorType::Laplace => {
                let lambda = convert_variance_to_hyperparameter(self.variance);
                (0..beta.len())
                    .filter(|&j| self.penalizes(j))
                    .map(|j| (lambda / 2.0).ln() - lambda * beta[j].abs())
                    .sum()
            }
            PriorType::Normal => {
                let mut total = 0.0;
                let mut classed = vec![false; beta.len()];
                if let (Some(hierarchy), true) = (&self.hierarchy, self.class_variance != 0.0) {
                    let t1 = 1.0 / self.variance;
                    let t2 = 1.0 / self.class_variance;
                    for class in 0..hierarchy.n_classes() {
                        let members: Vec<usize> = hierarchy
                            .members(class)
                            .iter()
                            .copied()
                            .filter(|&m| m < beta.len() && self.penalizes(m))
                            .collect();
                        if members.is_empty() {
                            continue;
                        }
                        let n = members.len() as f64;
                        let sum: f64 = members.iter().map(|&m| beta[m]).sum();
                        let squares: f64 = members.iter().map(|&m| beta[m] * beta[m]).sum();
                        let quadratic = t1 * squares - t1 * t1 * sum * sum / (n * t1 + t2);
                        let log_det = n * t1.ln() + t2.ln() - (n * t1 + t2).ln();
                        total += -0.5 * n * (2.0 * PI).ln() + 0.5 * log_det - 0.5 * quadratic;
                        for m in members {
                            classed[m] = true;
                        }
                    }
                }
                total
                    + (0..beta.len())
                        .filter(|&j| self.penalizes(j) && !classed[j])
                        .map(|j| {
                            -0.5 * (2.0 * PI * self.variance).ln()
                                - beta[j] * beta[j] / (2.0 * self.variance)
                        })
                        .sum::<f64>()
            }
            PriorType::None => 0.0,
        }
    }

    /// Negative Hessian of the log prior. The Laplace prior has no curvature
    /// away from zero and contributes nothing.
    pub fn hessian_matrix(&self, p: usize) -> Array2<f64> {
        let mut matrix = Array2::<f64>::zeros((p, p));
        if self.is_flat() || self.kind != PriorType::Normal {
            return matrix;
        }
        for j in (0..p).filter(|&j| self.penalizes(j)) {
            match self.class_terms(j) {
                Some((class, t1, coupling)) => {
                    matrix[[j, j]] += t1;
                    if let Some(hierarchy) = &self.hierarchy {
                        for &m in hierarchy.members(class) {
                            if m < p && self.penalizes(m) {
                                matrix[[j, m]] -= coupling;
                            }
                        }
                    }
                }
                None => matrix[[j, j]] += 1.0 / self.variance,
            }
        }
        matrix
    }

    /// Number of penalized coefficients and their sum of squares, the
    /// sufficient statistics of the normal-prior variance.
    pub fn penalized_sum_of_squares(&self, beta: &[f64]) -> (usize, f64) {
        (0..beta.len())
            .filter(|&j| self.exempt != Some(j))
            .fold((0, 0.0), |(count, total), j| (count + 1, total + beta[j] * beta[j]))
    }
}
