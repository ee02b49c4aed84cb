//! Nonparametric bootstrap of the coefficient estimates.

use super::SearchError;
use super::selector::BootstrapSelector;
use crate::ccd::{CyclicCoordinateDescent, FitStatus};
use crate::stats::{mean_and_std_dev, quantile};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

const LOWER_QUANTILE: f64 = 0.025;
const UPPER_QUANTILE: f64 = 0.975;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub replicates: usize,
    pub mean: Vec<f64>,
    pub std_dev: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// One row per replicate.
    pub estimates: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, Copy)]
pub struct BootstrapDriver {
    pub replicates: usize,
    pub report_raw_estimates: bool,
}

impl BootstrapDriver {
    pub fn new(replicates: usize, report_raw_estimates: bool) -> Self {
        Self {
            replicates,
            report_raw_estimates,
        }
    }

    /// Refits `solver` once per replicate, warm-started at its current
    /// coefficients. The solver's weights and coefficients are restored
    /// before returning.
    pub fn drive(
        &self,
        solver: &mut CyclicCoordinateDescent<'_>,
        selector: &mut BootstrapSelector,
    ) -> Result<BootstrapSummary, SearchError> {
        let point_estimate = solver.beta().to_vec();
        let original_weights = solver.weights().to_vec();
        let p = point_estimate.len();
        let mut estimates: Vec<Vec<f64>> = Vec::with_capacity(self.replicates);

        for replicate in 0..self.replicates {
            solver.set_weights(Some(&selector.next_weights()))?;
            solver.set_beta(&point_estimate)?;
            let summary = solver.fit();
            if summary.status == FitStatus::MaxIterationsReached {
                warn!("Bootstrap replicate {} did not converge.", replicate + 1);
            }
            debug!(
                "Bootstrap replicate {}: log-likelihood {:.6}.",
                replicate + 1,
                summary.log_likelihood
            );
            estimates.push(solver.beta().to_vec());
        }

        solver.set_weights(Some(&original_weights))?;
        solver.set_beta(&point_estimate)?;

        let mut mean = Vec::with_capacity(p);
        let mut std_dev = Vec::with_capacity(p);
        let mut lower = Vec::with_capacity(p);
        let mut upper = Vec::with_capacity(p);
        if !estimates.is_empty() {
            for j in 0..p {
                let column: Vec<f64> = estimates.iter().map(|row| row[j]).collect();
                let (m, s) = mean_and_std_dev(&column);
                mean.push(m);
                std_dev.push(s);
                lower.push(quantile(&column, LOWER_QUANTILE)?);
                upper.push(quantile(&column, UPPER_QUANTILE)?);
            }
        }
        info!("Completed {} bootstrap replicates.", estimates.len());

        Ok(BootstrapSummary {
            replicates: estimates.len(),
            mean,
            std_dev,
            lower,
            upper,
            estimates: self.report_raw_estimates.then_some(estimates),
        })
    }
}
