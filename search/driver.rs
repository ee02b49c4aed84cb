//! Cross-validated hyperparameter selection.
//!
//! A `PredictiveObjective` maps hyperparameters to one predictive estimate per
//! fold. The drivers only ever see that mapping, which keeps them testable
//! against synthetic objectives.

use super::selector::CrossValidationSelector;
use super::unimodal::{SearchStep, UniModalSearch};
use super::SearchError;
use crate::ccd::{CyclicCoordinateDescent, FitSummary};
use crate::stats::mean_and_std_dev;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub variance: f64,
    /// Left untouched when `None`.
    pub class_variance: Option<f64>,
}

impl Hyperparameters {
    pub fn new(variance: f64) -> Self {
        Self {
            variance,
            class_variance: None,
        }
    }

    pub fn hierarchical(variance: f64, class_variance: f64) -> Self {
        Self {
            variance,
            class_variance: Some(class_variance),
        }
    }
}

pub trait PredictiveObjective {
    /// Predictive log-likelihood of each evaluated fold, in fold order.
    fn evaluate(&mut self, hyperparameters: &Hyperparameters) -> Result<Vec<f64>, SearchError>;
}

/// K-fold cross-validation over clones of a template solver.
#[derive(Debug, Clone)]
pub struct CrossValidation<'a> {
    template: CyclicCoordinateDescent<'a>,
    selector: CrossValidationSelector,
    fold_to_compute: usize,
}

impl<'a> CrossValidation<'a> {
    /// Evaluates the first `fold_to_compute` folds (clamped to `1..=folds`).
    pub fn new(
        template: &CyclicCoordinateDescent<'a>,
        selector: CrossValidationSelector,
        fold_to_compute: usize,
    ) -> Self {
        let fold_to_compute = fold_to_compute.clamp(1, selector.n_folds());
        Self {
            template: template.clone(),
            selector,
            fold_to_compute,
        }
    }

    pub fn selector(&self) -> &CrossValidationSelector {
        &self.selector
    }

    fn evaluate_fold(&self, fold: usize, hyperparameters: &Hyperparameters) -> Result<f64, SearchError> {
        let mut solver = self.template.clone();
        solver.set_hyperprior(hyperparameters.variance);
        if let Some(class_variance) = hyperparameters.class_variance {
            solver.set_class_hyperprior(class_variance)?;
        }
        solver.set_weights(Some(&self.selector.training_weights(fold)?))?;
        solver.reset_beta();
        let summary = solver.fit();
        let value = solver.predictive_log_likelihood(&self.selector.held_out_weights(fold)?)?;
        debug!(
            "Fold {}: {} sweeps, predictive log-likelihood {:.6}.",
            fold, summary.iterations, value
        );
        Ok(value)
    }
}

impl PredictiveObjective for CrossValidation<'_> {
    fn evaluate(&mut self, hyperparameters: &Hyperparameters) -> Result<Vec<f64>, SearchError> {
        let this = &*self;
        (0..this.fold_to_compute)
            .into_par_iter()
            .map(|fold| this.evaluate_fold(fold, hyperparameters))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialObservation {
    /// Mean predictive log-likelihood across folds.
    pub value: f64,
    /// Population standard deviation across folds.
    pub std_dev: f64,
    pub hyperparameters: Hyperparameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub converged: bool,
    pub best_value: f64,
    pub optimum: Hyperparameters,
    pub trials: Vec<TrialObservation>,
    /// Coefficients of the refit at the optimum, when one was run.
    pub coefficients: Option<Vec<f64>>,
}

fn observe(
    objective: &mut impl PredictiveObjective,
    hyperparameters: Hyperparameters,
) -> Result<TrialObservation, SearchError> {
    let values = objective.evaluate(&hyperparameters)?;
    if values.is_empty() {
        return Err(SearchError::EmptyEvaluation);
    }
    let (value, std_dev) = mean_and_std_dev(&values);
    Ok(TrialObservation {
        value,
        std_dev,
        hyperparameters,
    })
}

/// Adaptive 1-D search over the element variance.
#[derive(Debug, Clone, Copy)]
pub struct AutoSearchDriver {
    pub max_steps: usize,
}

impl AutoSearchDriver {
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }

    pub fn drive(
        &self,
        objective: &mut impl PredictiveObjective,
        initial_variance: f64,
    ) -> Result<SearchOutcome, SearchError> {
        let mut search = UniModalSearch::default();
        let mut trials = Vec::new();
        let mut converged = false;
        let mut variance = initial_variance;

        for step in 0..self.max_steps {
            let trial = observe(objective, Hyperparameters::new(variance))?;
            info!(
                "Search step {}: variance {:.6e}, predictive log-likelihood {:.6} (sd {:.4}).",
                step + 1,
                variance,
                trial.value,
                trial.std_dev
            );
            search.tried(variance, trial.value, trial.std_dev);
            trials.push(trial);
            match search.step() {
                SearchStep::Converged(_) => {
                    converged = true;
                    break;
                }
                SearchStep::Continue(next) => variance = next,
            }
        }

        let Some((optimum, best_value)) = search.best() else {
            return Err(SearchError::EmptyEvaluation);
        };
        if converged {
            info!("Search converged at variance {:.6e}.", optimum);
        } else {
            log::warn!(
                "Search stopped after {} steps without converging; using the best variance {:.6e}.",
                self.max_steps,
                optimum
            );
        }
        Ok(SearchOutcome {
            converged,
            best_value,
            optimum: Hyperparameters::new(optimum),
            trials,
            coefficients: None,
        })
    }
}

/// Exhaustive search over log-spaced variances.
#[derive(Debug, Clone, Copy)]
pub struct GridSearchDriver {
    pub lower: f64,
    pub upper: f64,
    pub steps: usize,
}

impl GridSearchDriver {
    pub fn new(lower: f64, upper: f64, steps: usize) -> Self {
        Self { lower, upper, steps }
    }

    pub fn points(&self) -> Vec<f64> {
        if self.steps <= 1 {
            return vec![self.lower];
        }
        let ratio = (self.upper / self.lower).ln() / (self.steps - 1) as f64;
        (0..self.steps)
            .map(|i| self.lower * (ratio * i as f64).exp())
            .collect()
    }

    pub fn drive(&self, objective: &mut impl PredictiveObjective) -> Result<SearchOutcome, SearchError> {
        let mut trials = Vec::with_capacity(self.steps);
        let mut best: Option<TrialObservation> = None;
        for variance in self.points() {
            let trial = observe(objective, Hyperparameters::new(variance))?;
            info!(
                "Grid point {:.6e}: predictive log-likelihood {:.6} (sd {:.4}).",
                variance, trial.value, trial.std_dev
            );
            if best.is_none_or(|b| trial.value > b.value) {
                best = Some(trial);
            }
            trials.push(trial);
        }
        let best = best.ok_or(SearchError::EmptyEvaluation)?;
        info!("Grid search selected variance {:.6e}.", best.hyperparameters.variance);
        Ok(SearchOutcome {
            converged: true,
            best_value: best.value,
            optimum: best.hyperparameters,
            trials,
            coefficients: None,
        })
    }
}

/// Refits on all rows at the selected hyperparameters from a cold start and
/// records the coefficients in the outcome.
pub fn reset_for_optimal(
    solver: &mut CyclicCoordinateDescent<'_>,
    outcome: &mut SearchOutcome,
) -> Result<FitSummary, SearchError> {
    solver.set_weights(None)?;
    solver.set_hyperprior(outcome.optimum.variance);
    if let Some(class_variance) = outcome.optimum.class_variance {
        solver.set_class_hyperprior(class_variance)?;
    }
    solver.reset_beta();
    let summary = solver.fit();
    outcome.coefficients = Some(solver.beta().to_vec());
    info!(
        "Refit at the optimum: log-likelihood {:.6}, {} sweeps.",
        summary.log_likelihood, summary.iterations
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccd::CcdSettings;
    use crate::data::{FinalizeOptions, LoadMode, ModelData};
    use crate::model::ModelType;
    use crate::prior::{Prior, PriorType};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Concave in `ln variance` with its peak at `peak`.
    struct Quadratic {
        peak: f64,
        calls: usize,
    }

    impl PredictiveObjective for Quadratic {
        fn evaluate(&mut self, hyperparameters: &Hyperparameters) -> Result<Vec<f64>, SearchError> {
            self.calls += 1;
            let value = -(hyperparameters.variance.ln() - self.peak.ln()).powi(2);
            Ok(vec![value - 0.1, value + 0.1])
        }
    }

    struct Empty;

    impl PredictiveObjective for Empty {
        fn evaluate(&mut self, hyperparameters: &Hyperparameters) -> Result<Vec<f64>, SearchError> {
            assert!(hyperparameters.variance > 0.0);
            Ok(Vec::new())
        }
    }

    fn logistic_data(n: usize, seed: u64) -> ModelData {
        let mut rng = StdRng::seed_from_u64(seed);
        let x1: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() * 2.0 - 1.0).collect();
        let x2: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() * 2.0 - 1.0).collect();
        let y: Vec<f64> = x1
            .iter()
            .zip(&x2)
            .map(|(a, b)| {
                let p = 1.0 / (1.0 + (-(1.5 * a - b)).exp());
                if rng.r#gen::<f64>() < p { 1.0 } else { 0.0 }
            })
            .collect();
        let mut data = ModelData::new(ModelType::Logistic);
        data.load_y(&[], &[], &y, &[]).unwrap();
        data.load_x(1, &[], &x1, LoadMode::Replace, false).unwrap();
        data.load_x(2, &[], &x2, LoadMode::Replace, false).unwrap();
        data.finalize(&FinalizeOptions {
            add_intercept: true,
            ..Default::default()
        })
        .unwrap();
        data
    }

    #[test]
    fn test_auto_search_finds_quadratic_peak() {
        let mut objective = Quadratic { peak: 0.05, calls: 0 };
        let outcome = AutoSearchDriver::new(50).drive(&mut objective, 1.0).unwrap();
        assert!(outcome.converged);
        assert!((outcome.optimum.variance.ln() - 0.05f64.ln()).abs() < 1.5f64.ln());
        assert_eq!(outcome.trials.len(), objective.calls);
        assert_abs_diff_eq!(outcome.trials[0].std_dev, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_auto_search_step_cap_returns_best_so_far() {
        let mut objective = Quadratic { peak: 1e6, calls: 0 };
        let outcome = AutoSearchDriver::new(2).drive(&mut objective, 1.0).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.trials.len(), 2);
        assert_abs_diff_eq!(outcome.optimum.variance, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_evaluation_is_an_error() {
        assert_eq!(
            AutoSearchDriver::new(5).drive(&mut Empty, 1.0),
            Err(SearchError::EmptyEvaluation)
        );
    }

    #[test]
    fn test_grid_points_are_log_spaced() {
        let grid = GridSearchDriver::new(0.01, 100.0, 5);
        let points = grid.points();
        assert_eq!(points.len(), 5);
        for (point, expected) in points.iter().zip([0.01, 0.1, 1.0, 10.0, 100.0]) {
            assert_abs_diff_eq!(*point, expected, epsilon = 1e-9 * expected);
        }
        assert_eq!(GridSearchDriver::new(0.5, 2.0, 1).points(), vec![0.5]);
    }

    #[test]
    fn test_grid_search_picks_best_point() {
        let mut objective = Quadratic { peak: 1.0, calls: 0 };
        let outcome = GridSearchDriver::new(0.01, 100.0, 5).drive(&mut objective).unwrap();
        assert_abs_diff_eq!(outcome.optimum.variance, 1.0, epsilon = 1e-9);
        assert_eq!(outcome.trials.len(), 5);
        assert_abs_diff_eq!(outcome.best_value, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cross_validation_is_deterministic() {
        let data = logistic_data(60, 5);
        let solver =
            CyclicCoordinateDescent::new(&data, Prior::new(PriorType::Normal, 1.0), CcdSettings::default()).unwrap();
        let selector = CrossValidationSelector::new(5, &data, 17, &[]).unwrap();
        let mut first = CrossValidation::new(&solver, selector.clone(), 3);
        let mut second = CrossValidation::new(&solver, selector, 3);
        let h = Hyperparameters::new(0.5);
        let a = first.evaluate(&h).unwrap();
        let b = second.evaluate(&h).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite() && *v < 0.0));
    }

    #[test]
    fn test_reset_for_optimal_refits_on_all_rows() {
        let data = logistic_data(40, 9);
        let mut solver =
            CyclicCoordinateDescent::new(&data, Prior::new(PriorType::Normal, 1.0), CcdSettings::default()).unwrap();
        solver.set_weights(Some(&vec![0.0; 40])).unwrap();
        let mut outcome = SearchOutcome {
            converged: true,
            best_value: -10.0,
            optimum: Hyperparameters::new(2.0),
            trials: Vec::new(),
            coefficients: None,
        };
        reset_for_optimal(&mut solver, &mut outcome).unwrap();
        assert!(solver.weights().iter().all(|w| *w == 1.0));
        assert_eq!(solver.prior().variance(), 2.0);
        assert_eq!(outcome.coefficients.as_deref(), Some(solver.beta()));
    }
}
