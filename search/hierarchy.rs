//! Alternating search over the element and class variances of a hierarchical
//! prior.
//!
//! Each axis keeps its own `UniModalSearch`. Consecutive evaluations differ in
//! exactly one variance, so the change between them is charged to the axis that
//! moved. A bracket is fed the raw estimate minus everything charged to the
//! other axis, which keeps its profile on a single level even though the other
//! variance keeps moving underneath it.

use super::driver::{Hyperparameters, PredictiveObjective, SearchOutcome, TrialObservation};
use super::unimodal::UniModalSearch;
use super::SearchError;
use crate::stats::mean_and_std_dev;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Element,
    Class,
}

#[derive(Debug, Clone, Copy)]
pub struct HierarchyAutoSearchDriver {
    pub max_steps: usize,
}

impl HierarchyAutoSearchDriver {
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }

    pub fn drive(
        &self,
        objective: &mut impl PredictiveObjective,
        initial_variance: f64,
        initial_class_variance: f64,
    ) -> Result<SearchOutcome, SearchError> {
        let mut element = UniModalSearch::default();
        let mut class = UniModalSearch::default();
        let mut element_done = false;
        let mut class_done = false;

        let mut variance = initial_variance;
        let mut class_variance = initial_class_variance;
        let mut previous: Option<f64> = None;
        let mut moved: Option<Axis> = None;
        let mut element_shift = 0.0;
        let mut class_shift = 0.0;
        let mut trials: Vec<TrialObservation> = Vec::new();

        for step in 0..self.max_steps {
            let hyperparameters = Hyperparameters::hierarchical(variance, class_variance);
            let values = objective.evaluate(&hyperparameters)?;
            if values.is_empty() {
                return Err(SearchError::EmptyEvaluation);
            }
            let (value, std_dev) = mean_and_std_dev(&values);
            if let (Some(last), Some(axis)) = (previous, moved) {
                match axis {
                    Axis::Element => element_shift += value - last,
                    Axis::Class => class_shift += value - last,
                }
            }
            previous = Some(value);
            trials.push(TrialObservation {
                value,
                std_dev,
                hyperparameters,
            });
            info!(
                "Search step {}: variance {:.6e}, class variance {:.6e}, predictive log-likelihood {:.6}.",
                step + 1,
                variance,
                class_variance,
                value
            );

            if (step % 2 == 0 && !element_done) || class_done {
                element.tried(variance, value - class_shift, std_dev);
                let proposal = element.step();
                element_done = proposal.is_converged();
                variance = proposal.value();
                moved = Some(Axis::Element);
            } else {
                class.tried(class_variance, value - element_shift, std_dev);
                let proposal = class.step();
                class_done = proposal.is_converged();
                class_variance = proposal.value();
                moved = Some(Axis::Class);
            }

            if element_done && class_done {
                break;
            }
        }

        let converged = element_done && class_done;
        let variance = element.best().map_or(variance, |(x, _)| x);
        let class_variance = class.best().map_or(class_variance, |(x, _)| x);
        if converged {
            info!(
                "Hierarchical search converged at variance {:.6e}, class variance {:.6e}.",
                variance, class_variance
            );
        } else {
            log::warn!(
                "Hierarchical search stopped after {} steps without converging on both axes.",
                self.max_steps
            );
        }
        let best_value = trials
            .iter()
            .map(|trial| trial.value)
            .fold(f64::NEG_INFINITY, f64::max);
        Ok(SearchOutcome {
            converged,
            best_value,
            optimum: Hyperparameters::hierarchical(variance, class_variance),
            trials,
            coefficients: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Separable {
        element_peak: f64,
        class_peak: f64,
    }

    impl Separable {
        fn value(&self, h: &Hyperparameters) -> f64 {
            let class_variance = h.class_variance.unwrap_or(1.0);
            -(h.variance.ln() - self.element_peak.ln()).powi(2)
                - 2.0 * (class_variance.ln() - self.class_peak.ln()).powi(2)
        }
    }

    impl PredictiveObjective for Separable {
        fn evaluate(&mut self, hyperparameters: &Hyperparameters) -> Result<Vec<f64>, SearchError> {
            Ok(vec![self.value(hyperparameters)])
        }
    }

    #[test]
    fn test_axes_alternate_one_at_a_time() {
        let mut objective = Separable {
            element_peak: 3.0,
            class_peak: 0.2,
        };
        let outcome = HierarchyAutoSearchDriver::new(4)
            .drive(&mut objective, 1.0, 1.0)
            .unwrap();
        let points: Vec<Hyperparameters> = outcome.trials.iter().map(|t| t.hyperparameters).collect();
        assert_eq!(points.len(), 4);
        assert_ne!(points[1].variance, points[0].variance);
        assert_eq!(points[1].class_variance, points[0].class_variance);
        assert_eq!(points[2].variance, points[1].variance);
        assert_ne!(points[2].class_variance, points[1].class_variance);
    }

    #[test]
    fn test_trial_log_keeps_raw_estimates() {
        let mut objective = Separable {
            element_peak: 0.5,
            class_peak: 4.0,
        };
        let outcome = HierarchyAutoSearchDriver::new(12)
            .drive(&mut objective, 1.0, 1.0)
            .unwrap();
        for trial in &outcome.trials {
            assert_eq!(trial.value, objective.value(&trial.hyperparameters));
        }
    }

    #[test]
    fn test_converges_on_both_axes() {
        let mut objective = Separable {
            element_peak: 20.0,
            class_peak: 0.05,
        };
        let outcome = HierarchyAutoSearchDriver::new(100)
            .drive(&mut objective, 1.0, 1.0)
            .unwrap();
        assert!(outcome.converged);
        let tolerance = 1.5f64.ln();
        assert!((outcome.optimum.variance.ln() - 20.0f64.ln()).abs() < tolerance);
        let class_variance = outcome.optimum.class_variance.unwrap();
        assert!((class_variance.ln() - 0.05f64.ln()).abs() < tolerance);
    }
}
