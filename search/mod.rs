//! # Hyperparameter Search
//!
//! The prior variance is chosen by maximizing the cross-validated predictive
//! log-likelihood. Each trial binds a variance (and, for hierarchical priors, a
//! class variance), fits every training fold from a cold start, and scores the
//! held-out rows. A derivative-free bracket search in log space proposes the
//! next trial.
//!
//! - `unimodal`: the 1-D bracket search.
//! - `selector`: fold and bootstrap row weights.
//! - `driver`: the cross-validation objective and the grid / adaptive drivers.
//! - `hierarchy`: alternating 2-D search over element and class variances.
//! - `bootstrap`: replicate refits and coefficient summaries.

pub mod bootstrap;
pub mod driver;
pub mod hierarchy;
pub mod selector;
pub mod unimodal;

use crate::ccd::CcdError;
use crate::stats::StatsError;
use thiserror::Error;

pub use bootstrap::{BootstrapDriver, BootstrapSummary};
pub use driver::{
    AutoSearchDriver, CrossValidation, GridSearchDriver, Hyperparameters, PredictiveObjective,
    SearchOutcome, TrialObservation, reset_for_optimal,
};
pub use hierarchy::HierarchyAutoSearchDriver;
pub use selector::{BootstrapSelector, CrossValidationSelector};
pub use unimodal::{SearchStep, UniModalSearch};

#[derive(Error, Debug, PartialEq)]
pub enum SearchError {
    #[error("Solver error during the search: {0}")]
    Ccd(#[from] CcdError),

    #[error("Summary statistic failed: {0}")]
    Stats(#[from] StatsError),

    #[error("Invalid fold configuration: {folds} folds over {units} sampling units.")]
    InvalidFolds { folds: usize, units: usize },

    #[error("Fold {0} is out of range.")]
    FoldOutOfRange(usize),

    #[error("Exclusion index {0} is out of range.")]
    ExclusionOutOfRange(usize),

    #[error("The objective returned no fold estimates.")]
    EmptyEvaluation,
}
