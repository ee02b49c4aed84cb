// engine/arguments.rs

//! Run configuration.
//!
//! `CcdArguments` is the single source of truth for a run. It serializes to
//! TOML so a run can be described in a file and reproduced, and every field has
//! a default so a partial file is enough. The CLI overlays its flags on top.

use crate::ccd::{CcdSettings, ConvergenceType};
use crate::mcmc::McmcSettings;
use crate::model::ModelType;
use crate::prior::PriorType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArgumentError {
    #[error("Failed to read or write the configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("GPU execution is not supported by this build; remove `use_gpu` (device {0}).")]
    GpuUnsupported(i32),
    #[error("Unsupported input file format '{0}'. The only supported format is 'tsv'.")]
    UnsupportedFormat(String),
    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ArgumentError {
    ArgumentError::InvalidValue {
        name,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationArguments {
    pub enabled: bool,
    /// Lower variance limit of the grid.
    pub lower_limit: f64,
    /// Upper variance limit of the grid.
    pub upper_limit: f64,
    pub fold: usize,
    /// How many of the folds are evaluated per trial.
    pub fold_to_compute: usize,
    pub grid_steps: usize,
    /// Adaptive search instead of a fixed grid.
    pub auto_search: bool,
    pub refit_at_optimal: bool,
    pub max_steps: usize,
}

impl Default for CrossValidationArguments {
    fn default() -> Self {
        Self {
            enabled: false,
            lower_limit: 0.01,
            upper_limit: 20.0,
            fold: 10,
            fold_to_compute: 10,
            grid_steps: 10,
            auto_search: true,
            refit_at_optimal: true,
            max_steps: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapArguments {
    /// Zero disables the bootstrap.
    pub replicates: usize,
    pub report_raw_estimates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcArguments {
    /// Zero disables sampling.
    pub samples: usize,
    pub burn_in: usize,
    /// Log-scale proposal tuning; the proposal covariance is `exp(-tuning) P⁻¹`.
    pub tuning: f64,
    pub use_hastings_ratio: bool,
    /// Gibbs-update the normal prior variance between Metropolis steps.
    pub sample_variance: bool,
    /// Robbins-Monro adaptation of the tuning during burn-in.
    pub adapt_tuning: bool,
    pub target_acceptance: f64,
}

impl Default for McmcArguments {
    fn default() -> Self {
        Self {
            samples: 0,
            burn_in: 100,
            tuning: 0.0,
            use_hastings_ratio: true,
            sample_variance: false,
            adapt_tuning: false,
            target_acceptance: 0.234,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcdArguments {
    pub input_path: String,
    pub output_path: String,
    pub file_format: String,
    pub use_gpu: bool,
    pub device_number: i32,
    pub tolerance: f64,
    /// Prior variance; `None` uses the data-driven default, `0` disables the prior.
    pub hyperprior: Option<f64>,
    pub use_normal_prior: bool,
    pub max_iterations: usize,
    pub convergence: ConvergenceType,
    pub seed: u64,
    pub add_intercept: bool,
    pub model_type: ModelType,
    pub model_name: String,
    pub cross_validation: CrossValidationArguments,
    pub bootstrap: BootstrapArguments,
    pub mcmc: McmcArguments,
}

impl Default for CcdArguments {
    fn default() -> Self {
        let settings = CcdSettings::default();
        Self {
            input_path: String::new(),
            output_path: "cyclops_report.toml".to_string(),
            file_format: "tsv".to_string(),
            use_gpu: false,
            device_number: -1,
            tolerance: settings.tolerance,
            hyperprior: None,
            use_normal_prior: false,
            max_iterations: settings.max_iterations,
            convergence: settings.convergence,
            seed: 123,
            add_intercept: true,
            model_type: ModelType::Logistic,
            model_name: String::new(),
            cross_validation: CrossValidationArguments::default(),
            bootstrap: BootstrapArguments::default(),
            mcmc: McmcArguments::default(),
        }
    }
}

impl CcdArguments {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArgumentError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ArgumentError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ArgumentError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings this build cannot honour before any data is read.
    pub fn validate(&self) -> Result<(), ArgumentError> {
        if self.use_gpu {
            return Err(ArgumentError::GpuUnsupported(self.device_number));
        }
        if !self.file_format.eq_ignore_ascii_case("tsv") {
            return Err(ArgumentError::UnsupportedFormat(self.file_format.clone()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(invalid("tolerance", format!("{} is not a positive number", self.tolerance)));
        }
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations", "must be at least 1"));
        }
        if let Some(variance) = self.hyperprior {
            if !(variance.is_finite() && variance >= 0.0) {
                return Err(invalid("hyperprior", format!("{variance} is not a non-negative variance")));
            }
        }

        let cv = &self.cross_validation;
        if cv.enabled {
            if cv.fold < 2 {
                return Err(invalid("cross_validation.fold", "at least two folds are required"));
            }
            if cv.fold_to_compute == 0 || cv.fold_to_compute > cv.fold {
                return Err(invalid(
                    "cross_validation.fold_to_compute",
                    format!("must lie in 1..={}", cv.fold),
                ));
            }
            if !(cv.lower_limit > 0.0 && cv.lower_limit < cv.upper_limit) {
                return Err(invalid(
                    "cross_validation.lower_limit",
                    "limits must satisfy 0 < lower_limit < upper_limit",
                ));
            }
            if !cv.auto_search && cv.grid_steps < 2 {
                return Err(invalid("cross_validation.grid_steps", "a grid needs at least two points"));
            }
        }

        let mcmc = &self.mcmc;
        if mcmc.samples > 0 {
            if !mcmc.tuning.is_finite() {
                return Err(invalid("mcmc.tuning", "must be finite"));
            }
            if !(mcmc.target_acceptance > 0.0 && mcmc.target_acceptance < 1.0) {
                return Err(invalid("mcmc.target_acceptance", "must lie strictly between 0 and 1"));
            }
        }
        Ok(())
    }

    pub fn ccd_settings(&self) -> CcdSettings {
        CcdSettings {
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            convergence: self.convergence,
        }
    }

    pub fn mcmc_settings(&self) -> McmcSettings {
        let mcmc = &self.mcmc;
        McmcSettings {
            samples: mcmc.samples,
            burn_in: mcmc.burn_in,
            tuning: mcmc.tuning,
            use_hastings_ratio: mcmc.use_hastings_ratio,
            sample_variance: mcmc.sample_variance,
            adapt_tuning: mcmc.adapt_tuning,
            target_acceptance: mcmc.target_acceptance,
        }
    }

    pub fn prior_type(&self) -> PriorType {
        match self.hyperprior {
            Some(variance) if variance == 0.0 => PriorType::None,
            _ if self.use_normal_prior => PriorType::Normal,
            _ => PriorType::Laplace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        assert!(CcdArguments::default().validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut arguments = CcdArguments {
            model_type: ModelType::Cox,
            hyperprior: Some(0.5),
            use_normal_prior: true,
            ..Default::default()
        };
        arguments.cross_validation.enabled = true;
        arguments.mcmc.samples = 200;
        arguments.save(&path).unwrap();

        let loaded = CcdArguments::load(&path).unwrap();
        assert_eq!(loaded, arguments);
        assert_eq!(loaded.prior_type(), PriorType::Normal);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let arguments: CcdArguments = toml::from_str(
            "model_type = \"poisson\"\n[cross_validation]\nfold = 5\n",
        )
        .unwrap();
        assert_eq!(arguments.model_type, ModelType::Poisson);
        assert_eq!(arguments.cross_validation.fold, 5);
        assert_eq!(arguments.cross_validation.grid_steps, 10);
        assert_eq!(arguments.tolerance, 1e-6);
    }

    #[test]
    fn test_gpu_is_rejected() {
        let arguments = CcdArguments {
            use_gpu: true,
            device_number: 0,
            ..Default::default()
        };
        assert!(matches!(arguments.validate(), Err(ArgumentError::GpuUnsupported(0))));
    }

    #[test]
    fn test_unsupported_format_is_rejected() {
        let arguments = CcdArguments {
            file_format: "sccs".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            arguments.validate(),
            Err(ArgumentError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_fold_to_compute_must_fit() {
        let mut arguments = CcdArguments::default();
        arguments.cross_validation.enabled = true;
        arguments.cross_validation.fold_to_compute = 11;
        assert!(matches!(
            arguments.validate(),
            Err(ArgumentError::InvalidValue {
                name: "cross_validation.fold_to_compute",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_hyperprior_means_no_prior() {
        let arguments = CcdArguments {
            hyperprior: Some(0.0),
            use_normal_prior: true,
            ..Default::default()
        };
        assert_eq!(arguments.prior_type(), PriorType::None);
    }
}
