// engine/io.rs

//! Tab-delimited input and TOML reports.
//!
//! The input file has a header row. Recognized columns:
//!
//! - `stratum` (optional): stratum id per row; rows of one stratum must be
//!   contiguous.
//! - `y` (required): the outcome (event indicator for Cox models).
//! - `time` (optional): event or exposure time.
//!
//! Every other column is a covariate. A numeric header is used as the
//! covariate label; any other header becomes the covariate's name and the
//! label is assigned after the largest numeric label.

use crate::ccd::FitSummary;
use crate::data::{DataError, LoadMode, ModelData};
use crate::mcmc::McmcSummary;
use crate::model::ModelType;
use crate::prior::PriorType;
use crate::search::{BootstrapSummary, SearchOutcome};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Covariates with fewer nonzero rows than this share are stored sparse.
const SPARSE_DENSITY: f64 = 0.5;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("Failed to read or write '{path}': {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to read tab-delimited input: {0}")]
    Csv(#[from] csv::Error),
    #[error("Required column '{0}' is missing from the header.")]
    MissingColumn(&'static str),
    #[error("Line {line}, column '{column}': cannot parse '{value}' as a number.")]
    Parse {
        line: usize,
        column: String,
        value: String,
    },
    #[error("Input error: {0}")]
    Data(#[from] DataError),
    #[error("Failed to parse the TOML report: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the report to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

enum Role {
    Stratum,
    Outcome,
    Time,
    Covariate(i64),
}

/// Reads a tab-delimited file into (unfinalized) model data.
pub fn read_tsv(path: impl AsRef<Path>, model_type: ModelType) -> Result<ModelData, IoError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut next_label = headers
        .iter()
        .filter_map(|h| h.trim().parse::<i64>().ok())
        .max()
        .unwrap_or(0)
        .max(0)
        + 1;
    let mut names = Vec::new();
    let roles: Vec<Role> = headers
        .iter()
        .map(|header| match header.trim() {
            "stratum" | "stratum_id" => Role::Stratum,
            "y" | "outcome" => Role::Outcome,
            "time" => Role::Time,
            other => match other.parse::<i64>() {
                Ok(label) => Role::Covariate(label),
                Err(_) => {
                    let label = next_label;
                    next_label += 1;
                    names.push((label, other.to_string()));
                    Role::Covariate(label)
                }
            },
        })
        .collect();
    if !roles.iter().any(|r| matches!(r, Role::Outcome)) {
        return Err(IoError::MissingColumn("y"));
    }

    let mut strata = Vec::new();
    let mut y = Vec::new();
    let mut time = Vec::new();
    let mut covariates: Vec<(i64, Vec<f64>)> = roles
        .iter()
        .filter_map(|r| match r {
            Role::Covariate(label) => Some((*label, Vec::new())),
            _ => None,
        })
        .collect();

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let line = index + 2;
        let mut covariate = 0;
        for (field, (role, header)) in record.iter().zip(roles.iter().zip(headers.iter())) {
            let number = |value: &str| {
                value.trim().parse::<f64>().map_err(|_| IoError::Parse {
                    line,
                    column: header.to_string(),
                    value: value.to_string(),
                })
            };
            match role {
                Role::Stratum => {
                    let id = field.trim().parse::<i64>().map_err(|_| IoError::Parse {
                        line,
                        column: header.to_string(),
                        value: field.to_string(),
                    })?;
                    strata.push(id);
                }
                Role::Outcome => y.push(number(field)?),
                Role::Time => time.push(number(field)?),
                Role::Covariate(_) => {
                    covariates[covariate].1.push(number(field)?);
                    covariate += 1;
                }
            }
        }
    }

    let mut data = ModelData::new(model_type);
    data.load_y(&strata, &[], &y, &time)?;
    let n_rows = y.len();
    for (label, values) in covariates {
        let nonzero = values.iter().filter(|v| **v != 0.0).count();
        if n_rows > 0 && (nonzero as f64) < SPARSE_DENSITY * n_rows as f64 {
            let (rows, entries): (Vec<i64>, Vec<f64>) = values
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0)
                .map(|(row, v)| (row as i64, *v))
                .unzip();
            data.load_x(label, &rows, &entries, LoadMode::Replace, true)?;
        } else {
            data.load_x(label, &[], &values, LoadMode::Replace, false)?;
        }
    }
    for (label, name) in names {
        data.set_covariate_name(label, name)?;
    }
    log::info!(
        "Read {} rows and {} covariates from {}.",
        n_rows,
        data.matrix().n_columns(),
        path.display()
    );
    Ok(data)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientEstimate {
    pub label: String,
    pub estimate: f64,
}

/// Everything a run produces, written as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub model_type: ModelType,
    pub model_name: String,
    pub prior: PriorType,
    pub variance: f64,
    pub class_variance: Option<f64>,
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub fit: Option<FitSummary>,
    pub coefficients: Vec<CoefficientEstimate>,
    pub search: Option<SearchOutcome>,
    pub bootstrap: Option<BootstrapSummary>,
    pub mcmc: Option<McmcSummary>,
}

impl FitReport {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        let path = path.as_ref();
        let toml_string = toml::to_string_pretty(self)?;
        let file_error = |source| IoError::File {
            path: path.display().to_string(),
            source,
        };
        let mut file = BufWriter::new(fs::File::create(path).map_err(file_error)?);
        file.write_all(toml_string.as_bytes()).map_err(file_error)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref();
        let toml_string = fs::read_to_string(path).map_err(|source| IoError::File {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&toml_string)?)
    }
}
