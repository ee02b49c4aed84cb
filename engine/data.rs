// engine/data.rs

//! # Model Data
//!
//! `ModelData` binds the column store to an outcome: the response `y`, an
//! optional event time, and a stratum id per row. Data is loaded in bulk and
//! then *finalized*, which places the special columns:
//!
//! - The intercept, stored without values as `FormatType::Intercept`.
//! - The offset, a column whose coefficient is fixed at one. It always sits at
//!   column 0 and carries the label `OFFSET_LABEL`; it can be an existing
//!   covariate or the time vector itself.
//!
//! After finalization the structure is read-only as far as the layout is
//! concerned; every structural mutation returns `DataError::AlreadyFinalized`.
//! Every fallible operation validates before it mutates, so a failed call
//! leaves the store as it was.

use crate::columns::{CompressedColumn, CompressedDataMatrix, FormatType};
use crate::model::{ModelType, RiskSetIndex};
use crate::stats::{Power, first_power, median, quantile, second_power};
use ahash::AHashMap;
use itertools::Itertools;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

/// Label assigned to the offset column during finalization.
pub const OFFSET_LABEL: i64 = -1;
/// Label assigned to the intercept column during finalization.
pub const INTERCEPT_LABEL: i64 = -2;

#[derive(Error, Debug, PartialEq)]
pub enum DataError {
    #[error("The data has already been finalized; its layout can no longer change.")]
    AlreadyFinalized,

    #[error("Length mismatch for '{what}': expected {expected}, found {found}.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Covariate {0} was not found.")]
    UnknownCovariate(i64),

    #[error("Covariate {0} already exists.")]
    DuplicateCovariate(i64),

    #[error("Row id {0} does not match any loaded outcome row.")]
    UnknownRow(i64),

    #[error("Row id {0} appears more than once in the outcome.")]
    DuplicateRow(i64),

    #[error("Rows of covariate {covariate} are not strictly increasing at row {row}.")]
    NonIncreasingRows { covariate: i64, row: usize },

    #[error("The data already has an intercept.")]
    InterceptExists,

    #[error("The data already has an offset.")]
    OffsetExists,

    #[error("The offset is already on the log scale and cannot be log-transformed again.")]
    OffsetAlreadyLogScale,

    #[error("The data has no offset column.")]
    NoOffset,

    #[error("No time vector was loaded, but the {0} requires one.")]
    MissingTime(&'static str),

    #[error("Outcome rows cannot be appended once an offset column is placed.")]
    AppendAfterOffset,
}

/// How `load_x` treats a covariate that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    Append,
}

/// Scale used by `ModelData::normalize_covariates`. Covariates are divided by
/// the scale and never centred, so zeros stay zeros and sparse columns stay
/// sparse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationType {
    /// Population standard deviation over all rows.
    StandardDeviation,
    /// Largest absolute value.
    Max,
    /// Median absolute value of the nonzero entries.
    Median,
    /// 95th percentile of the absolute nonzero entries.
    Quantile95,
}

fn column_scale(column: &CompressedColumn, n_rows: usize, kind: NormalizationType) -> f64 {
    let magnitudes = || {
        let mut magnitudes = Vec::with_capacity(column.number_of_entries());
        column.for_each_entry(n_rows, |_, x| {
            if x != 0.0 {
                magnitudes.push(x.abs());
            }
        });
        magnitudes
    };
    match kind {
        NormalizationType::StandardDeviation => {
            let n = n_rows as f64;
            let mean = column.reduce(n_rows, first_power) / n;
            (column.reduce(n_rows, second_power) / n - mean * mean).max(0.0).sqrt()
        }
        NormalizationType::Max => magnitudes().into_iter().fold(0.0, f64::max),
        NormalizationType::Median => median(&magnitudes()).unwrap_or(0.0),
        NormalizationType::Quantile95 => quantile(&magnitudes(), 0.95).unwrap_or(0.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSource {
    Covariate(i64),
    /// The outcome time vector; the column shares its storage.
    Time,
}

#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    pub add_intercept: bool,
    pub offset: Option<OffsetSource>,
    pub offset_already_on_log_scale: bool,
    pub sort_covariates: bool,
    pub dense_covariates: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ModelData {
    model_type: ModelType,
    matrix: CompressedDataMatrix,
    y: Vec<f64>,
    time: Arc<Vec<f64>>,
    strata: Vec<usize>,
    n_strata: usize,
    last_stratum_id: Option<i64>,
    row_index: AHashMap<i64, usize>,
    risk_sets: RiskSetIndex,
    has_intercept: bool,
    has_offset: bool,
    offset_log_scale: bool,
    finalized: bool,
}

impl ModelData {
    pub fn new(model_type: ModelType) -> Self {
        Self {
            model_type,
            matrix: CompressedDataMatrix::new(0),
            y: Vec::new(),
            time: Arc::new(Vec::new()),
            strata: Vec::new(),
            n_strata: 0,
            last_stratum_id: None,
            row_index: AHashMap::new(),
            risk_sets: RiskSetIndex::default(),
            has_intercept: false,
            has_offset: false,
            offset_log_scale: false,
            finalized: false,
        }
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.finalized {
            Err(DataError::AlreadyFinalized)
        } else {
            Ok(())
        }
    }

    /// Appends outcome rows. Consecutive rows sharing a stratum id form one
    /// stratum; strata are numbered from zero in order of appearance, and a
    /// batch whose first stratum id equals the last id of the previous batch
    /// continues that stratum. Without stratum ids every row is its own
    /// stratum. Without row ids, a row's id is its position in the data.
    ///
    /// Columns loaded earlier keep their rows; the appended rows hold implicit
    /// zeros until covariate entries are appended for them.
    pub fn load_y(
        &mut self,
        stratum_ids: &[i64],
        row_ids: &[i64],
        y: &[f64],
        time: &[f64],
    ) -> Result<usize, DataError> {
        self.ensure_open()?;
        if self.has_offset && !y.is_empty() {
            return Err(DataError::AppendAfterOffset);
        }
        let n = y.len();
        for (what, length) in [
            ("stratum ids", stratum_ids.len()),
            ("row ids", row_ids.len()),
            ("time", time.len()),
        ] {
            if length != 0 && length != n {
                return Err(DataError::LengthMismatch {
                    what,
                    expected: n,
                    found: length,
                });
            }
        }
        let first = self.n_rows();
        if first > 0 && n > 0 && self.time.is_empty() != time.is_empty() {
            return Err(DataError::LengthMismatch {
                what: "time",
                expected: if self.time.is_empty() { 0 } else { n },
                found: time.len(),
            });
        }

        let mut batch_index = AHashMap::with_capacity(n);
        for row in 0..n {
            let id = row_ids.get(row).copied().unwrap_or((first + row) as i64);
            if self.row_index.contains_key(&id) || batch_index.insert(id, first + row).is_some() {
                return Err(DataError::DuplicateRow(id));
            }
        }

        let mut n_strata = self.n_strata;
        let mut strata = Vec::with_capacity(n);
        if stratum_ids.is_empty() {
            strata.extend(n_strata..n_strata + n);
            n_strata += n;
        } else {
            for (id, run) in &stratum_ids.iter().chunk_by(|id| **id) {
                let continues = strata.is_empty() && self.last_stratum_id == Some(id) && n_strata > 0;
                let stratum = if continues {
                    n_strata - 1
                } else {
                    n_strata += 1;
                    n_strata - 1
                };
                strata.extend(std::iter::repeat_n(stratum, run.count()));
            }
        }
        if n > 0 {
            self.last_stratum_id = stratum_ids.last().copied();
        }

        self.y.extend_from_slice(y);
        if !time.is_empty() {
            Arc::make_mut(&mut self.time).extend_from_slice(time);
        }
        self.strata.extend(strata);
        self.n_strata = n_strata;
        self.row_index.extend(batch_index);
        self.matrix.set_n_rows(self.y.len());
        log::debug!(
            "Loaded {} outcome rows; {} rows in {} strata in total.",
            n,
            self.y.len(),
            n_strata
        );
        Ok(n)
    }

    /// Appends a batch of outcome rows together with covariate entries given
    /// as `(covariate, row id, value)` triples. Triples of one covariate must
    /// be contiguous; an empty `values` loads indicators. Existing covariates
    /// receive the new entries after their current rows, unknown covariates
    /// are created. On error nothing is appended.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        stratum_ids: &[i64],
        row_ids: &[i64],
        y: &[f64],
        time: &[f64],
        covariate_ids: &[i64],
        covariate_row_ids: &[i64],
        values: &[f64],
    ) -> Result<usize, DataError> {
        let snapshot = self.clone();
        let result = self
            .load_y(stratum_ids, row_ids, y, time)
            .and_then(|rows| {
                self.load_multiple_x(covariate_ids, covariate_row_ids, values, false)
                    .map(|_| rows)
            });
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    fn build_column(
        &self,
        covariate: i64,
        mut column: CompressedColumn,
        row_ids: &[i64],
        values: &[f64],
    ) -> Result<(CompressedColumn, usize), DataError> {
        let mut added = 0;
        if row_ids.is_empty() {
            // Values without row ids cover the trailing rows.
            let first = self.n_rows() - values.len();
            for (offset, value) in values.iter().enumerate() {
                let row = first + offset;
                if !column.add_data(row, *value) {
                    return Err(DataError::NonIncreasingRows { covariate, row });
                }
                added += 1;
            }
        } else {
            for (position, id) in row_ids.iter().enumerate() {
                let row = *self.row_index.get(id).ok_or(DataError::UnknownRow(*id))?;
                let value = values.get(position).copied().unwrap_or(1.0);
                if !column.add_data(row, value) {
                    return Err(DataError::NonIncreasingRows { covariate, row });
                }
                added += 1;
            }
        }
        Ok((column, added))
    }

    /// Loads one covariate. The format follows the inputs: values only is
    /// dense, row ids only is an indicator (sparse when `force_sparse`), and
    /// both is sparse. Returns the number of entries loaded.
    ///
    /// Appending values without row ids to an existing covariate fills the
    /// last `values.len()` rows, which is how a dense column follows an
    /// appended outcome batch.
    pub fn load_x(
        &mut self,
        covariate: i64,
        row_ids: &[i64],
        values: &[f64],
        mode: LoadMode,
        force_sparse: bool,
    ) -> Result<usize, DataError> {
        self.ensure_open()?;
        if !row_ids.is_empty() && !values.is_empty() && row_ids.len() != values.len() {
            return Err(DataError::LengthMismatch {
                what: "covariate values",
                expected: row_ids.len(),
                found: values.len(),
            });
        }
        let existing = self.matrix.column_index(covariate);
        let appending = mode == LoadMode::Append && existing.is_some();
        if row_ids.is_empty() {
            let fits = if appending {
                values.len() <= self.n_rows()
            } else {
                values.len() == self.n_rows()
            };
            if !fits {
                return Err(DataError::LengthMismatch {
                    what: "dense covariate values",
                    expected: self.n_rows(),
                    found: values.len(),
                });
            }
        }

        let start = match (mode, existing) {
            (LoadMode::Append, Some(index)) => self.matrix.column(index).clone(),
            _ => {
                let format = match (row_ids.is_empty(), values.is_empty()) {
                    (true, _) => FormatType::Dense,
                    (false, true) if !force_sparse => FormatType::Indicator,
                    _ => FormatType::Sparse,
                };
                CompressedColumn::empty(format).with_label(covariate)
            }
        };
        let (column, added) = self.build_column(covariate, start, row_ids, values)?;

        match existing {
            Some(index) => {
                *self.matrix.column_mut(index) = column;
            }
            None => {
                self.matrix.push_back(column);
            }
        }
        Ok(added)
    }

    /// Loads many covariates from `(covariate, row, value)` triples. Triples of
    /// one covariate must be contiguous; an empty `values` loads indicators.
    pub fn load_multiple_x(
        &mut self,
        covariate_ids: &[i64],
        row_ids: &[i64],
        values: &[f64],
        force_sparse: bool,
    ) -> Result<usize, DataError> {
        self.ensure_open()?;
        if covariate_ids.len() != row_ids.len() {
            return Err(DataError::LengthMismatch {
                what: "row ids",
                expected: covariate_ids.len(),
                found: row_ids.len(),
            });
        }
        if !values.is_empty() && values.len() != row_ids.len() {
            return Err(DataError::LengthMismatch {
                what: "covariate values",
                expected: row_ids.len(),
                found: values.len(),
            });
        }

        let snapshot = self.matrix.clone();
        let mut total = 0;
        let mut start = 0;
        for (covariate, run) in &covariate_ids.iter().chunk_by(|id| **id) {
            let end = start + run.count();
            let chunk_values = if values.is_empty() {
                &values[..0]
            } else {
                &values[start..end]
            };
            match self.load_x(
                covariate,
                &row_ids[start..end],
                chunk_values,
                LoadMode::Append,
                force_sparse,
            ) {
                Ok(added) => total += added,
                Err(error) => {
                    self.matrix = snapshot;
                    return Err(error);
                }
            }
            start = end;
        }
        Ok(total)
    }

    /// Inserts an empty covariate column at `position`.
    pub fn insert(&mut self, position: usize, format: FormatType, covariate: i64) -> Result<(), DataError> {
        self.ensure_open()?;
        if self.matrix.column_index(covariate).is_some() {
            return Err(DataError::DuplicateCovariate(covariate));
        }
        self.matrix
            .insert(position, CompressedColumn::empty(format).with_label(covariate));
        Ok(())
    }

    pub fn set_covariate_name(&mut self, covariate: i64, name: impl Into<String>) -> Result<(), DataError> {
        let index = self.index_of(covariate)?;
        self.matrix.column_mut(index).set_string_label(name);
        Ok(())
    }

    /// Declares that the caller has loaded its own intercept column at the
    /// first coefficient position.
    pub fn set_has_intercept(&mut self, has_intercept: bool) -> Result<(), DataError> {
        self.ensure_open()?;
        self.has_intercept = has_intercept;
        Ok(())
    }

    /// Moves the offset source to column 0 and labels it `OFFSET_LABEL`.
    pub fn set_offset(&mut self, source: OffsetSource, already_on_log_scale: bool) -> Result<(), DataError> {
        self.ensure_open()?;
        if self.has_offset {
            return Err(DataError::OffsetExists);
        }
        let index = match source {
            OffsetSource::Covariate(id) => self.index_of(id)?,
            OffsetSource::Time => {
                if self.time.is_empty() {
                    return Err(DataError::MissingTime("time offset"));
                }
                self.matrix
                    .push_back(CompressedColumn::shared_dense(Arc::clone(&self.time)))
            }
        };
        self.matrix.move_to_front(index);
        self.matrix.relabel(0, OFFSET_LABEL);
        self.matrix.column_mut(0).set_string_label("(Offset)");
        self.has_offset = true;
        self.offset_log_scale = already_on_log_scale;
        Ok(())
    }

    /// Log-transforms the offset in place.
    pub fn log_transform_offset(&mut self) -> Result<(), DataError> {
        self.ensure_open()?;
        if !self.has_offset {
            return Err(DataError::NoOffset);
        }
        if self.offset_log_scale {
            return Err(DataError::OffsetAlreadyLogScale);
        }
        let n_rows = self.n_rows();
        let offset = self.matrix.column_mut(0);
        if offset.reduce(n_rows, |x| if x <= 0.0 { 1.0 } else { 0.0 }) > 0.0 {
            log::warn!("The offset holds non-positive values; their logarithm is not finite.");
        }
        offset.transform(n_rows, f64::ln);
        self.offset_log_scale = true;
        Ok(())
    }

    /// Divides every covariate by its scale and returns the scales in column
    /// order. The intercept, the offset, and columns whose scale is zero or
    /// not finite are left as they are and report a scale of one.
    pub fn normalize_covariates(&mut self, kind: NormalizationType) -> Result<Vec<f64>, DataError> {
        self.ensure_open()?;
        let n_rows = self.n_rows();
        let intercept = self
            .intercept_index()
            .map(|coefficient| coefficient + usize::from(self.has_offset));
        let mut scales = Vec::with_capacity(self.matrix.n_columns());
        for index in 0..self.matrix.n_columns() {
            let column = self.matrix.column(index);
            let fixed = (self.has_offset && index == 0)
                || Some(index) == intercept
                || column.format() == FormatType::Intercept;
            let scale = if fixed { 1.0 } else { column_scale(column, n_rows, kind) };
            let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
            if scale != 1.0 {
                self.matrix.column_mut(index).scale(scale.recip());
            }
            scales.push(scale);
        }
        log::debug!("Normalized {} columns by {:?}.", scales.len(), kind);
        Ok(scales)
    }

    /// Places the intercept and offset, applies the requested conversions,
    /// and freezes the layout.
    pub fn finalize(&mut self, options: &FinalizeOptions) -> Result<(), DataError> {
        self.ensure_open()?;
        if options.add_intercept && self.has_intercept {
            return Err(DataError::InterceptExists);
        }
        if options.offset.is_some() && self.has_offset {
            return Err(DataError::OffsetExists);
        }
        match options.offset {
            Some(OffsetSource::Covariate(id)) if self.matrix.column_index(id).is_none() => {
                return Err(DataError::UnknownCovariate(id));
            }
            Some(OffsetSource::Time) if self.time.is_empty() => {
                return Err(DataError::MissingTime("time offset"));
            }
            _ => {}
        }
        if self.model_type.uses_time() && self.time.is_empty() {
            return Err(DataError::MissingTime("Cox model"));
        }
        if let Some(id) = options
            .dense_covariates
            .iter()
            .find(|id| self.matrix.column_index(**id).is_none())
        {
            return Err(DataError::UnknownCovariate(*id));
        }

        if options.sort_covariates {
            let fixed = usize::from(self.has_offset) + usize::from(self.has_intercept);
            self.matrix
                .sort_columns_from(fixed, |a, b| a.numeric_label().cmp(&b.numeric_label()));
        }

        let n_rows = self.n_rows();
        for id in &options.dense_covariates {
            if let Some(index) = self.matrix.column_index(*id) {
                self.matrix.column_mut(index).convert_to_dense(n_rows);
            }
        }
        // Dense columns loaded before later outcome batches end early.
        for index in 0..self.matrix.n_columns() {
            let column = self.matrix.column_mut(index);
            if column.format() == FormatType::Dense && column.number_of_entries() < n_rows {
                column.convert_to_dense(n_rows);
            }
        }

        if options.add_intercept {
            let position = usize::from(self.has_offset);
            self.matrix.insert(
                position,
                CompressedColumn::intercept()
                    .with_label(INTERCEPT_LABEL)
                    .with_name("(Intercept)"),
            );
            self.has_intercept = true;
        }

        if let Some(source) = options.offset {
            self.set_offset(source, options.offset_already_on_log_scale)?;
        }

        if self.has_offset && !self.offset_log_scale {
            self.log_transform_offset()?;
        }
        if self.model_type.expects_offset() && !self.has_offset {
            log::warn!(
                "A {} model without an offset assumes equal exposure in every interval.",
                self.model_type
            );
        }
        if self.model_type.uses_time() {
            self.risk_sets = RiskSetIndex::new(&self.time);
        }

        self.finalized = true;
        log::info!(
            "Finalized {} data: {} rows, {} strata, {} coefficients (intercept: {}, offset: {}).",
            self.model_type,
            self.n_rows(),
            self.n_strata,
            self.n_coefficients(),
            self.has_intercept,
            self.has_offset
        );
        Ok(())
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn matrix(&self) -> &CompressedDataMatrix {
        &self.matrix
    }

    pub fn n_rows(&self) -> usize {
        self.matrix.n_rows()
    }

    pub fn n_strata(&self) -> usize {
        self.n_strata
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// Zero-based stratum of each row.
    pub fn strata(&self) -> &[usize] {
        &self.strata
    }

    pub fn risk_sets(&self) -> &RiskSetIndex {
        &self.risk_sets
    }

    pub fn has_intercept(&self) -> bool {
        self.has_intercept
    }

    pub fn has_offset(&self) -> bool {
        self.has_offset
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Columns that carry a free coefficient; the offset is excluded.
    pub fn covariate_range(&self) -> Range<usize> {
        usize::from(self.has_offset)..self.matrix.n_columns()
    }

    pub fn n_coefficients(&self) -> usize {
        self.covariate_range().len()
    }

    /// Column behind coefficient `index`.
    pub fn coefficient_column(&self, index: usize) -> &CompressedColumn {
        self.matrix.column(index + usize::from(self.has_offset))
    }

    pub fn offset_column(&self) -> Option<&CompressedColumn> {
        self.has_offset.then(|| self.matrix.column(0))
    }

    /// Coefficient index of the intercept.
    pub fn intercept_index(&self) -> Option<usize> {
        if !self.has_intercept {
            return None;
        }
        let offset = usize::from(self.has_offset);
        let stored = (offset..self.matrix.n_columns())
            .find(|&c| self.matrix.column(c).format() == FormatType::Intercept)
            .map(|c| c - offset);
        stored.or(Some(0))
    }

    pub fn coefficient_labels(&self) -> Vec<String> {
        self.covariate_range()
            .map(|c| self.matrix.column(c).label().into_owned())
            .collect()
    }

    /// Default prior variance `p · n / Σ x²` over the penalized covariates.
    pub fn normal_based_default_var(&self) -> f64 {
        let intercept = self.intercept_index();
        let mut count = 0usize;
        let mut squares = 0.0;
        for index in 0..self.n_coefficients() {
            if Some(index) == intercept {
                continue;
            }
            count += 1;
            squares += self.coefficient_column(index).reduce(self.n_rows(), second_power);
        }
        if squares == 0.0 {
            return 1.0;
        }
        count as f64 * self.n_rows() as f64 / squares
    }

    fn index_of(&self, covariate: i64) -> Result<usize, DataError> {
        self.matrix
            .column_index(covariate)
            .ok_or(DataError::UnknownCovariate(covariate))
    }

    pub fn sum(&self, covariate: i64, power: Power) -> Result<f64, DataError> {
        let index = self.index_of(covariate)?;
        Ok(self.matrix.reduce(index, |x| power.apply(x)))
    }

    pub fn mean(&self, covariate: i64) -> Result<f64, DataError> {
        Ok(self.sum(covariate, Power::First)? / self.n_rows() as f64)
    }

    /// Population variance of a covariate over all rows.
    pub fn variance(&self, covariate: i64) -> Result<f64, DataError> {
        let n = self.n_rows() as f64;
        let mean = self.mean(covariate)?;
        Ok(self.sum(covariate, Power::Second)? / n - mean * mean)
    }

    /// Sums split by whether `group_by` is nonzero: `[zero group, nonzero group]`.
    pub fn sum_by_group(&self, covariate: i64, group_by: i64, power: Power) -> Result<[f64; 2], DataError> {
        let index = self.index_of(covariate)?;
        let group = self.index_of(group_by)?;
        Ok(self.matrix.reduce_by_group(index, group, |x| power.apply(x)))
    }

    pub fn sum_by_stratum(&self, covariate: i64, power: Power) -> Result<Vec<f64>, DataError> {
        let index = self.index_of(covariate)?;
        Ok(self
            .matrix
            .reduce_by_partition(index, &self.strata, self.n_strata, |x| power.apply(x)))
    }

    pub fn outcome_sum(&self, power: Power) -> f64 {
        self.y.iter().map(|v| power.apply(*v)).sum()
    }

    /// Pearson correlation of each covariate with the outcome; `None` when
    /// either variance is zero.
    pub fn univariable_correlation(&self, covariates: &[i64]) -> Result<Vec<Option<f64>>, DataError> {
        let n = self.n_rows() as f64;
        let y_mean = self.outcome_sum(Power::First) / n;
        let y_variance = self.outcome_sum(Power::Second) / n - y_mean * y_mean;

        covariates
            .iter()
            .map(|&covariate| {
                let index = self.index_of(covariate)?;
                let column = self.matrix.column(index);
                let x_mean = column.reduce(self.n_rows(), first_power) / n;
                let x_variance = column.reduce(self.n_rows(), second_power) / n - x_mean * x_mean;
                let mut cross = 0.0;
                column.for_each_entry(self.n_rows(), |row, x| cross += x * self.y[row]);
                let covariance = cross / n - x_mean * y_mean;
                if x_variance <= 0.0 || y_variance <= 0.0 {
                    Ok(None)
                } else {
                    Ok(Some(covariance / (x_variance * y_variance).sqrt()))
                }
            })
            .collect()
    }

    pub fn mean_offset(&self) -> Option<f64> {
        self.offset_column()
            .map(|column| column.reduce(self.n_rows(), first_power) / self.n_rows() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn logistic_data() -> ModelData {
        let mut data = ModelData::new(ModelType::Logistic);
        data.load_y(&[], &[10, 11, 12, 13], &[0.0, 1.0, 1.0, 0.0], &[])
            .unwrap();
        data.load_x(1, &[], &[1.0, 2.0, 3.0, 4.0], LoadMode::Replace, false)
            .unwrap();
        data.load_x(2, &[11, 12], &[], LoadMode::Replace, false).unwrap();
        data.load_x(3, &[10, 13], &[0.5, -1.5], LoadMode::Replace, false)
            .unwrap();
        data
    }

    #[test]
    fn test_load_x_picks_format_from_inputs() {
        let data = logistic_data();
        let formats: Vec<FormatType> = data.matrix().columns().iter().map(|c| c.format()).collect();
        assert_eq!(
            formats,
            vec![FormatType::Dense, FormatType::Indicator, FormatType::Sparse]
        );

        let mut forced = logistic_data();
        forced.load_x(4, &[10], &[], LoadMode::Replace, true).unwrap();
        assert_eq!(forced.matrix().column(3).format(), FormatType::Sparse);
    }

    #[test]
    fn test_strata_are_reindexed_in_order_of_appearance() {
        let mut data = ModelData::new(ModelType::ConditionalLogistic);
        data.load_y(&[42, 42, 7, 7, 7, 99], &[], &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0], &[])
            .unwrap();
        assert_eq!(data.strata(), &[0, 0, 1, 1, 1, 2]);
        assert_eq!(data.n_strata(), 3);
    }

    #[test]
    fn test_unknown_row_leaves_store_untouched() {
        let mut data = logistic_data();
        let before = data.matrix().n_columns();
        assert_eq!(
            data.load_x(5, &[10, 99], &[1.0, 2.0], LoadMode::Replace, false),
            Err(DataError::UnknownRow(99))
        );
        assert_eq!(data.matrix().n_columns(), before);
    }

    #[test]
    fn test_load_multiple_x_groups_triples() {
        let mut data = ModelData::new(ModelType::Poisson);
        data.load_y(&[], &[], &[1.0, 0.0, 2.0], &[]).unwrap();
        let loaded = data
            .load_multiple_x(&[5, 5, 6], &[0, 2, 1], &[1.0, 3.0, 2.0], false)
            .unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(data.sum(5, Power::First).unwrap(), 4.0);
        assert_eq!(data.sum(6, Power::Second).unwrap(), 4.0);

        // A non-increasing row rolls the whole call back.
        let failed = data.load_multiple_x(&[7, 8, 8], &[0, 2, 1], &[1.0, 1.0, 1.0], false);
        assert!(matches!(failed, Err(DataError::NonIncreasingRows { covariate: 8, .. })));
        assert_eq!(data.matrix().column_index(7), None);
    }

    #[test]
    fn test_finalize_places_intercept_and_offset() {
        let mut data = logistic_data();
        data.finalize(&FinalizeOptions {
            add_intercept: true,
            offset: Some(OffsetSource::Covariate(1)),
            offset_already_on_log_scale: false,
            ..Default::default()
        })
        .unwrap();

        assert!(data.has_offset() && data.has_intercept() && data.is_finalized());
        assert_eq!(data.matrix().column(0).numeric_label(), OFFSET_LABEL);
        assert_eq!(data.matrix().column(1).format(), FormatType::Intercept);
        assert_eq!(data.intercept_index(), Some(0));
        assert_eq!(data.n_coefficients(), 3);
        assert_abs_diff_eq!(
            data.mean_offset().unwrap(),
            (1.0f64.ln() + 2.0f64.ln() + 3.0f64.ln() + 4.0f64.ln()) / 4.0
        );

        assert_eq!(
            data.finalize(&FinalizeOptions::default()),
            Err(DataError::AlreadyFinalized)
        );
        assert_eq!(
            data.insert(0, FormatType::Dense, 9),
            Err(DataError::AlreadyFinalized)
        );
        assert_eq!(
            data.load_x(9, &[], &[0.0; 4], LoadMode::Replace, false),
            Err(DataError::AlreadyFinalized)
        );
    }

    #[test]
    fn test_time_offset_shares_storage_until_transformed() {
        let mut data = ModelData::new(ModelType::SelfControlledCaseSeries);
        data.load_y(&[1, 1], &[], &[1.0, 0.0], &[10.0, 20.0]).unwrap();
        data.finalize(&FinalizeOptions {
            offset: Some(OffsetSource::Time),
            offset_already_on_log_scale: true,
            ..Default::default()
        })
        .unwrap();
        assert!(data.matrix().column(0).is_shared());
        assert_eq!(data.time(), &[10.0, 20.0]);
    }

    #[test]
    fn test_offset_is_never_logged_twice() {
        let mut data = logistic_data();
        assert_eq!(data.log_transform_offset(), Err(DataError::NoOffset));
        data.set_offset(OffsetSource::Covariate(1), false).unwrap();
        data.log_transform_offset().unwrap();
        assert_eq!(
            data.log_transform_offset(),
            Err(DataError::OffsetAlreadyLogScale)
        );
        assert_eq!(
            data.set_offset(OffsetSource::Covariate(2), false),
            Err(DataError::OffsetExists)
        );

        // Finalizing keeps the single transform.
        data.finalize(&FinalizeOptions::default()).unwrap();
        assert_abs_diff_eq!(data.matrix().column(0).values().unwrap()[1], 2.0f64.ln());
    }

    #[test]
    fn test_second_intercept_is_rejected() {
        let mut data = logistic_data();
        data.set_has_intercept(true).unwrap();
        assert_eq!(
            data.finalize(&FinalizeOptions {
                add_intercept: true,
                ..Default::default()
            }),
            Err(DataError::InterceptExists)
        );
        assert_eq!(data.intercept_index(), Some(0));
    }

    #[test]
    fn test_sort_and_densify_on_finalize() {
        let mut data = ModelData::new(ModelType::LeastSquares);
        data.load_y(&[], &[], &[1.0, 2.0, 3.0], &[]).unwrap();
        data.load_x(30, &[1], &[], LoadMode::Replace, false).unwrap();
        data.load_x(10, &[], &[1.0, 0.0, 1.0], LoadMode::Replace, false)
            .unwrap();
        data.finalize(&FinalizeOptions {
            sort_covariates: true,
            dense_covariates: vec![30],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(data.coefficient_labels(), vec!["10", "30"]);
        assert_eq!(data.matrix().column(1).format(), FormatType::Dense);
    }

    #[test]
    fn test_missing_dense_covariate_fails_before_mutation() {
        let mut data = logistic_data();
        let options = FinalizeOptions {
            add_intercept: true,
            dense_covariates: vec![77],
            ..Default::default()
        };
        assert_eq!(data.finalize(&options), Err(DataError::UnknownCovariate(77)));
        assert!(!data.has_intercept());
        assert!(!data.is_finalized());
    }

    #[test]
    fn test_summary_statistics() {
        let data = logistic_data();
        assert_eq!(data.sum(2, Power::Zero).unwrap(), 2.0);
        assert_abs_diff_eq!(data.mean(1).unwrap(), 2.5);
        assert_abs_diff_eq!(data.variance(1).unwrap(), 1.25);
        assert_eq!(data.sum_by_group(1, 2, Power::Zero).unwrap(), [2.0, 2.0]);
        assert_eq!(data.sum_by_group(3, 2, Power::Zero).unwrap(), [2.0, 0.0]);
        assert_eq!(data.sum_by_stratum(1, Power::First).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(data.outcome_sum(Power::First), 2.0);

        let correlations = data.univariable_correlation(&[1, 2]).unwrap();
        assert_abs_diff_eq!(correlations[0].unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(correlations[1].unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(data.mean_offset(), None);
    }

    #[test]
    fn test_constant_covariate_has_no_correlation() {
        let mut data = ModelData::new(ModelType::LeastSquares);
        data.load_y(&[], &[], &[1.0, 2.0], &[]).unwrap();
        data.load_x(1, &[], &[3.0, 3.0], LoadMode::Replace, false).unwrap();
        assert_eq!(data.univariable_correlation(&[1]).unwrap(), vec![None]);
        assert_eq!(
            data.univariable_correlation(&[8]),
            Err(DataError::UnknownCovariate(8))
        );
    }

    #[test]
    fn test_default_variance_skips_intercept() {
        let mut data = ModelData::new(ModelType::Logistic);
        data.load_y(&[], &[], &[0.0, 1.0], &[]).unwrap();
        data.load_x(1, &[], &[1.0, 1.0], LoadMode::Replace, false).unwrap();
        data.finalize(&FinalizeOptions {
            add_intercept: true,
            ..Default::default()
        })
        .unwrap();
        // One penalized covariate, two rows, Σx² = 2.
        assert_abs_diff_eq!(data.normal_based_default_var(), 1.0);
    }

    #[test]
    fn test_second_outcome_batch_keeps_covariates_aligned() {
        let mut data = ModelData::new(ModelType::ConditionalLogistic);
        assert_eq!(data.load_y(&[1, 1], &[0, 1], &[0.0, 1.0], &[]), Ok(2));
        data.load_x(7, &[0, 1], &[1.0, 2.0], LoadMode::Replace, false).unwrap();
        assert_eq!(data.load_y(&[2, 2], &[2, 3], &[1.0, 0.0], &[]), Ok(2));

        assert_eq!(data.n_rows(), 4);
        assert_eq!(data.y(), &[0.0, 1.0, 1.0, 0.0]);
        assert_eq!(data.strata(), &[0, 0, 1, 1]);
        assert_eq!(data.n_strata(), 2);

        data.load_x(7, &[3], &[5.0], LoadMode::Append, false).unwrap();
        assert_eq!(
            data.load_y(&[3], &[1], &[1.0], &[]),
            Err(DataError::DuplicateRow(1))
        );
        assert_eq!(data.n_rows(), 4);

        data.finalize(&FinalizeOptions::default()).unwrap();
        let index = data.matrix().column_index(7).unwrap();
        assert_eq!(data.matrix().column(index).fill(4), vec![1.0, 2.0, 0.0, 5.0]);
    }

    #[test]
    fn test_append_continues_stratum_across_batches() {
        let mut data = ModelData::new(ModelType::ConditionalLogistic);
        let first = data
            .append(&[5, 5, 8], &[], &[1.0, 0.0, 1.0], &[], &[1, 1], &[0, 2], &[0.5, 1.5])
            .unwrap();
        assert_eq!(first, 3);
        let second = data
            .append(&[8, 9, 9], &[], &[0.0, 0.0, 1.0], &[], &[1, 2], &[4, 3], &[2.5, 1.0])
            .unwrap();
        assert_eq!(second, 3);

        assert_eq!(data.strata(), &[0, 0, 1, 1, 2, 2]);
        assert_eq!(data.n_strata(), 3);
        assert_eq!(data.sum_by_stratum(1, Power::First).unwrap(), vec![0.5, 1.5, 2.5]);
        assert_eq!(data.sum(2, Power::First).unwrap(), 1.0);

        // Row 0 lies before the covariate's last entry: nothing is appended.
        let failed = data.append(&[9], &[], &[1.0], &[], &[1], &[0], &[1.0]);
        assert!(matches!(failed, Err(DataError::NonIncreasingRows { covariate: 1, .. })));
        assert_eq!(data.n_rows(), 6);
        assert_eq!(data.strata().len(), 6);
        assert_eq!(data.n_strata(), 3);
    }

    #[test]
    fn test_dense_append_fills_trailing_rows() {
        let mut data = ModelData::new(ModelType::LeastSquares);
        data.load_y(&[], &[], &[1.0, 2.0], &[]).unwrap();
        data.load_x(1, &[], &[1.0, 2.0], LoadMode::Replace, false).unwrap();
        data.load_x(2, &[], &[4.0, 4.0], LoadMode::Replace, false).unwrap();
        data.load_y(&[], &[], &[3.0], &[]).unwrap();
        assert_eq!(data.strata(), &[0, 1, 2]);

        data.load_x(1, &[], &[3.0], LoadMode::Append, false).unwrap();
        assert_eq!(data.sum(1, Power::First).unwrap(), 6.0);
        assert!(matches!(
            data.load_x(1, &[], &[4.0], LoadMode::Append, false),
            Err(DataError::NonIncreasingRows { covariate: 1, row: 2 })
        ));
        assert!(matches!(
            data.load_x(3, &[], &[1.0], LoadMode::Replace, false),
            Err(DataError::LengthMismatch { .. })
        ));

        // Covariate 2 was never extended; finalize pads it with zeros.
        data.finalize(&FinalizeOptions::default()).unwrap();
        let index = data.matrix().column_index(2).unwrap();
        assert_eq!(data.matrix().column(index).values().unwrap(), &[4.0, 4.0, 0.0]);
    }

    #[test]
    fn test_appended_batches_agree_on_time() {
        let mut data = ModelData::new(ModelType::Cox);
        data.load_y(&[], &[], &[1.0, 0.0], &[3.0, 5.0]).unwrap();
        assert!(matches!(
            data.load_y(&[], &[], &[1.0], &[]),
            Err(DataError::LengthMismatch { what: "time", .. })
        ));
        data.load_y(&[], &[], &[1.0], &[2.0]).unwrap();
        assert_eq!(data.time(), &[3.0, 5.0, 2.0]);

        data.set_offset(OffsetSource::Time, true).unwrap();
        assert_eq!(
            data.load_y(&[], &[], &[0.0], &[1.0]),
            Err(DataError::AppendAfterOffset)
        );
    }

    #[test]
    fn test_normalize_by_standard_deviation() {
        let mut data = logistic_data();
        let scales = data
            .normalize_covariates(NormalizationType::StandardDeviation)
            .unwrap();
        assert_eq!(scales.len(), 3);
        assert_abs_diff_eq!(scales[0], 1.25f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(scales[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(scales[2], 0.75, epsilon = 1e-12);

        for covariate in [1, 2, 3] {
            assert_abs_diff_eq!(data.variance(covariate).unwrap(), 1.0, epsilon = 1e-12);
        }
        assert_eq!(data.matrix().column(1).format(), FormatType::Sparse);
        assert_eq!(data.matrix().column(2).format(), FormatType::Sparse);
        assert_abs_diff_eq!(data.mean(3).unwrap(), -0.25 / 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_normalize_by_max_skips_offset_and_constant_zero() {
        let mut data = logistic_data();
        data.load_x(4, &[], &[0.0; 4], LoadMode::Replace, false).unwrap();
        data.set_offset(OffsetSource::Covariate(1), true).unwrap();
        let scales = data.normalize_covariates(NormalizationType::Max).unwrap();

        // Offset, indicator (max 1), sparse, all-zero.
        assert_eq!(scales, vec![1.0, 1.0, 1.5, 1.0]);
        assert_eq!(data.matrix().column(0).values().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(data.matrix().column(1).format(), FormatType::Indicator);
        assert_abs_diff_eq!(
            data.sum(3, Power::Second).unwrap(),
            (0.5f64 / 1.5).powi(2) + 1.0,
            epsilon = 1e-12
        );

        data.finalize(&FinalizeOptions::default()).unwrap();
        assert_eq!(
            data.normalize_covariates(NormalizationType::Max),
            Err(DataError::AlreadyFinalized)
        );
    }
}
