//! # Compressed Column Store
//!
//! Covariates are stored column by column, each in the cheapest of four
//! formats:
//!
//! - `Dense`: one value per row (trailing implicit zeros are allowed).
//! - `Sparse`: strictly increasing row indices with their nonzero values.
//! - `Indicator`: strictly increasing row indices whose value is exactly one.
//! - `Intercept`: the constant one, with no storage at all.
//!
//! The format decides how the solver walks a column when it computes a
//! coordinate's gradient and curvature, so the row-index invariant is enforced
//! at insertion time rather than checked in the hot loop.

use ahash::AHashMap;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ColumnError {
    #[error("Row indices must be strictly increasing; row {row} follows row {previous}.")]
    RowsNotIncreasing { previous: usize, row: usize },
    #[error("A sparse column needs one value per row index ({rows} rows, {values} values).")]
    LengthMismatch { rows: usize, values: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatType {
    Dense,
    Sparse,
    Indicator,
    Intercept,
}

impl FormatType {
    pub fn as_str(self) -> &'static str {
        match self {
            FormatType::Dense => "dense",
            FormatType::Sparse => "sparse",
            FormatType::Indicator => "indicator",
            FormatType::Intercept => "intercept",
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing storage of a dense column.
///
/// `Shared` storage belongs to another structure (the outcome time vector when
/// it doubles as an offset). The column only holds a reference count; the
/// first mutation copies the values into `Owned` storage, so the original is
/// never altered or freed by the store.
#[derive(Debug, Clone)]
pub enum DenseValues {
    Owned(Vec<f64>),
    Shared(Arc<Vec<f64>>),
}

impl DenseValues {
    pub fn as_slice(&self) -> &[f64] {
        match self {
            DenseValues::Owned(values) => values,
            DenseValues::Shared(values) => values.as_slice(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, DenseValues::Shared(_))
    }

    fn to_mut(&mut self) -> &mut Vec<f64> {
        if let DenseValues::Shared(shared) = self {
            let owned = shared.as_ref().clone();
            *self = DenseValues::Owned(owned);
        }
        match self {
            DenseValues::Owned(values) => values,
            DenseValues::Shared(shared) => Arc::make_mut(shared),
        }
    }
}

#[derive(Debug, Clone)]
enum ColumnData {
    Dense(DenseValues),
    Sparse { rows: Vec<usize>, values: Vec<f64> },
    Indicator { rows: Vec<usize> },
    Intercept,
}

fn check_increasing(rows: &[usize]) -> Result<(), ColumnError> {
    for pair in rows.windows(2) {
        if pair[1] <= pair[0] {
            return Err(ColumnError::RowsNotIncreasing {
                previous: pair[0],
                row: pair[1],
            });
        }
    }
    Ok(())
}

/// One covariate.
#[derive(Debug, Clone)]
pub struct CompressedColumn {
    data: ColumnData,
    numeric_label: i64,
    string_label: Option<String>,
}

impl CompressedColumn {
    /// An empty column of the requested format, ready for `add_data`.
    pub fn empty(format: FormatType) -> Self {
        let data = match format {
            FormatType::Dense => ColumnData::Dense(DenseValues::Owned(Vec::new())),
            FormatType::Sparse => ColumnData::Sparse {
                rows: Vec::new(),
                values: Vec::new(),
            },
            FormatType::Indicator => ColumnData::Indicator { rows: Vec::new() },
            FormatType::Intercept => ColumnData::Intercept,
        };
        Self::from_data(data)
    }

    pub fn dense(values: Vec<f64>) -> Self {
        Self::from_data(ColumnData::Dense(DenseValues::Owned(values)))
    }

    /// A dense column reading from storage owned elsewhere.
    pub fn shared_dense(values: Arc<Vec<f64>>) -> Self {
        Self::from_data(ColumnData::Dense(DenseValues::Shared(values)))
    }

    pub fn sparse(rows: Vec<usize>, values: Vec<f64>) -> Result<Self, ColumnError> {
        if rows.len() != values.len() {
            return Err(ColumnError::LengthMismatch {
                rows: rows.len(),
                values: values.len(),
            });
        }
        check_increasing(&rows)?;
        Ok(Self::from_data(ColumnData::Sparse { rows, values }))
    }

    pub fn indicator(rows: Vec<usize>) -> Result<Self, ColumnError> {
        check_increasing(&rows)?;
        Ok(Self::from_data(ColumnData::Indicator { rows }))
    }

    pub fn intercept() -> Self {
        Self::from_data(ColumnData::Intercept)
    }

    fn from_data(data: ColumnData) -> Self {
        Self {
            data,
            numeric_label: 0,
            string_label: None,
        }
    }

    pub fn with_label(mut self, label: i64) -> Self {
        self.numeric_label = label;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.string_label = Some(name.into());
        self
    }

    pub fn format(&self) -> FormatType {
        match self.data {
            ColumnData::Dense(_) => FormatType::Dense,
            ColumnData::Sparse { .. } => FormatType::Sparse,
            ColumnData::Indicator { .. } => FormatType::Indicator,
            ColumnData::Intercept => FormatType::Intercept,
        }
    }

    pub fn numeric_label(&self) -> i64 {
        self.numeric_label
    }

    /// The string label if one was assigned, otherwise the numeric label
    /// rendered as text. Computed on demand, so it always follows the numeric
    /// label.
    pub fn label(&self) -> Cow<'_, str> {
        match &self.string_label {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(self.numeric_label.to_string()),
        }
    }

    pub fn set_string_label(&mut self, name: impl Into<String>) {
        self.string_label = Some(name.into());
    }

    // The numeric label is indexed by the owning matrix, so only the matrix
    // may alter it.
    fn set_numeric_label(&mut self, label: i64) {
        self.numeric_label = label;
    }

    /// Stored entries: dense length, sparse/indicator nonzero count, zero for
    /// an intercept.
    pub fn number_of_entries(&self) -> usize {
        match &self.data {
            ColumnData::Dense(values) => values.as_slice().len(),
            ColumnData::Sparse { rows, .. } | ColumnData::Indicator { rows } => rows.len(),
            ColumnData::Intercept => 0,
        }
    }

    pub fn rows(&self) -> Option<&[usize]> {
        match &self.data {
            ColumnData::Sparse { rows, .. } | ColumnData::Indicator { rows } => Some(rows),
            _ => None,
        }
    }

    pub fn values(&self) -> Option<&[f64]> {
        match &self.data {
            ColumnData::Dense(values) => Some(values.as_slice()),
            ColumnData::Sparse { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(&self.data, ColumnData::Dense(values) if values.is_shared())
    }

    /// Appends one entry, returning `false` when the entry cannot be placed.
    ///
    /// Dense columns back-fill zeros up to `row`; sparse and indicator columns
    /// require `row` to be strictly greater than the last stored row, and store
    /// nothing for a zero value. Intercept columns ignore the call.
    pub fn add_data(&mut self, row: usize, value: f64) -> bool {
        match &mut self.data {
            ColumnData::Dense(values) => {
                let values = values.to_mut();
                if row < values.len() {
                    return false;
                }
                values.resize(row, 0.0);
                values.push(value);
                true
            }
            ColumnData::Sparse { rows, values } => {
                if value == 0.0 {
                    return true;
                }
                if rows.last().is_some_and(|&last| row <= last) {
                    return false;
                }
                rows.push(row);
                values.push(value);
                true
            }
            ColumnData::Indicator { rows } => {
                if value == 0.0 {
                    return true;
                }
                if rows.last().is_some_and(|&last| row <= last) {
                    return false;
                }
                rows.push(row);
                true
            }
            ColumnData::Intercept => true,
        }
    }

    /// Expands the column into `n_rows` dense values.
    pub fn fill(&self, n_rows: usize) -> Vec<f64> {
        let mut dense = vec![0.0; n_rows];
        self.for_each_entry(n_rows, |row, value| {
            if row < n_rows {
                dense[row] = value;
            }
        });
        dense
    }

    pub fn convert_to_dense(&mut self, n_rows: usize) {
        if let ColumnData::Dense(values) = &mut self.data {
            let values = values.to_mut();
            if values.len() < n_rows {
                values.resize(n_rows, 0.0);
            }
            return;
        }
        let dense = self.fill(n_rows);
        self.data = ColumnData::Dense(DenseValues::Owned(dense));
    }

    /// Drops explicit zeros; indicator and intercept columns are not altered
    /// because they are already the more compact representation.
    pub fn convert_to_sparse(&mut self) {
        if let ColumnData::Dense(values) = &self.data {
            let (rows, nonzero): (Vec<usize>, Vec<f64>) = values
                .as_slice()
                .iter()
                .enumerate()
                .filter(|(_, value)| **value != 0.0)
                .map(|(row, value)| (row, *value))
                .unzip();
            self.data = ColumnData::Sparse {
                rows,
                values: nonzero,
            };
        }
    }

    /// Visits every stored `(row, value)` pair in increasing row order.
    /// Rows not visited hold an implicit zero.
    pub fn for_each_entry<F: FnMut(usize, f64)>(&self, n_rows: usize, mut visit: F) {
        match &self.data {
            ColumnData::Dense(values) => {
                for (row, value) in values.as_slice().iter().enumerate() {
                    visit(row, *value);
                }
            }
            ColumnData::Sparse { rows, values } => {
                for (row, value) in rows.iter().zip(values) {
                    visit(*row, *value);
                }
            }
            ColumnData::Indicator { rows } => {
                for row in rows {
                    visit(*row, 1.0);
                }
            }
            ColumnData::Intercept => {
                for row in 0..n_rows {
                    visit(row, 1.0);
                }
            }
        }
    }

    /// Applies `f` to every row; the column becomes dense.
    pub fn transform<F: Fn(f64) -> f64>(&mut self, n_rows: usize, f: F) {
        self.convert_to_dense(n_rows);
        if let ColumnData::Dense(values) = &mut self.data {
            for value in values.to_mut().iter_mut() {
                *value = f(*value);
            }
        }
    }

    /// Multiplies every value by `factor` without changing the sparsity
    /// pattern; an indicator column becomes sparse with value `factor`.
    /// Intercept columns are left alone.
    pub fn scale(&mut self, factor: f64) {
        match &mut self.data {
            ColumnData::Dense(values) => {
                for value in values.to_mut().iter_mut() {
                    *value *= factor;
                }
            }
            ColumnData::Sparse { values, .. } => {
                for value in values.iter_mut() {
                    *value *= factor;
                }
            }
            ColumnData::Indicator { rows } => {
                let rows = std::mem::take(rows);
                let values = vec![factor; rows.len()];
                self.data = ColumnData::Sparse { rows, values };
            }
            ColumnData::Intercept => {}
        }
    }

    /// `Σ f(x)` over all `n_rows` rows, implicit zeros included.
    pub fn reduce<F: Fn(f64) -> f64>(&self, n_rows: usize, f: F) -> f64 {
        let mut total = 0.0;
        let mut visited = 0usize;
        self.for_each_entry(n_rows, |_, value| {
            total += f(value);
            visited += 1;
        });
        let implicit = n_rows.saturating_sub(visited);
        if implicit > 0 {
            total += implicit as f64 * f(0.0);
        }
        total
    }
}

/// An ordered set of columns sharing a row count, with a label index.
#[derive(Debug, Clone, Default)]
pub struct CompressedDataMatrix {
    columns: Vec<CompressedColumn>,
    n_rows: usize,
    label_index: AHashMap<i64, usize>,
}

impl CompressedDataMatrix {
    pub fn new(n_rows: usize) -> Self {
        Self {
            columns: Vec::new(),
            n_rows,
            label_index: AHashMap::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn set_n_rows(&mut self, n_rows: usize) {
        self.n_rows = n_rows;
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> &CompressedColumn {
        &self.columns[index]
    }

    pub fn column_mut(&mut self, index: usize) -> &mut CompressedColumn {
        &mut self.columns[index]
    }

    pub fn columns(&self) -> &[CompressedColumn] {
        &self.columns
    }

    /// Index of the first column carrying `label`.
    pub fn column_index(&self, label: i64) -> Option<usize> {
        self.label_index.get(&label).copied()
    }

    pub fn push_back(&mut self, column: CompressedColumn) -> usize {
        let index = self.columns.len();
        self.label_index
            .entry(column.numeric_label())
            .or_insert(index);
        self.columns.push(column);
        index
    }

    pub fn insert(&mut self, position: usize, column: CompressedColumn) {
        self.columns.insert(position.min(self.columns.len()), column);
        self.rebuild_label_index();
    }

    pub fn erase(&mut self, index: usize) -> CompressedColumn {
        let removed = self.columns.remove(index);
        self.rebuild_label_index();
        removed
    }

    /// Rotates column `index` to position zero, shifting the columns before it
    /// one place to the right.
    pub fn move_to_front(&mut self, index: usize) {
        if index == 0 || index >= self.columns.len() {
            return;
        }
        self.columns[..=index].rotate_right(1);
        self.rebuild_label_index();
    }

    pub fn relabel(&mut self, index: usize, label: i64) {
        self.columns[index].set_numeric_label(label);
        self.rebuild_label_index();
    }

    /// Sorts the columns from `start` onwards; earlier columns keep their place.
    pub fn sort_columns_from<F>(&mut self, start: usize, compare: F)
    where
        F: FnMut(&CompressedColumn, &CompressedColumn) -> Ordering,
    {
        if start < self.columns.len() {
            self.columns[start..].sort_by(compare);
            self.rebuild_label_index();
        }
    }

    fn rebuild_label_index(&mut self) {
        self.label_index.clear();
        for (index, column) in self.columns.iter().enumerate() {
            self.label_index
                .entry(column.numeric_label())
                .or_insert(index);
        }
    }

    pub fn reduce<F: Fn(f64) -> f64>(&self, index: usize, f: F) -> f64 {
        self.columns[index].reduce(self.n_rows, f)
    }

    /// Splits rows by whether `group_index` is nonzero and reduces each part.
    /// Element 0 holds the zero group, element 1 the nonzero group.
    pub fn reduce_by_group<F: Fn(f64) -> f64>(
        &self,
        index: usize,
        group_index: usize,
        f: F,
    ) -> [f64; 2] {
        let membership: Vec<usize> = self.columns[group_index]
            .fill(self.n_rows)
            .into_iter()
            .map(|value| usize::from(value != 0.0))
            .collect();
        let reduced = self.reduce_by_partition(index, &membership, 2, f);
        [reduced[0], reduced[1]]
    }

    /// Reduces column `index` separately for each group of a row partition.
    pub fn reduce_by_partition<F: Fn(f64) -> f64>(
        &self,
        index: usize,
        partition: &[usize],
        n_groups: usize,
        f: F,
    ) -> Vec<f64> {
        let mut totals = vec![0.0; n_groups];
        let mut visited = vec![0usize; n_groups];
        self.columns[index].for_each_entry(self.n_rows, |row, value| {
            let group = partition[row];
            totals[group] += f(value);
            visited[group] += 1;
        });

        let zero = f(0.0);
        if zero != 0.0 {
            let mut sizes = vec![0usize; n_groups];
            for &group in partition {
                sizes[group] += 1;
            }
            for group in 0..n_groups {
                totals[group] += (sizes[group] - visited[group]) as f64 * zero;
            }
        }
        totals
    }

    /// All covariate values of one row, in column order.
    pub fn data_row(&self, row: usize) -> Vec<f64> {
        self.columns
            .iter()
            .map(|column| {
                let mut value = 0.0;
                column.for_each_entry(self.n_rows, |r, x| {
                    if r == row {
                        value = x;
                    }
                });
                value
            })
            .collect()
    }
}
