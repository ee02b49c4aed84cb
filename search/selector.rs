//! Row weights for resampling.
//!
//! Stratified models resample whole strata, so a conditional likelihood never
//! sees a stratum split between training and held-out rows. Other models
//! resample rows.

use super::SearchError;
use crate::data::ModelData;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

// Rows grouped into the units that are resampled together.
fn sampling_units(data: &ModelData) -> Vec<Vec<usize>> {
    if data.model_type().is_stratified() {
        let mut units = vec![Vec::new(); data.n_strata()];
        for (row, stratum) in data.strata().iter().enumerate() {
            units[*stratum].push(row);
        }
        units
    } else {
        (0..data.n_rows()).map(|row| vec![row]).collect()
    }
}

/// K-fold assignment from a seeded permutation of the sampling units.
#[derive(Debug, Clone)]
pub struct CrossValidationSelector {
    fold_of: Vec<usize>,
    excluded: Vec<bool>,
    n_folds: usize,
}

impl CrossValidationSelector {
    /// `exclude` lists rows that never enter a training fold.
    pub fn new(
        n_folds: usize,
        data: &ModelData,
        seed: u64,
        exclude: &[usize],
    ) -> Result<Self, SearchError> {
        let units = sampling_units(data);
        if n_folds < 2 || n_folds > units.len() {
            return Err(SearchError::InvalidFolds {
                folds: n_folds,
                units: units.len(),
            });
        }
        let mut excluded = vec![false; data.n_rows()];
        for &row in exclude {
            *excluded
                .get_mut(row)
                .ok_or(SearchError::ExclusionOutOfRange(row))? = true;
        }

        let mut order: Vec<usize> = (0..units.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let mut fold_of = vec![0; data.n_rows()];
        for (position, unit) in order.into_iter().enumerate() {
            for &row in &units[unit] {
                fold_of[row] = position % n_folds;
            }
        }
        log::debug!(
            "Assigned {} sampling units to {} folds (seed {}).",
            units.len(),
            n_folds,
            seed
        );
        Ok(Self {
            fold_of,
            excluded,
            n_folds,
        })
    }

    pub fn n_folds(&self) -> usize {
        self.n_folds
    }

    pub fn fold_of(&self, row: usize) -> usize {
        self.fold_of[row]
    }

    /// One for rows used to fit when `fold` is held out.
    pub fn training_weights(&self, fold: usize) -> Result<Vec<f64>, SearchError> {
        if fold >= self.n_folds {
            return Err(SearchError::FoldOutOfRange(fold));
        }
        Ok(self
            .fold_of
            .iter()
            .zip(&self.excluded)
            .map(|(f, excluded)| if *f != fold && !excluded { 1.0 } else { 0.0 })
            .collect())
    }

    /// One for rows of `fold` that are scored; excluded rows never are.
    pub fn held_out_weights(&self, fold: usize) -> Result<Vec<f64>, SearchError> {
        if fold >= self.n_folds {
            return Err(SearchError::FoldOutOfRange(fold));
        }
        Ok(self
            .fold_of
            .iter()
            .zip(&self.excluded)
            .map(|(f, excluded)| if *f == fold && !excluded { 1.0 } else { 0.0 })
            .collect())
    }
}

/// Sampling units drawn with replacement; a row's weight is the number of
/// times its unit was drawn.
#[derive(Debug, Clone)]
pub struct BootstrapSelector {
    units: Vec<Vec<usize>>,
    n_rows: usize,
    rng: StdRng,
}

impl BootstrapSelector {
    pub fn new(data: &ModelData, seed: u64) -> Self {
        Self {
            units: sampling_units(data),
            n_rows: data.n_rows(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_weights(&mut self) -> Vec<f64> {
        let mut weights = vec![0.0; self.n_rows];
        for _ in 0..self.units.len() {
            if let Some(unit) = self.units.choose(&mut self.rng) {
                for &row in unit {
                    weights[row] += 1.0;
                }
            }
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FinalizeOptions, LoadMode};
    use crate::model::ModelType;

    fn data(model: ModelType, strata: &[i64]) -> ModelData {
        let n = strata.len().max(10);
        let mut data = ModelData::new(model);
        let y: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
        data.load_y(strata, &[], &y, &[]).unwrap();
        data.load_x(1, &[], &vec![1.0; n], LoadMode::Replace, false).unwrap();
        data.finalize(&FinalizeOptions::default()).unwrap();
        data
    }

    #[test]
    fn test_folds_partition_rows() {
        let data = data(ModelType::Logistic, &[]);
        let selector = CrossValidationSelector::new(3, &data, 42, &[]).unwrap();
        let mut seen = vec![0.0; data.n_rows()];
        for fold in 0..3 {
            let training = selector.training_weights(fold).unwrap();
            let held_out = selector.held_out_weights(fold).unwrap();
            for row in 0..data.n_rows() {
                assert_eq!(training[row] + held_out[row], 1.0);
                seen[row] += held_out[row];
            }
        }
        assert!(seen.iter().all(|count| *count == 1.0));
    }

    #[test]
    fn test_same_seed_same_folds() {
        let data = data(ModelType::Poisson, &[]);
        let a = CrossValidationSelector::new(5, &data, 7, &[]).unwrap();
        let b = CrossValidationSelector::new(5, &data, 7, &[]).unwrap();
        assert_eq!(a.training_weights(2).unwrap(), b.training_weights(2).unwrap());
    }

    #[test]
    fn test_strata_stay_together() {
        let strata = [1, 1, 2, 2, 2, 3, 3, 4, 4, 4];
        let data = data(ModelType::ConditionalLogistic, &strata);
        let selector = CrossValidationSelector::new(2, &data, 3, &[]).unwrap();
        for row in 1..strata.len() {
            if strata[row] == strata[row - 1] {
                assert_eq!(selector.fold_of(row), selector.fold_of(row - 1));
            }
        }
    }

    #[test]
    fn test_excluded_rows_never_train() {
        let data = data(ModelType::Logistic, &[]);
        let selector = CrossValidationSelector::new(2, &data, 1, &[4]).unwrap();
        for fold in 0..2 {
            assert_eq!(selector.training_weights(fold).unwrap()[4], 0.0);
        }
        assert!(matches!(
            CrossValidationSelector::new(2, &data, 1, &[99]),
            Err(SearchError::ExclusionOutOfRange(99))
        ));
    }

    #[test]
    fn test_excluded_rows_are_never_scored() {
        let data = data(ModelType::Logistic, &[]);
        let selector = CrossValidationSelector::new(3, &data, 1, &[0]).unwrap();
        let mut scored = vec![0.0; data.n_rows()];
        for fold in 0..3 {
            let training = selector.training_weights(fold).unwrap();
            let held_out = selector.held_out_weights(fold).unwrap();
            assert_eq!(training[0], 0.0);
            assert_eq!(held_out[0], 0.0);
            for row in 1..data.n_rows() {
                assert_eq!(training[row] + held_out[row], 1.0);
                scored[row] += held_out[row];
            }
        }
        assert_eq!(scored[0], 0.0);
        assert!(scored[1..].iter().all(|count| *count == 1.0));
        assert_eq!(selector.held_out_weights(3), Err(SearchError::FoldOutOfRange(3)));
    }

    #[test]
    fn test_invalid_fold_counts() {
        let data = data(ModelType::Logistic, &[]);
        assert!(CrossValidationSelector::new(1, &data, 1, &[]).is_err());
        assert!(CrossValidationSelector::new(11, &data, 1, &[]).is_err());
        let selector = CrossValidationSelector::new(2, &data, 1, &[]).unwrap();
        assert_eq!(selector.training_weights(2), Err(SearchError::FoldOutOfRange(2)));
    }

    #[test]
    fn test_bootstrap_weights_sum_to_unit_count() {
        let data = data(ModelType::Logistic, &[]);
        let mut selector = BootstrapSelector::new(&data, 11);
        let weights = selector.next_weights();
        assert_eq!(weights.iter().sum::<f64>(), data.n_rows() as f64);
        assert!(weights.iter().all(|w| w.fract() == 0.0));
    }
}
