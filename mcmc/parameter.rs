use super::SamplerError;

/// A sampled vector with a stored copy of the current chain state.
///
/// Proposals are written into `values`; `store` commits them and `restore`
/// rolls them back.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    values: Vec<f64>,
    stored: Vec<f64>,
    changed: bool,
}

impl Parameter {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            stored: values.clone(),
            values,
            changed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn stored(&self) -> &[f64] {
        &self.stored
    }

    pub fn set_values(&mut self, values: &[f64]) -> Result<(), SamplerError> {
        if values.len() != self.values.len() {
            return Err(SamplerError::DimensionMismatch {
                what: "parameter values",
                expected: self.values.len(),
                found: values.len(),
            });
        }
        self.values.copy_from_slice(values);
        Ok(())
    }

    pub fn store(&mut self) {
        self.stored.copy_from_slice(&self.values);
    }

    pub fn restore(&mut self) {
        self.values.copy_from_slice(&self.stored);
    }

    /// Whether the last decision accepted a proposal.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }
}
