//! Derivative-free maximization of a unimodal function of one positive
//! variable, carried out in log space.
//!
//! The search keeps every tried point sorted by position. While the best point
//! sits on an edge it expands outwards with a doubling step; once the best
//! point has a neighbour on each side it refines by the vertex of the parabola
//! through the three points, falling back to bisection when the vertex is
//! unusable.

use std::fmt;

/// Initial expansion step, `ln 10`.
pub const DEFAULT_STEP: f64 = std::f64::consts::LN_10;
/// Bracket width at which the search stops, `ln 1.5`.
pub const DEFAULT_TOLERANCE: f64 = 0.405_465_108_108_164_4;
/// Neighbours closer than `noise` standard errors to the best estimate are
/// indistinguishable from it.
pub const DEFAULT_NOISE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchStep {
    /// Evaluate at this point next.
    Continue(f64),
    /// The maximizer, to within the tolerance.
    Converged(f64),
}

impl SearchStep {
    pub fn value(self) -> f64 {
        match self {
            SearchStep::Continue(x) | SearchStep::Converged(x) => x,
        }
    }

    pub fn is_converged(self) -> bool {
        matches!(self, SearchStep::Converged(_))
    }
}

impl fmt::Display for SearchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStep::Continue(x) => write!(f, "continue at {x:.6e}"),
            SearchStep::Converged(x) => write!(f, "converged at {x:.6e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Observation {
    log_x: f64,
    value: f64,
    std_error: f64,
}

#[derive(Debug, Clone)]
pub struct UniModalSearch {
    observations: Vec<Observation>,
    step: f64,
    tolerance: f64,
    noise: f64,
}

impl Default for UniModalSearch {
    fn default() -> Self {
        Self::new(DEFAULT_STEP, DEFAULT_TOLERANCE, DEFAULT_NOISE)
    }
}

impl UniModalSearch {
    /// `step` and `tolerance` are in log units.
    pub fn new(step: f64, tolerance: f64, noise: f64) -> Self {
        Self {
            observations: Vec::new(),
            step,
            tolerance,
            noise,
        }
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    /// Records the estimate at `x > 0`. A point already tried is overwritten.
    pub fn tried(&mut self, x: f64, value: f64, std_error: f64) {
        let observation = Observation {
            log_x: x.ln(),
            value,
            std_error,
        };
        match self
            .observations
            .binary_search_by(|probe| probe.log_x.total_cmp(&observation.log_x))
        {
            Ok(index) => self.observations[index] = observation,
            Err(index) => self.observations.insert(index, observation),
        }
    }

    fn best_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, observation) in self.observations.iter().enumerate() {
            match best {
                Some(current) if self.observations[current].value >= observation.value => {}
                _ => best = Some(index),
            }
        }
        best
    }

    /// The best point tried so far and its estimate.
    pub fn best(&self) -> Option<(f64, f64)> {
        self.best_index().map(|index| {
            let observation = &self.observations[index];
            (observation.log_x.exp(), observation.value)
        })
    }

    /// Proposes the next point, or reports convergence.
    pub fn step(&mut self) -> SearchStep {
        let n = self.observations.len();
        let Some(best) = self.best_index() else {
            return SearchStep::Continue(1.0);
        };
        if n == 1 {
            return SearchStep::Continue((self.observations[0].log_x + self.step).exp());
        }
        if best == 0 {
            let next = self.observations[0].log_x - self.step;
            self.step *= 2.0;
            return SearchStep::Continue(next.exp());
        }
        if best == n - 1 {
            let next = self.observations[n - 1].log_x + self.step;
            self.step *= 2.0;
            return SearchStep::Continue(next.exp());
        }

        let left = self.observations[best - 1];
        let middle = self.observations[best];
        let right = self.observations[best + 1];
        let (l, m, r) = (left.log_x, middle.log_x, right.log_x);

        if r - l < self.tolerance {
            return SearchStep::Converged(m.exp());
        }
        if self.noise > 0.0 && middle.std_error > 0.0 {
            let band = self.noise * middle.std_error;
            if (middle.value - left.value).abs() < band && (middle.value - right.value).abs() < band {
                return SearchStep::Converged(m.exp());
            }
        }

        let (fl, fm, fr) = (left.value, middle.value, right.value);
        let denominator = (m - l) * (fm - fr) - (m - r) * (fm - fl);
        let numerator = (m - l).powi(2) * (fm - fr) - (m - r).powi(2) * (fm - fl);
        let vertex = m - 0.5 * numerator / denominator;

        let margin = self.tolerance / 4.0;
        let usable = vertex.is_finite()
            && vertex > l
            && vertex < r
            && (vertex - l).abs() > margin
            && (vertex - m).abs() > margin
            && (vertex - r).abs() > margin;
        let next = if usable {
            vertex
        } else if m - l > r - m {
            0.5 * (l + m)
        } else {
            0.5 * (m + r)
        };
        SearchStep::Continue(next.exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quadratic(peak: f64) -> impl Fn(f64) -> f64 {
        move |x: f64| -(x.ln() - peak).powi(2)
    }

    fn run(search: &mut UniModalSearch, f: impl Fn(f64) -> f64, start: f64, cap: usize) -> Option<f64> {
        let mut x = start;
        for _ in 0..cap {
            search.tried(x, f(x), 0.0);
            match search.step() {
                SearchStep::Converged(value) => return Some(value),
                SearchStep::Continue(value) => x = value,
            }
        }
        None
    }

    #[test]
    fn test_first_step_without_observations() {
        let mut search = UniModalSearch::default();
        assert_eq!(search.step(), SearchStep::Continue(1.0));
    }

    #[test]
    fn test_edge_best_expands_with_doubling_step() {
        let mut search = UniModalSearch::new(1.0, 0.1, 0.0);
        search.tried(1.0, 0.0, 0.0);
        assert_abs_diff_eq!(search.step().value().ln(), 1.0, epsilon = 1e-12);
        search.tried(1.0f64.exp(), 1.0, 0.0);
        // Best on the right edge: move right by the step, then double it.
        assert_abs_diff_eq!(search.step().value().ln(), 2.0, epsilon = 1e-12);
        search.tried(2.0f64.exp(), 2.0, 0.0);
        assert_abs_diff_eq!(search.step().value().ln(), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_parabola_vertex_is_exact_for_quadratics() {
        let mut search = UniModalSearch::new(1.0, 0.01, 0.0);
        let f = quadratic(0.3);
        for log_x in [-1.0, 0.0, 1.0] {
            let x = f64::exp(log_x);
            search.tried(x, f(x), 0.0);
        }
        assert_abs_diff_eq!(search.step().value().ln(), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_converges_to_quadratic_peak() {
        for peak in [-4.0, -0.7, 0.0, 2.5, 6.0] {
            let mut search = UniModalSearch::default();
            let found = run(&mut search, quadratic(peak), 1.0, 100).unwrap();
            assert!((found.ln() - peak).abs() < DEFAULT_TOLERANCE, "peak {peak}, found {}", found.ln());
        }
    }

    #[test]
    fn test_noise_band_stops_on_flat_neighbourhood() {
        let mut search = UniModalSearch::new(1.0, 1e-6, 1.0);
        search.tried(1.0f64.exp().recip(), 0.0, 0.0);
        search.tried(1.0, 0.05, 0.1);
        search.tried(1.0f64.exp(), 0.01, 0.0);
        assert_eq!(search.step(), SearchStep::Converged(1.0));
    }

    #[test]
    fn test_retried_point_replaces_previous_estimate() {
        let mut search = UniModalSearch::default();
        search.tried(2.0, 1.0, 0.0);
        search.tried(2.0, -1.0, 0.0);
        search.tried(4.0, 0.0, 0.0);
        assert_eq!(search.n_observations(), 2);
        let (x, value) = search.best().unwrap();
        assert_abs_diff_eq!(x, 4.0, epsilon = 1e-12);
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_ties_resolve_to_first_point() {
        let mut search = UniModalSearch::default();
        search.tried(1.0, 0.5, 0.0);
        search.tried(10.0, 0.5, 0.0);
        let (x, _) = search.best().unwrap();
        assert_abs_diff_eq!(x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_display() {
        assert_eq!(SearchStep::Converged(2.0).to_string(), "converged at 2.000000e0");
    }
}
