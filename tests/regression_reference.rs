use approx::assert_abs_diff_eq;
use cyclops::ccd::{CcdSettings, ConvergenceType, CyclicCoordinateDescent, FitStatus};
use cyclops::data::{FinalizeOptions, LoadMode, ModelData, OffsetSource};
use cyclops::model::{ModelType, logistic};
use cyclops::prior::{Prior, PriorType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn build_data(
    model: ModelType,
    strata: &[i64],
    y: &[f64],
    time: &[f64],
    columns: &[Vec<f64>],
    options: FinalizeOptions,
) -> ModelData {
    let mut data = ModelData::new(model);
    data.load_y(strata, &[], y, time).expect("load outcome");
    for (index, values) in columns.iter().enumerate() {
        data.load_x(index as i64 + 1, &[], values, LoadMode::Replace, false)
            .expect("load covariate");
    }
    data.finalize(&options).expect("finalize");
    data
}

fn tight() -> CcdSettings {
    CcdSettings {
        tolerance: 1e-10,
        max_iterations: 5000,
        convergence: ConvergenceType::ZhangOles,
    }
}

fn flat() -> Prior {
    Prior::new(PriorType::None, 0.0)
}

// Central-difference gradient of the penalized objective at the fitted point.
fn objective_gradient(solver: &mut CyclicCoordinateDescent<'_>) -> Vec<f64> {
    let beta = solver.beta().to_vec();
    let step = 1e-5;
    let mut gradient = Vec::with_capacity(beta.len());
    for j in 0..beta.len() {
        let mut shifted = beta.clone();
        shifted[j] = beta[j] + step;
        solver.set_beta(&shifted).expect("set beta");
        let up = solver.log_likelihood() + solver.log_prior();
        shifted[j] = beta[j] - step;
        solver.set_beta(&shifted).expect("set beta");
        let down = solver.log_likelihood() + solver.log_prior();
        gradient.push((up - down) / (2.0 * step));
    }
    solver.set_beta(&beta).expect("restore beta");
    gradient
}

// Newton-Raphson on a one-coefficient logistic model without intercept.
fn newton_logistic_slope(x: &[f64], y: &[f64]) -> f64 {
    let mut beta = 0.0;
    for _ in 0..100 {
        let (mut gradient, mut curvature) = (0.0, 0.0);
        for (xi, yi) in x.iter().zip(y) {
            let p = logistic(beta * xi);
            gradient += (yi - p) * xi;
            curvature += p * (1.0 - p) * xi * xi;
        }
        let step = gradient / curvature;
        beta += step;
        if step.abs() < 1e-14 {
            break;
        }
    }
    beta
}

#[test]
fn logistic_slope_matches_newton_reference() {
    let x = vec![1.0, 2.0, 3.0, 4.0];
    let y = [0.0, 0.0, 1.0, 1.0];
    let data = build_data(ModelType::Logistic, &[], &y, &[], &[x.clone()], FinalizeOptions::default());
    let mut solver = CyclicCoordinateDescent::new(&data, flat(), tight()).expect("solver");
    let summary = solver.fit();

    assert_eq!(summary.status, FitStatus::Converged);
    assert_abs_diff_eq!(solver.beta()[0], newton_logistic_slope(&x, &y), epsilon = 1e-6);
}

#[test]
fn log_likelihood_is_a_pure_function_of_the_state() {
    let data = build_data(
        ModelType::Poisson,
        &[],
        &[2.0, 0.0, 1.0, 5.0],
        &[],
        &[vec![0.1, -0.4, 0.3, 1.2]],
        FinalizeOptions {
            add_intercept: true,
            ..Default::default()
        },
    );
    let mut solver = CyclicCoordinateDescent::new(&data, Prior::new(PriorType::Laplace, 1.0), tight())
        .expect("solver");
    solver.fit();
    let first = solver.log_likelihood();
    let second = solver.log_likelihood();
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn strong_laplace_prior_zeroes_every_penalized_coefficient() {
    let mut rng = StdRng::seed_from_u64(21);
    let n = 40;
    let x1: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
    let x2: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
    let y: Vec<f64> = (0..n).map(|i| if i % 4 == 0 { 1.0 } else { 0.0 }).collect();
    let data = build_data(
        ModelType::Logistic,
        &[],
        &y,
        &[],
        &[x1, x2],
        FinalizeOptions {
            add_intercept: true,
            ..Default::default()
        },
    );
    // λ = sqrt(2 / 0.001) exceeds any achievable gradient magnitude here.
    let mut solver =
        CyclicCoordinateDescent::new(&data, Prior::new(PriorType::Laplace, 0.001), tight()).expect("solver");
    solver.fit();

    let intercept = data.intercept_index().expect("intercept");
    for (j, value) in solver.beta().iter().enumerate() {
        if j != intercept {
            assert_eq!(*value, 0.0, "coefficient {j} should be exactly zero");
        }
    }
    let rate: f64 = 0.25;
    assert_abs_diff_eq!(solver.beta()[intercept], (rate / (1.0 - rate)).ln(), epsilon = 1e-6);
}

#[test]
fn normal_prior_shrinks_towards_zero_at_a_stationary_point() {
    let x = vec![-1.0, -0.5, 0.0, 0.5, 1.0, 1.5];
    let y = [0.0, 1.0, 0.0, 1.0, 1.0, 1.0];
    let data = build_data(ModelType::Logistic, &[], &y, &[], &[x], FinalizeOptions::default());

    let mut unpenalized = CyclicCoordinateDescent::new(&data, flat(), tight()).expect("solver");
    unpenalized.fit();
    let mut penalized =
        CyclicCoordinateDescent::new(&data, Prior::new(PriorType::Normal, 0.1), tight()).expect("solver");
    penalized.fit();

    assert!(penalized.beta()[0].abs() < unpenalized.beta()[0].abs());
    assert!(penalized.beta()[0] > 0.0);
    for g in objective_gradient(&mut penalized) {
        assert_abs_diff_eq!(g, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn poisson_and_least_squares_fits_are_stationary() {
    let x1 = vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
    let x2 = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
    let counts = [1.0, 1.0, 2.0, 3.0, 5.0, 6.0, 11.0];
    let with_intercept = || FinalizeOptions {
        add_intercept: true,
        ..Default::default()
    };

    for model in [ModelType::Poisson, ModelType::LeastSquares] {
        let data = build_data(model, &[], &counts, &[], &[x1.clone(), x2.clone()], with_intercept());
        let mut solver = CyclicCoordinateDescent::new(&data, flat(), tight()).expect("solver");
        let summary = solver.fit();
        assert_eq!(summary.status, FitStatus::Converged, "{model}");
        for g in objective_gradient(&mut solver) {
            assert_abs_diff_eq!(g, 0.0, epsilon = 1e-4);
        }
    }
}

#[test]
fn conditional_logistic_fit_is_stationary() {
    let strata = [1, 1, 1, 2, 2, 3, 3, 3, 4, 4];
    let y = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
    let x = vec![0.9, 0.2, -0.4, 1.1, 0.3, -0.2, 0.4, 0.8, 1.5, 0.1];
    let data = build_data(ModelType::ConditionalLogistic, &strata, &y, &[], &[x], FinalizeOptions::default());
    let mut solver = CyclicCoordinateDescent::new(&data, flat(), tight()).expect("solver");
    let summary = solver.fit();
    assert_eq!(summary.status, FitStatus::Converged);
    assert!(solver.beta()[0].is_finite());
    for g in objective_gradient(&mut solver) {
        assert_abs_diff_eq!(g, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn self_controlled_case_series_uses_time_offset() {
    let strata = [1, 1, 2, 2, 3, 3];
    let y = [1.0, 0.0, 2.0, 1.0, 0.0, 1.0];
    let exposure = [10.0, 20.0, 5.0, 5.0, 12.0, 3.0];
    let x = vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    let data = build_data(
        ModelType::SelfControlledCaseSeries,
        &strata,
        &y,
        &exposure,
        &[x],
        FinalizeOptions {
            offset: Some(OffsetSource::Time),
            ..Default::default()
        },
    );
    assert!(data.has_offset());
    assert_eq!(data.n_coefficients(), 1);
    let mut solver = CyclicCoordinateDescent::new(&data, flat(), tight()).expect("solver");
    solver.fit();
    for g in objective_gradient(&mut solver) {
        assert_abs_diff_eq!(g, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn cox_fit_with_ties_is_stationary() {
    let time = [5.0, 3.0, 3.0, 8.0, 1.0, 6.0, 4.0, 2.0];
    let status = [1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0];
    let x = vec![0.2, 1.0, -0.5, -1.0, 1.4, 0.0, 0.6, -0.3];
    let data = build_data(ModelType::Cox, &[], &status, &time, &[x], FinalizeOptions::default());
    let mut solver = CyclicCoordinateDescent::new(&data, Prior::new(PriorType::Normal, 4.0), tight())
        .expect("solver");
    let summary = solver.fit();
    assert_eq!(summary.status, FitStatus::Converged);
    for g in objective_gradient(&mut solver) {
        assert_abs_diff_eq!(g, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn overflowing_derivatives_skip_the_coordinate() {
    let data = build_data(
        ModelType::Poisson,
        &[],
        &[0.0, 1.0, 2.0],
        &[],
        &[vec![1e300, 0.0, 0.0], vec![0.1, 0.2, 0.3]],
        FinalizeOptions::default(),
    );
    let mut solver = CyclicCoordinateDescent::new(&data, flat(), tight()).expect("solver");
    let summary = solver.fit();
    assert!(summary.failed_steps > 0);
    assert_eq!(solver.beta()[0], 0.0);
    assert!(solver.beta()[1].is_finite());
}
