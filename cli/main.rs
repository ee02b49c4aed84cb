#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::process;
use thiserror::Error;

use cyclops::arguments::{ArgumentError, CcdArguments};
use cyclops::ccd::{CcdError, ConvergenceType, CyclicCoordinateDescent, FitSummary};
use cyclops::data::{DataError, FinalizeOptions, ModelData, OffsetSource};
use cyclops::io::{CoefficientEstimate, FitReport, IoError, read_tsv};
use cyclops::mcmc::{McmcDriver, SamplerError};
use cyclops::model::ModelType;
use cyclops::prior::Prior;
use cyclops::search::{
    AutoSearchDriver, BootstrapDriver, BootstrapSelector, CrossValidation,
    CrossValidationSelector, GridSearchDriver, SearchError, SearchOutcome, reset_for_optimal,
};

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Arguments(#[from] ArgumentError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Ccd(#[from] CcdError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
}

#[derive(Args)]
struct FitArgs {
    /// Tab-delimited input with a header row (stratum, y, time, covariates)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// TOML run configuration; flags given on the command line take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where to write the TOML report
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    model: Option<ModelType>,

    /// Free-text name stored in the report
    #[arg(long)]
    model_name: Option<String>,

    /// Prior variance; 0 disables the prior
    #[arg(long, value_name = "VARIANCE")]
    hyperprior: Option<f64>,

    /// Normal prior instead of Laplace
    #[arg(long)]
    normal_prior: bool,

    #[arg(long)]
    tolerance: Option<f64>,

    #[arg(long)]
    max_iterations: Option<usize>,

    #[arg(long, value_enum)]
    convergence: Option<ConvergenceType>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    no_intercept: bool,

    /// Select the prior variance by cross-validation
    #[arg(long)]
    cv: bool,

    #[arg(long, value_name = "K")]
    folds: Option<usize>,

    /// Search a fixed log-spaced grid instead of the adaptive search
    #[arg(long, value_name = "STEPS")]
    grid: Option<usize>,

    #[arg(long, value_name = "N")]
    bootstrap: Option<usize>,

    #[arg(long, value_name = "N")]
    mcmc_samples: Option<usize>,

    /// Request GPU execution (not supported; rejected at validation)
    #[arg(long, value_name = "DEVICE")]
    gpu: Option<i32>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Parser)]
#[command(name = "cyclops", version, about = "Regularized regression by cyclic coordinate descent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model to a tab-delimited file
    Fit(FitArgs),
    /// Print the default run configuration as TOML
    DefaultConfig {
        /// Write to a file instead of standard output
        #[arg(value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit(args)) => {
            init_logging(args.verbose, args.quiet);
            run_fit(args)
        }
        Some(Commands::DefaultConfig { output }) => run_default_config(output),
        None => {
            Cli::command().print_help().unwrap_or_default();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run_default_config(output: Option<PathBuf>) -> Result<(), CliError> {
    let arguments = CcdArguments::default();
    match output {
        Some(path) => {
            arguments.save(&path)?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", arguments.to_toml()?),
    }
    Ok(())
}

fn resolve_arguments(args: &FitArgs) -> Result<CcdArguments, CliError> {
    let mut arguments = match &args.config {
        Some(path) => CcdArguments::load(path)?,
        None => CcdArguments::default(),
    };
    arguments.input_path = args.input.display().to_string();
    if let Some(output) = &args.output {
        arguments.output_path = output.display().to_string();
    }
    if let Some(model) = args.model {
        arguments.model_type = model;
    }
    if let Some(name) = &args.model_name {
        arguments.model_name = name.clone();
    }
    if args.hyperprior.is_some() {
        arguments.hyperprior = args.hyperprior;
    }
    if args.normal_prior {
        arguments.use_normal_prior = true;
    }
    if let Some(tolerance) = args.tolerance {
        arguments.tolerance = tolerance;
    }
    if let Some(max_iterations) = args.max_iterations {
        arguments.max_iterations = max_iterations;
    }
    if let Some(convergence) = args.convergence {
        arguments.convergence = convergence;
    }
    if let Some(seed) = args.seed {
        arguments.seed = seed;
    }
    if args.no_intercept {
        arguments.add_intercept = false;
    }
    if args.cv {
        arguments.cross_validation.enabled = true;
    }
    if let Some(folds) = args.folds {
        arguments.cross_validation.fold = folds;
        arguments.cross_validation.fold_to_compute = folds;
    }
    if let Some(steps) = args.grid {
        arguments.cross_validation.auto_search = false;
        arguments.cross_validation.grid_steps = steps;
    }
    if let Some(replicates) = args.bootstrap {
        arguments.bootstrap.replicates = replicates;
    }
    if let Some(samples) = args.mcmc_samples {
        arguments.mcmc.samples = samples;
    }
    if let Some(device) = args.gpu {
        arguments.use_gpu = true;
        arguments.device_number = device;
    }
    arguments.validate()?;
    Ok(arguments)
}

fn load_data(arguments: &CcdArguments) -> Result<ModelData, CliError> {
    let model_type = arguments.model_type;
    println!("Loading data from: {}", arguments.input_path);
    let mut data = read_tsv(&arguments.input_path, model_type)?;
    let offset = (model_type.expects_offset() && !data.time().is_empty()).then_some(OffsetSource::Time);
    data.finalize(&FinalizeOptions {
        // A stratified likelihood cancels any constant term.
        add_intercept: arguments.add_intercept && !model_type.is_stratified() && model_type != ModelType::Cox,
        offset,
        sort_covariates: true,
        ..Default::default()
    })?;
    println!(
        "Loaded {} rows in {} strata with {} coefficients.",
        data.n_rows(),
        data.n_strata(),
        data.n_coefficients()
    );
    Ok(data)
}

fn run_search(
    arguments: &CcdArguments,
    solver: &mut CyclicCoordinateDescent<'_>,
    initial_variance: f64,
) -> Result<(SearchOutcome, Option<FitSummary>), CliError> {
    let cv = &arguments.cross_validation;
    let selector = CrossValidationSelector::new(cv.fold, solver.data(), arguments.seed, &[])?;
    let mut objective = CrossValidation::new(solver, selector, cv.fold_to_compute);
    let mut outcome = if cv.auto_search {
        println!("Running {}-fold cross-validation with the adaptive search.", cv.fold);
        AutoSearchDriver::new(cv.max_steps).drive(&mut objective, initial_variance)?
    } else {
        println!(
            "Running {}-fold cross-validation over {} grid points.",
            cv.fold, cv.grid_steps
        );
        GridSearchDriver::new(cv.lower_limit, cv.upper_limit, cv.grid_steps).drive(&mut objective)?
    };
    println!(
        "Selected variance {:.6e} (predictive log-likelihood {:.6}).",
        outcome.optimum.variance, outcome.best_value
    );

    let fit = if cv.refit_at_optimal {
        Some(reset_for_optimal(solver, &mut outcome)?)
    } else {
        solver.set_hyperprior(outcome.optimum.variance);
        None
    };
    Ok((outcome, fit))
}

fn run_fit(args: FitArgs) -> Result<(), CliError> {
    let arguments = resolve_arguments(&args)?;
    let data = load_data(&arguments)?;

    let prior_type = arguments.prior_type();
    let variance = arguments
        .hyperprior
        .unwrap_or_else(|| data.normal_based_default_var());
    let prior = Prior::new(prior_type, variance);
    let mut solver = CyclicCoordinateDescent::new(&data, prior, arguments.ccd_settings())?;

    let (search, fit) = if arguments.cross_validation.enabled {
        let (outcome, fit) = run_search(&arguments, &mut solver, variance)?;
        (Some(outcome), fit)
    } else {
        println!("Fitting with {prior_type:?} prior, variance {variance:.6e}.");
        (None, Some(solver.fit()))
    };
    if let Some(summary) = &fit {
        println!(
            "Fit {:?} after {} sweeps; log-likelihood {:.6}.",
            summary.status, summary.iterations, summary.log_likelihood
        );
    }

    let bootstrap = if arguments.bootstrap.replicates > 0 && fit.is_some() {
        println!("Running {} bootstrap replicates.", arguments.bootstrap.replicates);
        let mut selector = BootstrapSelector::new(&data, arguments.seed);
        let driver = BootstrapDriver::new(
            arguments.bootstrap.replicates,
            arguments.bootstrap.report_raw_estimates,
        );
        Some(driver.drive(&mut solver, &mut selector)?)
    } else {
        None
    };

    let mcmc = if arguments.mcmc.samples > 0 && fit.is_some() {
        println!("Sampling {} draws from the posterior.", arguments.mcmc.samples);
        let settings = arguments.mcmc_settings();
        let mut rng = StdRng::seed_from_u64(arguments.seed);
        let result = McmcDriver::new(settings).run(&mut solver, &mut rng)?;
        Some(result.summary(settings.sample_variance))
    } else {
        None
    };

    let coefficients = if fit.is_some() {
        data.coefficient_labels()
            .into_iter()
            .zip(solver.beta())
            .map(|(label, estimate)| CoefficientEstimate {
                label,
                estimate: *estimate,
            })
            .collect()
    } else {
        Vec::new()
    };

    let report = FitReport {
        model_type: arguments.model_type,
        model_name: arguments.model_name.clone(),
        prior: prior_type,
        variance: solver.prior().variance(),
        class_variance: solver.prior().class_variance(),
        log_likelihood: solver.log_likelihood(),
        log_prior: solver.log_prior(),
        fit,
        coefficients,
        search,
        bootstrap,
        mcmc,
    };
    report.save(&arguments.output_path)?;
    println!("Report saved to: {}", arguments.output_path);
    Ok(())
}
