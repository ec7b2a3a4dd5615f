#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process;

use drcox::data::{load_sample, write_curves, write_time_varying_beta};
use drcox::nuisance::{PropensityModelKind, SurvivalModelKind};
use drcox::{Augmentation, EstimatorConfig, HazardRatioFit, estimate_hazard_ratio};

/// Two-sided 95% normal quantile.
const Z_95: f64 = 1.959_963_984_540_054;

#[derive(Args)]
pub struct EstimateArgs {
    /// Tab-separated file with time, event, group, optional weight and covariate columns
    #[arg(value_name = "DATA_TSV")]
    pub data: PathBuf,

    /// TOML file with estimator options; command-line flags override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Study horizon; later follow-up is censored at tau
    #[arg(long)]
    pub tau: Option<f64>,

    /// Number of cross-fitting folds
    #[arg(long, value_name = "K")]
    pub folds: Option<usize>,

    /// Augmentation mode: AIPTCW, AIPTW or AIPCW
    #[arg(long)]
    pub augmentation: Option<Augmentation>,

    /// Event-time nuisance model (cox, km)
    #[arg(long)]
    pub event_model: Option<SurvivalModelKind>,

    /// Censoring-time nuisance model (cox, km)
    #[arg(long)]
    pub censoring_model: Option<SurvivalModelKind>,

    /// Propensity nuisance model (logit, marginal)
    #[arg(long)]
    pub propensity_model: Option<PropensityModelKind>,

    /// Fit and evaluate nuisance models on the full sample
    #[arg(long)]
    pub no_cross_fit: bool,

    /// Directory for summary.toml, curves.tsv and beta_t.tsv
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "drcox",
    about = "Doubly-robust marginal hazard ratio estimation",
    long_about = "Estimates the marginal Cox log hazard ratio between two groups with \
                  cross-fitted nuisance models and augmented inverse-probability weighting."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the marginal hazard ratio from a TSV file
    #[command(about = "Estimate the marginal hazard ratio (outputs: summary.toml, curves.tsv, beta_t.tsv)")]
    Estimate(EstimateArgs),

    /// Write the default estimator configuration as TOML
    #[command(about = "Write the default configuration (outputs: config.toml)")]
    Config {
        #[arg(long, default_value = "config.toml")]
        out: PathBuf,
    },

    /// Display version information
    Version,
}

/// Serialised run summary.
#[derive(Serialize)]
struct FitSummary {
    n: usize,
    covariates: Vec<String>,
    beta: f64,
    model_se: f64,
    hazard_ratio: f64,
    ci_lower: f64,
    ci_upper: f64,
    iterations: usize,
    augmentation: Augmentation,
    config: EstimatorConfig,
}

impl FitSummary {
    fn new(n: usize, covariates: Vec<String>, fit: &HazardRatioFit, config: EstimatorConfig) -> Self {
        let (ci_lower, ci_upper) = fit.confidence_interval(Z_95);
        Self {
            n,
            covariates,
            beta: fit.beta,
            model_se: fit.model_se,
            hazard_ratio: fit.hazard_ratio(),
            ci_lower,
            ci_upper,
            iterations: fit.iterations,
            augmentation: fit.augmentation,
            config,
        }
    }
}

fn resolve_config(args: &EstimateArgs) -> Result<EstimatorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EstimatorConfig::load(path)?,
        None => EstimatorConfig::default(),
    };
    if let Some(tau) = args.tau {
        config.tau = Some(tau);
    }
    if let Some(folds) = args.folds {
        config.folds = folds;
    }
    if let Some(augmentation) = args.augmentation {
        config.augmentation = augmentation;
    }
    if let Some(kind) = args.event_model {
        config.event_model = kind;
    }
    if let Some(kind) = args.censoring_model {
        config.censoring_model = kind;
    }
    if let Some(kind) = args.propensity_model {
        config.propensity_model = kind;
    }
    if args.no_cross_fit {
        config.cross_fit = false;
    }
    Ok(config)
}

fn run_estimate(args: EstimateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;
    let (sample, covariates) = load_sample(&args.data)?;
    let fit = estimate_hazard_ratio(&sample, &config)?;

    fs::create_dir_all(&args.out_dir)?;
    let summary = FitSummary::new(sample.len(), covariates, &fit, config);
    let summary_path = args.out_dir.join("summary.toml");
    fs::write(&summary_path, toml::to_string_pretty(&summary)?)?;
    write_curves(args.out_dir.join("curves.tsv"), &fit)?;
    write_time_varying_beta(args.out_dir.join("beta_t.tsv"), &fit.beta_t)?;

    println!(
        "log HR = {:.6} (SE {:.6}), HR = {:.4} [{:.4}, {:.4}]",
        summary.beta,
        summary.model_se,
        summary.hazard_ratio,
        summary.ci_lower.exp(),
        summary.ci_upper.exp()
    );
    println!("Results written to {}", args.out_dir.display());
    Ok(())
}

fn run_config(out: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    EstimatorConfig::default().save(&out)?;
    println!("Default configuration written to {}", out.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Estimate(args)) => run_estimate(args),
        Some(Commands::Config { out }) => run_config(out),
        Some(Commands::Version) => {
            println!("drcox {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
