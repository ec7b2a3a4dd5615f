//! # Doubly-Robust Marginal Hazard Ratio Estimation
//!
//! Entry point of the engine. One call runs the whole pipeline:
//!
//! 1.  **Time grid:** follow-up is clipped at the horizon, ties are broken and
//!     the canonical grid of distinct times is built.
//! 2.  **Cross-fitting:** nuisance learners are fitted out-of-fold (or on the
//!     full sample) and their predictions assembled over the grid.
//! 3.  **Clipping:** unknown cells are carried forward and every survival and
//!     propensity prediction is bounded away from 0 (and 1).
//! 4.  **Counting processes:** the augmented pseudo at-risk and jump matrices
//!     are built once; they do not depend on β.
//! 5.  **Root finding:** Newton–Raphson on the estimating equation U(β).
//! 6.  **Inference and curves:** sandwich standard error, Breslow-type baseline
//!     cumulative hazard with counterfactual survival curves, and the
//!     time-varying β(t) diagnostic.

use crate::baseline::BaselineHazard;
use crate::clipping::{ClippingBounds, clip_predictions};
use crate::config::{Augmentation, EstimatorConfig};
use crate::counting::CountingProcess;
use crate::crossfit::{CrossFitPlan, cross_fit};
use crate::diagnostic::{TimeVaryingBeta, time_varying_beta};
use crate::folds::FoldAssignment;
use crate::grid::build_time_grid;
use crate::nuisance::{NuisanceError, Nuisances};
use crate::sample::{Sample, SampleError};
use crate::solver::{EstimatingEquation, NewtonOptions, solve};
use crate::variance::sandwich_standard_error;
use ndarray::Array1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Fold {fold} has no {kind} events in its training rows; the {kind} model cannot be fitted."
    )]
    DegenerateFold { fold: usize, kind: &'static str },

    #[error(
        "Newton-Raphson did not converge after {iterations} iterations (last beta {beta:.6e}): {reason}"
    )]
    NonConvergence {
        iterations: usize,
        beta: f64,
        reason: String,
    },

    #[error(
        "Sandwich variance is not finite (K = {meat:.3e}, U' = {derivative:.3e}); the standard error is undefined"
    )]
    NonFiniteVariance { meat: f64, derivative: f64 },

    #[error("Nuisance model failed: {0}")]
    Nuisance(#[from] NuisanceError),

    #[error("Invalid sample: {0}")]
    Sample(#[from] SampleError),

    #[error("Internal error: matrix dimensions disagree across components.")]
    DimensionMismatch,
}

/// Output of one estimation run.
#[derive(Debug, Clone)]
pub struct HazardRatioFit {
    /// Estimated marginal log hazard ratio of group 1 versus group 0.
    pub beta: f64,
    pub model_se: f64,
    pub time_grid: Array1<f64>,
    pub baseline_cum_hazard: Array1<f64>,
    pub survival_group0: Array1<f64>,
    pub survival_group1: Array1<f64>,
    pub beta_t: TimeVaryingBeta,
    pub iterations: usize,
    pub augmentation: Augmentation,
}

impl HazardRatioFit {
    #[inline]
    pub fn hazard_ratio(&self) -> f64 {
        self.beta.exp()
    }

    /// Wald interval `beta ± z * se` on the log scale.
    pub fn confidence_interval(&self, z: f64) -> (f64, f64) {
        (self.beta - z * self.model_se, self.beta + z * self.model_se)
    }
}

/// Estimates the marginal log hazard ratio with the built-in nuisance
/// strategies named in `config`.
pub fn estimate_hazard_ratio(
    sample: &Sample,
    config: &EstimatorConfig,
) -> Result<HazardRatioFit, EstimationError> {
    let nuisances = Nuisances::from_kinds(
        config.event_model,
        config.censoring_model,
        config.propensity_model,
    );
    estimate_hazard_ratio_with(sample, config, &nuisances)
}

/// Estimates the marginal log hazard ratio with caller-supplied learners.
pub fn estimate_hazard_ratio_with(
    sample: &Sample,
    config: &EstimatorConfig,
    nuisances: &Nuisances,
) -> Result<HazardRatioFit, EstimationError> {
    let n = sample.len();
    config.validate(n)?;
    log::info!(
        "Estimating marginal hazard ratio: n = {n}, augmentation = {}, cross-fit = {}, k = {}",
        config.augmentation,
        config.cross_fit,
        config.folds
    );

    let (grid, outcomes) = build_time_grid(sample.time(), sample.event(), config.tau)?;
    log::info!("Time grid has {} distinct times up to tau = {}", grid.len(), grid.tau());
    let adjusted = sample.with_outcomes(outcomes.time.clone(), outcomes.event.clone());

    let folds = if config.cross_fit {
        FoldAssignment::contiguous(n, config.folds)?
    } else {
        log::info!(
            "Cross-fitting disabled: nuisance models are fitted and evaluated on the full sample"
        );
        FoldAssignment::single(n)
    };

    let plan = CrossFitPlan {
        cross_fit: config.cross_fit,
        fit_censoring: config.augmentation.uses_censoring_model(),
    };
    let raw = cross_fit(&adjusted, &grid, &folds, nuisances, plan)?;
    let predictions = clip_predictions(
        raw,
        ClippingBounds {
            min_survival: config.min_survival,
            min_propensity: config.min_propensity,
        },
        config.augmentation,
    );

    let process = CountingProcess::build(
        &adjusted,
        &outcomes.rank,
        &grid,
        &predictions,
        config.augmentation,
    )?;
    let equation = EstimatingEquation::new(&process, &folds, adjusted.weight())?;
    let state = solve(
        &equation,
        config.beta0,
        NewtonOptions {
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
        },
    )?;
    log::info!(
        "Solved beta = {:.6} in {} iterations (U = {:.3e})",
        state.beta,
        state.iterations,
        state.score
    );

    let model_se = sandwich_standard_error(&equation, state.beta, state.derivative)?;
    let baseline = BaselineHazard::estimate(&equation, state.beta);
    let beta_t = time_varying_beta(&equation, state.beta, grid.times());
    log::info!(
        "Hazard ratio = {:.4} (log HR {:.4}, SE {:.4})",
        state.beta.exp(),
        state.beta,
        model_se
    );

    Ok(HazardRatioFit {
        beta: state.beta,
        model_se,
        time_grid: grid.times().to_owned(),
        baseline_cum_hazard: baseline.cumulative_hazard,
        survival_group0: baseline.survival_group0,
        survival_group1: baseline.survival_group1,
        beta_t,
        iterations: state.iterations,
        augmentation: config.augmentation,
    })
}
