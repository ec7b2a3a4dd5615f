//! Ridge-stabilised Cox proportional-hazards learner with a Breslow baseline.
//!
//! The linear predictor is `A * b_0 + Z * b_{1..}`. Counterfactual curves are
//! produced by evaluating the fitted model with `A` forced to 0 and to 1.

use super::{
    CounterfactualCurves, NuisanceError, SurvivalLearner, SurvivalModel, design_with_group,
};
use crate::grid::TimeGrid;
use crate::sample::Sample;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Solve;

const MAX_STEP_HALVINGS: usize = 30;
const ETA_CLAMP: f64 = 700.0;

#[derive(Debug, Clone)]
pub struct CoxLearner {
    /// Penalty on the mean-scaled log partial likelihood, `ridge / 2 * |b|^2`.
    pub ridge: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for CoxLearner {
    fn default() -> Self {
        Self {
            ridge: 1e-4,
            max_iterations: 100,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone)]
struct PartialLikelihood {
    value: f64,
    gradient: Array1<f64>,
    information: Array2<f64>,
}

/// Rows ordered by decreasing follow-up so risk sets accumulate in one pass.
fn descending_order(time: ArrayView1<'_, f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..time.len()).collect();
    order.sort_by(|&a, &b| time[b].total_cmp(&time[a]));
    order
}

fn add_outer_scaled(matrix: &mut Array2<f64>, row: ArrayView1<'_, f64>, scale: f64) {
    let p = row.len();
    for i in 0..p {
        let row_i = row[i];
        for j in 0..p {
            matrix[[i, j]] += scale * row_i * row[j];
        }
    }
}

/// Breslow log partial likelihood with its gradient and observed information.
/// All three are scaled by the total weight.
fn partial_likelihood(
    design: &Array2<f64>,
    training: &Sample,
    order: &[usize],
    beta: &Array1<f64>,
) -> PartialLikelihood {
    let n = design.nrows();
    let p = design.ncols();
    let time = training.time();
    let event = training.event();
    let weight = training.weight();

    let eta = design.dot(beta).mapv(|v| v.clamp(-ETA_CLAMP, ETA_CLAMP));
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));
    let mut value = 0.0;
    let mut gradient = Array1::<f64>::zeros(p);
    let mut information = Array2::<f64>::zeros((p, p));

    let mut start = 0usize;
    while start < n {
        let t = time[order[start]];
        let mut end = start;
        while end < n && time[order[end]] == t {
            let i = order[end];
            let risk = weight[i] * (eta[i] - shift).exp();
            let x = design.row(i);
            s0 += risk;
            s1.scaled_add(risk, &x);
            add_outer_scaled(&mut s2, x, risk);
            end += 1;
        }
        let mean = &s1 / s0;
        for &i in &order[start..end] {
            if event[i] == 0 {
                continue;
            }
            let w = weight[i];
            value += w * (eta[i] - shift - s0.ln());
            gradient.scaled_add(w, &(&design.row(i) - &mean));
            information.scaled_add(w / s0, &s2);
            add_outer_scaled(&mut information, mean.view(), -w);
        }
        start = end;
    }

    let total = training.total_weight();
    PartialLikelihood {
        value: value / total,
        gradient: gradient / total,
        information: information / total,
    }
}

fn penalize(mut state: PartialLikelihood, beta: &Array1<f64>, ridge: f64) -> PartialLikelihood {
    state.value -= 0.5 * ridge * beta.dot(beta);
    state.gradient.scaled_add(-ridge, beta);
    for j in 0..beta.len() {
        state.information[[j, j]] += ridge;
    }
    state
}

impl SurvivalLearner for CoxLearner {
    fn name(&self) -> &str {
        "Cox"
    }

    fn fit(&self, training: &Sample) -> Result<Box<dyn SurvivalModel>, NuisanceError> {
        if training.num_events() == 0 {
            return Err(NuisanceError::FitFailed {
                model: "Cox",
                reason: "training rows contain no events".to_string(),
            });
        }
        let design = design_with_group(training, None);
        let order = descending_order(training.time());
        let p = design.ncols();

        let mut beta = Array1::<f64>::zeros(p);
        let mut state = penalize(
            partial_likelihood(&design, training, &order, &beta),
            &beta,
            self.ridge,
        );
        let mut converged = false;
        let mut stalled = false;
        for iteration in 0..self.max_iterations {
            let direction = state
                .information
                .solve(&state.gradient)
                .map_err(|source| NuisanceError::LinearSolve {
                    model: "Cox",
                    source,
                })?;

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = &beta + &(&direction * step);
                let trial = penalize(
                    partial_likelihood(&design, training, &order, &candidate),
                    &candidate,
                    self.ridge,
                );
                if trial.value.is_finite() && trial.value >= state.value - 1e-14 {
                    accepted = Some((candidate, trial));
                    break;
                }
                step *= 0.5;
            }
            let Some((candidate, trial)) = accepted else {
                log::warn!(
                    "Cox fit stalled at iteration {iteration}: no step-halved update increased the partial likelihood; keeping current estimate"
                );
                stalled = true;
                break;
            };

            let change = (&candidate - &beta)
                .iter()
                .map(|v| v.abs())
                .fold(0.0, f64::max);
            beta = candidate;
            state = trial;
            if change < self.tolerance {
                converged = true;
                break;
            }
        }
        if !converged && !stalled {
            log::warn!(
                "Cox fit did not converge within {} iterations; using last estimate",
                self.max_iterations
            );
        }

        let (event_times, cumulative_hazard, shift) =
            breslow_baseline(&design, training, &order, &beta);
        Ok(Box::new(CoxFit {
            coefficients: beta,
            shift,
            event_times,
            cumulative_hazard,
        }))
    }
}

/// Breslow cumulative baseline hazard at the distinct event times, expressed
/// relative to `exp(eta - shift)`.
fn breslow_baseline(
    design: &Array2<f64>,
    training: &Sample,
    order: &[usize],
    beta: &Array1<f64>,
) -> (Vec<f64>, Vec<f64>, f64) {
    let n = design.nrows();
    let time = training.time();
    let event = training.event();
    let weight = training.weight();
    let eta = design.dot(beta).mapv(|v| v.clamp(-ETA_CLAMP, ETA_CLAMP));
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut increments: Vec<(f64, f64)> = Vec::new();
    let mut s0 = 0.0;
    let mut start = 0usize;
    while start < n {
        let t = time[order[start]];
        let mut end = start;
        let mut deaths = 0.0;
        while end < n && time[order[end]] == t {
            let i = order[end];
            s0 += weight[i] * (eta[i] - shift).exp();
            if event[i] == 1 {
                deaths += weight[i];
            }
            end += 1;
        }
        if deaths > 0.0 {
            increments.push((t, deaths / s0));
        }
        start = end;
    }

    increments.reverse();
    let mut running = 0.0;
    let (event_times, cumulative_hazard): (Vec<f64>, Vec<f64>) = increments
        .into_iter()
        .map(|(t, dh)| {
            running += dh;
            (t, running)
        })
        .unzip();
    (event_times, cumulative_hazard, shift)
}

#[derive(Debug, Clone)]
struct CoxFit {
    coefficients: Array1<f64>,
    shift: f64,
    event_times: Vec<f64>,
    cumulative_hazard: Vec<f64>,
}

impl CoxFit {
    fn baseline_on_grid(&self, grid: &TimeGrid) -> Array1<f64> {
        let mut k = 0usize;
        let mut current = 0.0;
        grid.times()
            .iter()
            .map(|&t| {
                while k < self.event_times.len() && self.event_times[k] <= t {
                    current = self.cumulative_hazard[k];
                    k += 1;
                }
                current
            })
            .collect()
    }
}

impl SurvivalModel for CoxFit {
    fn predict_survival(
        &self,
        rows: &Sample,
        grid: &TimeGrid,
    ) -> Result<CounterfactualCurves, NuisanceError> {
        let expected = self.coefficients.len() - 1;
        if rows.num_covariates() != expected {
            return Err(NuisanceError::CovariateDimension {
                model: "Cox",
                expected,
                found: rows.num_covariates(),
            });
        }
        let baseline = self.baseline_on_grid(grid);
        let shape = (rows.len(), grid.len());
        let curves_for = |group: u8| -> Array2<f64> {
            let risk = design_with_group(rows, Some(group))
                .dot(&self.coefficients)
                .mapv(|eta| (eta.clamp(-ETA_CLAMP, ETA_CLAMP) - self.shift).exp());
            Array2::from_shape_fn(shape, |(i, j)| (-baseline[j] * risk[i]).exp())
        };
        Ok(CounterfactualCurves {
            group0: curves_for(0),
            group1: curves_for(1),
        })
    }
}
