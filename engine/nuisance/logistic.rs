use super::{NuisanceError, PropensityLearner, PropensityModel};
use crate::sample::Sample;
use ndarray::{Array1, Array2};
use ndarray_linalg::Solve;

const MAX_STEP_HALVINGS: usize = 30;
const ETA_CLAMP: f64 = 30.0;

/// Ridge-stabilised logistic regression of the group indicator on `[1, Z]`,
/// fitted by damped Newton (IRLS) on the mean-scaled log-likelihood. The
/// intercept is not penalised.
#[derive(Debug, Clone)]
pub struct LogisticLearner {
    pub ridge: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LogisticLearner {
    fn default() -> Self {
        Self {
            ridge: 1e-4,
            max_iterations: 100,
            tolerance: 1e-9,
        }
    }
}

fn design_with_intercept(rows: &Sample) -> Array2<f64> {
    let covariates = rows.covariates();
    Array2::from_shape_fn((rows.len(), rows.num_covariates() + 1), |(i, j)| {
        if j == 0 { 1.0 } else { covariates[[i, j - 1]] }
    })
}

#[inline]
fn sigmoid(eta: f64) -> f64 {
    let eta = eta.clamp(-ETA_CLAMP, ETA_CLAMP);
    1.0 / (1.0 + (-eta).exp())
}

struct LogLikelihood {
    value: f64,
    gradient: Array1<f64>,
    information: Array2<f64>,
}

fn log_likelihood(
    design: &Array2<f64>,
    target: &Array1<f64>,
    weight: &Array1<f64>,
    beta: &Array1<f64>,
    ridge: f64,
) -> LogLikelihood {
    let p = design.ncols();
    let total = weight.sum();
    let eta = design.dot(beta);
    let mut value = 0.0;
    let mut gradient = Array1::<f64>::zeros(p);
    let mut information = Array2::<f64>::zeros((p, p));
    for (i, row) in design.rows().into_iter().enumerate() {
        let mu = sigmoid(eta[i]);
        let w = weight[i] / total;
        let mu_safe = mu.clamp(1e-15, 1.0 - 1e-15);
        value += w * (target[i] * mu_safe.ln() + (1.0 - target[i]) * (1.0 - mu_safe).ln());
        gradient.scaled_add(w * (target[i] - mu), &row);
        let curvature = w * mu * (1.0 - mu);
        for a in 0..p {
            for b in 0..p {
                information[[a, b]] += curvature * row[a] * row[b];
            }
        }
    }
    for j in 1..p {
        value -= 0.5 * ridge * beta[j] * beta[j];
        gradient[j] -= ridge * beta[j];
        information[[j, j]] += ridge;
    }
    LogLikelihood {
        value,
        gradient,
        information,
    }
}

impl PropensityLearner for LogisticLearner {
    fn name(&self) -> &str {
        "logit"
    }

    fn fit(&self, training: &Sample) -> Result<Box<dyn PropensityModel>, NuisanceError> {
        let design = design_with_intercept(training);
        let target = training.group().mapv(f64::from);
        let weight = training.weight().to_owned();
        let share = target.dot(&weight) / weight.sum();
        if share <= 0.0 || share >= 1.0 {
            return Err(NuisanceError::FitFailed {
                model: "logit",
                reason: format!("training rows contain a single group (share {share})"),
            });
        }

        let mut beta = Array1::<f64>::zeros(design.ncols());
        beta[0] = (share / (1.0 - share)).ln();
        let mut state = log_likelihood(&design, &target, &weight, &beta, self.ridge);
        let mut converged = false;
        let mut stalled = false;
        for iteration in 0..self.max_iterations {
            let direction = state
                .information
                .solve(&state.gradient)
                .map_err(|source| NuisanceError::LinearSolve {
                    model: "logit",
                    source,
                })?;
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = &beta + &(&direction * step);
                let trial = log_likelihood(&design, &target, &weight, &candidate, self.ridge);
                if trial.value.is_finite() && trial.value >= state.value - 1e-14 {
                    accepted = Some((candidate, trial));
                    break;
                }
                step *= 0.5;
            }
            let Some((candidate, trial)) = accepted else {
                log::warn!(
                    "Logistic propensity fit stalled at iteration {iteration}: no step-halved update increased the likelihood; keeping current estimate"
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
                "Logistic propensity fit did not converge within {} iterations",
                self.max_iterations
            );
        }
        Ok(Box::new(LogisticFit { coefficients: beta }))
    }
}

#[derive(Debug, Clone)]
struct LogisticFit {
    coefficients: Array1<f64>,
}

impl PropensityModel for LogisticFit {
    fn predict_propensity(&self, rows: &Sample) -> Result<Array1<f64>, NuisanceError> {
        let expected = self.coefficients.len() - 1;
        if rows.num_covariates() != expected {
            return Err(NuisanceError::CovariateDimension {
                model: "logit",
                expected,
                found: rows.num_covariates(),
            });
        }
        Ok(design_with_intercept(rows)
            .dot(&self.coefficients)
            .mapv(sigmoid))
    }
}

/// Weighted share of group 1, ignoring covariates. Appropriate when group
/// assignment is randomised.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarginalPropensityLearner;

#[derive(Debug, Clone, Copy)]
struct MarginalFit {
    share: f64,
}

impl PropensityLearner for MarginalPropensityLearner {
    fn name(&self) -> &str {
        "marginal"
    }

    fn fit(&self, training: &Sample) -> Result<Box<dyn PropensityModel>, NuisanceError> {
        let weight = training.weight();
        let treated: f64 = training
            .group()
            .iter()
            .zip(weight.iter())
            .filter(|(g, _)| **g == 1)
            .map(|(_, w)| *w)
            .sum();
        Ok(Box::new(MarginalFit {
            share: treated / training.total_weight(),
        }))
    }
}

impl PropensityModel for MarginalFit {
    fn predict_propensity(&self, rows: &Sample) -> Result<Array1<f64>, NuisanceError> {
        Ok(Array1::from_elem(rows.len(), self.share))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn null_covariate_recovers_group_share() {
        let sample = Sample::new(
            array![1.0, 2.0, 3.0, 4.0],
            array![1, 1, 0, 1],
            array![0, 1, 0, 1],
            Array2::zeros((4, 1)),
            None,
        )
        .expect("sample");
        let scores = LogisticLearner::default()
            .fit(&sample)
            .and_then(|m| m.predict_propensity(&sample))
            .expect("propensity");
        for &score in scores.iter() {
            assert_abs_diff_eq!(score, 0.5, epsilon = 1e-9);
        }
    }

    #[test]
    fn informative_covariate_orders_scores() {
        let z = array![[-2.0], [-1.0], [-0.5], [0.0], [0.5], [1.0], [1.5], [2.0]];
        let sample = Sample::new(
            Array1::from_elem(8, 1.0),
            Array1::from_elem(8, 1),
            array![0, 0, 1, 0, 1, 0, 1, 1],
            z,
            None,
        )
        .expect("sample");
        let scores = LogisticLearner::default()
            .fit(&sample)
            .and_then(|m| m.predict_propensity(&sample))
            .expect("propensity");
        assert!(scores[7] > scores[0]);
        assert!(scores.iter().all(|&s| s > 0.0 && s < 1.0));
    }

    #[test]
    fn marginal_share_is_weighted() {
        let sample = Sample::new(
            array![1.0, 2.0, 3.0],
            array![1, 1, 1],
            array![1, 0, 0],
            Array2::zeros((3, 0)),
            Some(array![2.0, 1.0, 1.0]),
        )
        .expect("sample");
        let scores = MarginalPropensityLearner
            .fit(&sample)
            .and_then(|m| m.predict_propensity(&sample))
            .expect("propensity");
        assert_abs_diff_eq!(scores[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn single_group_is_a_fit_failure() {
        let sample = Sample::new(
            array![1.0, 2.0],
            array![1, 1],
            array![1, 1],
            Array2::zeros((2, 0)),
            None,
        )
        .expect("sample");
        assert!(matches!(
            LogisticLearner::default().fit(&sample),
            Err(NuisanceError::FitFailed { .. })
        ));
    }

    #[test]
    fn unconverged_fit_keeps_the_last_estimate() {
        let z = array![[-2.0], [-1.0], [-0.5], [0.0], [0.5], [1.0], [1.5], [2.0]];
        let sample = Sample::new(
            Array1::from_elem(8, 1.0),
            Array1::from_elem(8, 1),
            array![0, 0, 1, 0, 1, 0, 1, 1],
            z,
            None,
        )
        .expect("sample");
        let learner = LogisticLearner {
            max_iterations: 1,
            ..LogisticLearner::default()
        };
        let scores = learner
            .fit(&sample)
            .and_then(|m| m.predict_propensity(&sample))
            .expect("propensity");
        assert!(scores[7] > scores[0]);
        assert!(scores.iter().all(|&s| s > 0.0 && s < 1.0));
    }
}
