use crate::counting::CountingProcess;
use crate::estimate::EstimationError;
use crate::folds::FoldAssignment;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

/// Newton steps are capped at this magnitude on the log hazard ratio scale.
const MAX_NEWTON_STEP: f64 = 5.0;
/// `|U'(β)|` below this is treated as a vanishing derivative.
const MIN_DERIVATIVE: f64 = 1e-12;
/// Halvings of a Newton step that fails to reduce `|U|`.
const MAX_STEP_HALVINGS: usize = 30;
/// Half-widths tried around the current β when searching for a sign change.
const BRACKET_SPANS: [f64; 7] = [0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0];

/// The estimating equation `U(β)` over fixed counting processes.
///
/// Fold-level weighted sums of the pseudo processes are computed once; every
/// evaluation at a new β only re-tilts these `[k, grid]` matrices. Per-subject
/// rows stay borrowed for the sandwich variance.
///
/// Augmented at-risk totals can be negative. A `(fold, time)` cell uses its
/// own tilted share only when both group totals are non-negative and not both
/// zero, so its denominator stays positive for every β. Other cells take the
/// share of the pooled sample, built from the positive parts of the pooled
/// totals. The choice does not depend on β, which keeps `Ā` in `[0, 1]` and
/// `U` continuous.
#[derive(Debug)]
pub struct EstimatingEquation<'a> {
    process: &'a CountingProcess,
    folds: &'a FoldAssignment,
    weights: ArrayView1<'a, f64>,
    total_weight: f64,
    /// `Σ_{i∈f} w_i Ỹ_i^0(t_j)`
    at_risk0: Array2<f64>,
    /// `Σ_{i∈f} w_i Ỹ_i^1(t_j)`
    at_risk1: Array2<f64>,
    /// `Σ_{i∈f} w_i (dÑ_i^0 + dÑ_i^1)(t_j)`
    jump0: Array2<f64>,
    /// `Σ_{i∈f} w_i dÑ_i^1(t_j)`
    jump1: Array2<f64>,
    /// Cells whose fold totals define their own share.
    own_share: Array2<bool>,
    /// Positive part of `Σ_f at_risk0`, per time.
    pooled_at_risk0: Array1<f64>,
    /// Positive part of `Σ_f at_risk1`, per time.
    pooled_at_risk1: Array1<f64>,
    /// `Σ_f jump0`, per time.
    pooled_jump0: Array1<f64>,
}

/// Per-time contributions to the score and to minus its derivative.
#[derive(Debug, Clone)]
pub struct ScoreTerms {
    /// `Σ_f (D1 - Ā D0) / W` at each grid time.
    pub numerator: Array1<f64>,
    /// `Σ_f Ā (1 - Ā) D0 / W` at each grid time.
    pub curvature: Array1<f64>,
}

/// Group-1 share `e^β y1 / (y0 + e^β y1)` and its denominator, if positive.
#[inline]
fn tilted_share(y0: f64, y1: f64, tilt: f64) -> Option<(f64, f64)> {
    let denominator = y0 + tilt * y1;
    (denominator > 0.0).then(|| (tilt * y1 / denominator, denominator))
}

impl<'a> EstimatingEquation<'a> {
    pub fn new(
        process: &'a CountingProcess,
        folds: &'a FoldAssignment,
        weights: ArrayView1<'a, f64>,
    ) -> Result<Self, EstimationError> {
        let n = process.num_observations();
        let m = process.num_times();
        if folds.len() != n || weights.len() != n {
            return Err(EstimationError::DimensionMismatch);
        }
        let k = folds.num_folds();
        let mut at_risk0 = Array2::<f64>::zeros((k, m));
        let mut at_risk1 = Array2::<f64>::zeros((k, m));
        let mut jump0 = Array2::<f64>::zeros((k, m));
        let mut jump1 = Array2::<f64>::zeros((k, m));
        for i in 0..n {
            let f = folds.fold_of(i);
            let w = weights[i];
            at_risk0
                .row_mut(f)
                .scaled_add(w, &process.at_risk(0).row(i));
            at_risk1
                .row_mut(f)
                .scaled_add(w, &process.at_risk(1).row(i));
            jump0.row_mut(f).scaled_add(w, &process.jump(0).row(i));
            jump0.row_mut(f).scaled_add(w, &process.jump(1).row(i));
            jump1.row_mut(f).scaled_add(w, &process.jump(1).row(i));
        }

        let own_share = Zip::from(&at_risk0)
            .and(&at_risk1)
            .map_collect(|&y0, &y1| y0 >= 0.0 && y1 >= 0.0 && y0 + y1 > 0.0);
        let pooled_cells = own_share.iter().filter(|own| !**own).count();
        if pooled_cells > 0 {
            log::debug!(
                "{pooled_cells} of {} fold-time cells have a sign-indefinite risk set; using pooled shares there",
                own_share.len()
            );
        }
        let pooled_at_risk0 = at_risk0.sum_axis(Axis(0)).mapv(|v| v.max(0.0));
        let pooled_at_risk1 = at_risk1.sum_axis(Axis(0)).mapv(|v| v.max(0.0));
        let pooled_jump0 = jump0.sum_axis(Axis(0));

        Ok(Self {
            process,
            folds,
            weights,
            total_weight: weights.sum(),
            at_risk0,
            at_risk1,
            jump0,
            jump1,
            own_share,
            pooled_at_risk0,
            pooled_at_risk1,
            pooled_jump0,
        })
    }

    /// Fold-wise group-1 share of the tilted risk set, `Ā_f(β, t)`. Cells
    /// without an own share take the pooled share, or 0 when the pooled risk
    /// set is empty.
    pub fn a_bar(&self, beta: f64) -> Array2<f64> {
        let tilt = beta.exp();
        let pooled = Zip::from(&self.pooled_at_risk0)
            .and(&self.pooled_at_risk1)
            .map_collect(|&y0, &y1| tilted_share(y0, y1, tilt).map_or(0.0, |(share, _)| share));
        let mut a_bar = Array2::<f64>::zeros(self.at_risk0.raw_dim());
        Zip::indexed(&mut a_bar)
            .and(&self.own_share)
            .and(&self.at_risk0)
            .and(&self.at_risk1)
            .for_each(|(_, j), a, &own, &y0, &y1| {
                *a = if own {
                    tilted_share(y0, y1, tilt).map_or(0.0, |(share, _)| share)
                } else {
                    pooled[j]
                };
            });
        a_bar
    }

    pub fn score_terms(&self, beta: f64) -> ScoreTerms {
        let a_bar = self.a_bar(beta);
        let mut numerator = Array2::<f64>::zeros(a_bar.raw_dim());
        let mut curvature = Array2::<f64>::zeros(a_bar.raw_dim());
        Zip::from(&mut numerator)
            .and(&mut curvature)
            .and(&a_bar)
            .and(&self.jump0)
            .and(&self.jump1)
            .for_each(|num, curv, &a, &d0, &d1| {
                *num = d1 - a * d0;
                *curv = a * (1.0 - a) * d0;
            });
        ScoreTerms {
            numerator: numerator.sum_axis(Axis(0)) / self.total_weight,
            curvature: curvature.sum_axis(Axis(0)) / self.total_weight,
        }
    }

    /// `(U(β), U'(β))`.
    pub fn evaluate(&self, beta: f64) -> (f64, f64) {
        let terms = self.score_terms(beta);
        (terms.numerator.sum(), -terms.curvature.sum())
    }

    /// Fold-wise baseline hazard increments `dΛ0_f(t) = D0_f / (Y0_f + e^β Y1_f)`,
    /// taken from the pooled sample in the same cells as `Ā`, and zero where
    /// even the pooled risk set is empty.
    pub fn baseline_increments(&self, beta: f64) -> Array2<f64> {
        let tilt = beta.exp();
        let pooled = Zip::from(&self.pooled_jump0)
            .and(&self.pooled_at_risk0)
            .and(&self.pooled_at_risk1)
            .map_collect(|&d0, &y0, &y1| {
                tilted_share(y0, y1, tilt).map_or(0.0, |(_, denominator)| d0 / denominator)
            });
        let mut increments = Array2::<f64>::zeros(self.jump0.raw_dim());
        Zip::indexed(&mut increments)
            .and(&self.own_share)
            .and(&self.jump0)
            .and(&self.at_risk0)
            .and(&self.at_risk1)
            .for_each(|(_, j), d, &own, &d0, &y0, &y1| {
                *d = if own {
                    tilted_share(y0, y1, tilt).map_or(0.0, |(_, denominator)| d0 / denominator)
                } else {
                    pooled[j]
                };
            });
        increments
    }

    #[inline]
    pub fn process(&self) -> &CountingProcess {
        self.process
    }

    #[inline]
    pub fn folds(&self) -> &FoldAssignment {
        self.folds
    }

    #[inline]
    pub fn weights(&self) -> ArrayView1<'a, f64> {
        self.weights
    }

    #[inline]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    #[inline]
    pub fn num_observations(&self) -> usize {
        self.process.num_observations()
    }

    #[inline]
    pub fn num_times(&self) -> usize {
        self.process.num_times()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewtonOptions {
    pub max_iterations: usize,
    /// Convergence threshold on `|Δβ|`.
    pub tolerance: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonState {
    pub beta: f64,
    pub score: f64,
    pub derivative: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Two points at which `U` has opposite signs.
#[derive(Debug, Clone, Copy)]
struct Bracket {
    /// `U(positive) > 0`
    positive: f64,
    /// `U(negative) < 0`
    negative: f64,
}

impl Bracket {
    fn from_pair(a: f64, score_a: f64, b: f64, score_b: f64) -> Option<Self> {
        if score_a > 0.0 && score_b < 0.0 {
            Some(Self {
                positive: a,
                negative: b,
            })
        } else if score_a < 0.0 && score_b > 0.0 {
            Some(Self {
                positive: b,
                negative: a,
            })
        } else {
            None
        }
    }

    fn contains(&self, beta: f64) -> bool {
        let low = self.positive.min(self.negative);
        let high = self.positive.max(self.negative);
        beta > low && beta < high
    }

    fn width(&self) -> f64 {
        (self.positive - self.negative).abs()
    }

    fn midpoint(&self) -> f64 {
        0.5 * (self.positive + self.negative)
    }

    fn tighten(&mut self, beta: f64, score: f64) {
        if score > 0.0 {
            self.positive = beta;
        } else if score < 0.0 {
            self.negative = beta;
        }
    }
}

fn checked_evaluate(
    equation: &EstimatingEquation<'_>,
    beta: f64,
    iteration: usize,
) -> Result<(f64, f64), EstimationError> {
    let (score, derivative) = equation.evaluate(beta);
    if !score.is_finite() || !derivative.is_finite() {
        return Err(EstimationError::NonConvergence {
            iterations: iteration,
            beta,
            reason: format!("non-finite score {score} or derivative {derivative}"),
        });
    }
    Ok((score, derivative))
}

/// Halves the step from `beta` towards `target` until `|U|` drops or changes
/// sign. Returns the accepted point with its score and derivative.
fn backtrack(
    equation: &EstimatingEquation<'_>,
    beta: f64,
    score: f64,
    target: f64,
) -> Option<(f64, f64, f64)> {
    let mut step = target - beta;
    for _ in 0..MAX_STEP_HALVINGS {
        let trial = beta + step;
        let (trial_score, trial_derivative) = equation.evaluate(trial);
        if trial_score.is_finite()
            && trial_derivative.is_finite()
            && (trial_score.abs() < score.abs() || trial_score * score < 0.0)
        {
            return Some((trial, trial_score, trial_derivative));
        }
        step *= 0.5;
    }
    None
}

/// Looks for a sign change of `U` at growing distances from `beta`.
fn search_bracket(equation: &EstimatingEquation<'_>, beta: f64, score: f64) -> Option<Bracket> {
    for span in BRACKET_SPANS {
        for candidate in [beta - span, beta + span] {
            let (candidate_score, _) = equation.evaluate(candidate);
            if !candidate_score.is_finite() {
                continue;
            }
            if let Some(bracket) = Bracket::from_pair(beta, score, candidate, candidate_score) {
                log::debug!("Bracketed the root of U between {beta:.6} and {candidate:.6}");
                return Some(bracket);
            }
        }
    }
    None
}

/// Safeguarded Newton–Raphson root of `U(β)` starting at `beta0`.
///
/// Steps that do not reduce `|U|` are halved. Once a sign change is known,
/// Newton steps leaving the bracket are replaced by bisection. When Newton
/// stalls without a bracket, one is searched for around the current β.
pub fn solve(
    equation: &EstimatingEquation<'_>,
    beta0: f64,
    options: NewtonOptions,
) -> Result<NewtonState, EstimationError> {
    let mut beta = beta0;
    let (mut score, mut derivative) = checked_evaluate(equation, beta, 0)?;
    let mut bracket: Option<Bracket> = None;

    for iteration in 1..=options.max_iterations {
        let usable_derivative = derivative.abs() >= MIN_DERIVATIVE;
        if score == 0.0 && usable_derivative {
            return Ok(NewtonState {
                beta,
                score,
                derivative,
                iterations: iteration,
                converged: true,
            });
        }
        let newton = usable_derivative
            .then(|| beta - (score / derivative).clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP));
        // Within tolerance of the root |U| is rounding noise.
        if let Some(next) = newton.filter(|next| (next - beta).abs() < options.tolerance) {
            let (score, derivative) = checked_evaluate(equation, next, iteration)?;
            return Ok(NewtonState {
                beta: next,
                score,
                derivative,
                iterations: iteration,
                converged: true,
            });
        }

        let accepted = match (bracket, newton) {
            (Some(current), Some(next)) if current.contains(next) => {
                let (s, d) = checked_evaluate(equation, next, iteration)?;
                Some((next, s, d))
            }
            (Some(current), _) => {
                let middle = current.midpoint();
                let (s, d) = checked_evaluate(equation, middle, iteration)?;
                Some((middle, s, d))
            }
            // A halved step too short to move β counts as a stall.
            (None, Some(next)) => backtrack(equation, beta, score, next).filter(|(point, _, _)| {
                *point == next || (point - beta).abs() >= options.tolerance
            }),
            (None, None) => None,
        };
        let (next, next_score, next_derivative) = match accepted {
            Some(point) => point,
            None => {
                let Some(found) = search_bracket(equation, beta, score) else {
                    let reason = if usable_derivative {
                        "step halving could not reduce |U| and no sign change was found"
                            .to_string()
                    } else {
                        format!("derivative vanished ({derivative:.3e}) and no sign change was found")
                    };
                    return Err(EstimationError::NonConvergence {
                        iterations: iteration,
                        beta,
                        reason,
                    });
                };
                bracket = Some(found);
                let middle = found.midpoint();
                let (s, d) = checked_evaluate(equation, middle, iteration)?;
                (middle, s, d)
            }
        };

        match bracket.as_mut() {
            Some(current) => current.tighten(next, next_score),
            None => bracket = Bracket::from_pair(beta, score, next, next_score),
        }
        let step = (next - beta).abs();
        beta = next;
        score = next_score;
        derivative = next_derivative;
        log::debug!(
            "Newton iteration {iteration}: beta = {beta:.10}, U = {score:.3e}, U' = {derivative:.3e}"
        );

        let collapsed = bracket.is_some_and(|current| current.width() < options.tolerance);
        if step < options.tolerance || collapsed {
            return Ok(NewtonState {
                beta,
                score,
                derivative,
                iterations: iteration,
                converged: true,
            });
        }
    }
    Err(EstimationError::NonConvergence {
        iterations: options.max_iterations,
        beta,
        reason: "iteration budget exhausted".to_string(),
    })
}
