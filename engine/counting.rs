//! Augmented counting-process quantities.
//!
//! For every observation and counterfactual group `a` this module builds the
//! pseudo at-risk process `Ỹ^a` and the pseudo jump process `dÑ^a` over the
//! time grid. Both combine the observed processes, inverse propensity and
//! censoring weights, the censoring-martingale compensator and the outcome
//! regression term. They are functions of the clipped nuisance predictions
//! only; the solver tilts them by `exp(β)` without rebuilding them.
//!
//! With `t_0 = 0` and `S(t_0) = G(t_0) = 1`:
//!
//! ```text
//! C^a(t_j)  = Σ_{k<j} dM_C^a(t_k) / (S^a(t_k) G^a(t_k))
//! Ỹ^a(t_j)  = ω [Y(t_j) / G^a(t_{j-1}) + S^a(t_{j-1}) C^a(t_j)] + ρ S^a(t_{j-1})
//! dÑ^a(t_j) = ω [dN_T(t_j) / G^a(t_{j-1}) + ΔS^a(t_j) C^a(t_j)] + ρ ΔS^a(t_j)
//! ```
//!
//! where `ΔS^a(t_j) = S^a(t_{j-1}) - S^a(t_j)` and the weights `ω`, `ρ` depend
//! on the augmentation mode.

use crate::config::Augmentation;
use crate::crossfit::NuisancePredictions;
use crate::estimate::EstimationError;
use crate::grid::TimeGrid;
use crate::sample::Sample;
use ndarray::{Array2, ArrayView1, ArrayViewMut1, Zip};

/// Pseudo at-risk and jump matrices, shape `[n, grid]` per counterfactual group.
#[derive(Debug, Clone)]
pub struct CountingProcess {
    at_risk: [Array2<f64>; 2],
    jump: [Array2<f64>; 2],
}

/// Observed follow-up of one subject in grid coordinates.
#[derive(Debug, Clone, Copy)]
struct Follow {
    rank: usize,
    failed: bool,
    /// Censored strictly before the horizon.
    censored: bool,
}

/// Augmentation weights of one subject for one counterfactual group.
#[derive(Debug, Clone, Copy)]
struct ArmWeights {
    /// Inverse-probability weight on the observed processes.
    omega: f64,
    /// Weight on the outcome-regression term.
    rho: f64,
    compensate: bool,
}

fn arm_weights(augmentation: Augmentation, group: u8, arm: u8, propensity: f64) -> ArmWeights {
    let indicator = if group == arm { 1.0 } else { 0.0 };
    match augmentation {
        Augmentation::Aiptcw | Augmentation::Aiptw => {
            let probability = if arm == 1 {
                propensity
            } else {
                1.0 - propensity
            };
            let omega = indicator / probability;
            ArmWeights {
                omega,
                rho: 1.0 - omega,
                compensate: augmentation.uses_censoring_model(),
            }
        }
        Augmentation::Aipcw => ArmWeights {
            omega: indicator,
            rho: 0.0,
            compensate: true,
        },
    }
}

/// Fills one subject's `Ỹ^a` and `dÑ^a` rows from its survival rows.
fn fill_row(
    follow: Follow,
    weights: ArmWeights,
    survival: ArrayView1<'_, f64>,
    censoring: ArrayView1<'_, f64>,
    mut at_risk: ArrayViewMut1<'_, f64>,
    mut jump: ArrayViewMut1<'_, f64>,
) {
    let ArmWeights {
        omega,
        rho,
        compensate,
    } = weights;
    let mut compensator = 0.0;
    let mut s_prev = 1.0;
    let mut g_prev = 1.0;
    for j in 0..survival.len() {
        let s = survival[j];
        let g = censoring[j];
        let in_risk_set = j <= follow.rank;
        let y = if in_risk_set { 1.0 } else { 0.0 };
        let dn = if follow.failed && j == follow.rank {
            1.0
        } else {
            0.0
        };
        let drop = s_prev - s;

        at_risk[j] = omega * (y / g_prev + s_prev * compensator) + rho * s_prev;
        jump[j] = omega * (dn / g_prev + drop * compensator) + rho * drop;

        if compensate && in_risk_set {
            let dn_censor = if follow.censored && j == follow.rank {
                1.0
            } else {
                0.0
            };
            let hazard_increment = g_prev.ln() - g.ln();
            compensator += (dn_censor - hazard_increment) / (s * g);
        }
        s_prev = s;
        g_prev = g;
    }
}

impl CountingProcess {
    /// Builds the pseudo processes for every observation of `sample`.
    ///
    /// `sample` carries horizon-clipped follow-up and `rank[i]` is the grid
    /// index of observation `i`'s time. Predictions must already be clipped.
    pub fn build(
        sample: &Sample,
        rank: &[usize],
        grid: &TimeGrid,
        predictions: &NuisancePredictions,
        augmentation: Augmentation,
    ) -> Result<Self, EstimationError> {
        let n = sample.len();
        let m = grid.len();
        let expected = (n, m);
        if rank.len() != n
            || predictions.propensity.len() != n
            || predictions.event.shape() != expected
            || predictions.censoring.shape() != expected
            || predictions.event.group1.dim() != expected
            || predictions.censoring.group1.dim() != expected
            || rank.iter().any(|&r| r >= m)
        {
            return Err(EstimationError::DimensionMismatch);
        }

        let tau = grid.tau();
        let follows: Vec<Follow> = (0..n)
            .map(|i| {
                let failed = sample.event()[i] == 1;
                Follow {
                    rank: rank[i],
                    failed,
                    censored: !failed && sample.time()[i] < tau,
                }
            })
            .collect();
        let group = sample.group();

        let mut at_risk = [Array2::<f64>::zeros(expected), Array2::<f64>::zeros(expected)];
        let mut jump = [Array2::<f64>::zeros(expected), Array2::<f64>::zeros(expected)];
        for (arm, (y, dn)) in at_risk.iter_mut().zip(jump.iter_mut()).enumerate() {
            let survival = predictions.event.curve(arm);
            let censoring = predictions.censoring.curve(arm);
            Zip::indexed(y.rows_mut())
                .and(dn.rows_mut())
                .par_for_each(|i, y_row, dn_row| {
                    let weights =
                        arm_weights(augmentation, group[i], arm as u8, predictions.propensity[i]);
                    fill_row(
                        follows[i],
                        weights,
                        survival.row(i),
                        censoring.row(i),
                        y_row,
                        dn_row,
                    );
                });
        }

        log::debug!("Built {augmentation} counting processes for {n} observations x {m} times");
        Ok(Self { at_risk, jump })
    }

    /// Pseudo at-risk process `Ỹ^a`, shape `[n, grid]`.
    #[inline]
    pub fn at_risk(&self, group: usize) -> &Array2<f64> {
        &self.at_risk[group]
    }

    /// Pseudo jump process `dÑ^a`, shape `[n, grid]`.
    #[inline]
    pub fn jump(&self, group: usize) -> &Array2<f64> {
        &self.jump[group]
    }

    #[inline]
    pub fn num_observations(&self) -> usize {
        self.at_risk[0].nrows()
    }

    #[inline]
    pub fn num_times(&self) -> usize {
        self.at_risk[0].ncols()
    }

    /// Processes from explicit matrices, for exercising the solver directly.
    #[cfg(test)]
    pub(crate) fn from_matrices(at_risk: [Array2<f64>; 2], jump: [Array2<f64>; 2]) -> Self {
        Self { at_risk, jump }
    }
}
