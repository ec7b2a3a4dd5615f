use crate::solver::EstimatingEquation;
use itertools::Itertools;
use ndarray::{Array1, Axis};

/// Breslow-type baseline cumulative hazard with the implied counterfactual
/// survival curves, all on the time grid.
#[derive(Debug, Clone)]
pub struct BaselineHazard {
    pub cumulative_hazard: Array1<f64>,
    /// `S0(t) = exp(-Λ0(t))`
    pub survival_group0: Array1<f64>,
    /// `S1(t) = exp(-Λ0(t) e^β)`
    pub survival_group1: Array1<f64>,
}

impl BaselineHazard {
    /// Averages the distinct fold rows of `dΛ0` at `beta`, floors increments at
    /// zero and accumulates over time.
    pub fn estimate(equation: &EstimatingEquation<'_>, beta: f64) -> Self {
        let increments = equation.baseline_increments(beta);
        let distinct = increments
            .axis_iter(Axis(0))
            // `+ 0.0` folds -0.0 into 0.0 before comparing bit patterns.
            .unique_by(|row| row.iter().map(|v| (v + 0.0).to_bits()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let mut averaged = Array1::<f64>::zeros(increments.ncols());
        for row in &distinct {
            averaged += row;
        }
        if !distinct.is_empty() {
            averaged /= distinct.len() as f64;
        }
        let floored = averaged.iter().filter(|v| **v < 0.0).count();
        if floored > 0 {
            log::debug!("Floored {floored} negative baseline hazard increments at zero");
        }

        let mut running = 0.0;
        let cumulative_hazard: Array1<f64> = averaged
            .iter()
            .map(|&d| {
                running += d.max(0.0);
                running
            })
            .collect();
        let tilt = beta.exp();
        Self {
            survival_group0: cumulative_hazard.mapv(|h| (-h).exp()),
            survival_group1: cumulative_hazard.mapv(|h| (-h * tilt).exp()),
            cumulative_hazard,
        }
    }
}
