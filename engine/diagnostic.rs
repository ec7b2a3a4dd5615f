use crate::solver::EstimatingEquation;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Below this magnitude the per-time curvature is treated as undefined.
const MIN_CURVATURE: f64 = 1e-12;

/// Time-varying log hazard ratio diagnostic: recentred per-time residuals.
///
/// A flat profile around `β̂` is consistent with proportional hazards; a trend
/// suggests the hazard ratio changes over follow-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeVaryingBeta {
    pub time: Vec<f64>,
    pub value: Vec<f64>,
}

impl TimeVaryingBeta {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Per-time scaled residuals `n_j / d_j`, recentred to have mean `beta`.
/// Times where the ratio is undefined are dropped.
pub fn time_varying_beta(
    equation: &EstimatingEquation<'_>,
    beta: f64,
    times: ArrayView1<'_, f64>,
) -> TimeVaryingBeta {
    let terms = equation.score_terms(beta);
    let (time, raw): (Vec<f64>, Vec<f64>) = times
        .iter()
        .zip(terms.numerator.iter().zip(terms.curvature.iter()))
        .filter(|(_, (_, d))| d.abs() >= MIN_CURVATURE)
        .map(|(&t, (&n, &d))| (t, n / d))
        .filter(|(_, r)| r.is_finite())
        .unzip();
    if raw.is_empty() {
        log::warn!("Time-varying diagnostic is empty: no grid time has a defined residual");
        return TimeVaryingBeta::default();
    }
    let mean = raw.iter().sum::<f64>() / raw.len() as f64;
    let value = raw.iter().map(|r| r - mean + beta).collect();
    TimeVaryingBeta { time, value }
}
