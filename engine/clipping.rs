use crate::config::Augmentation;
use crate::crossfit::NuisancePredictions;
use crate::nuisance::CounterfactualCurves;
use ndarray::{Array2, ArrayViewMut1, Axis};

/// Lower bounds applied to nuisance predictions before they enter any ratio.
#[derive(Debug, Clone, Copy)]
pub struct ClippingBounds {
    /// Survival probabilities are clamped to `[min_survival, 1]`.
    pub min_survival: f64,
    /// Propensities are clamped to `[min_propensity, 1 - min_propensity]`.
    pub min_propensity: f64,
}

/// Replaces unknown cells (non-finite or `<= 0`) by the previous value on the
/// same row; a leading unknown cell becomes 1. Returns the number replaced.
fn forward_fill(mut row: ArrayViewMut1<'_, f64>) -> usize {
    let mut replaced = 0;
    let mut previous = 1.0;
    for value in row.iter_mut() {
        if value.is_finite() && *value > 0.0 {
            previous = *value;
        } else {
            *value = previous;
            replaced += 1;
        }
    }
    replaced
}

/// Clamps a row into `[floor, 1]` and enforces a non-increasing profile.
/// Returns the number of cells changed by the clamp.
fn clamp_curve(mut row: ArrayViewMut1<'_, f64>, floor: f64) -> usize {
    let mut clamped = 0;
    let mut running = 1.0f64;
    for value in row.iter_mut() {
        let bounded = (*value).clamp(floor, 1.0);
        if bounded != *value {
            clamped += 1;
        }
        running = running.min(bounded);
        *value = running;
    }
    clamped
}

fn clip_curves(curves: &mut CounterfactualCurves, floor: f64, role: &str) {
    let mut filled = 0;
    let mut clamped = 0;
    for group in 0..2 {
        let matrix: &mut Array2<f64> = curves.curve_mut(group);
        for row in matrix.axis_iter_mut(Axis(0)) {
            filled += forward_fill(row);
        }
        for row in matrix.axis_iter_mut(Axis(0)) {
            clamped += clamp_curve(row, floor);
        }
    }
    if filled > 0 || clamped > 0 {
        log::debug!(
            "Clipped {role} survival: {filled} unknown cells carried forward, {clamped} cells clamped to [{floor}, 1]"
        );
    }
}

/// Bounds every survival and propensity prediction away from 0 (and 1).
///
/// Survival rows are forward-filled, clamped to `[min_survival, 1]` and made
/// non-increasing in time. Under AIPTW the censoring curves are reset to 1.
pub fn clip_predictions(
    mut predictions: NuisancePredictions,
    bounds: ClippingBounds,
    augmentation: Augmentation,
) -> NuisancePredictions {
    clip_curves(&mut predictions.event, bounds.min_survival, "event");
    if augmentation.uses_censoring_model() {
        clip_curves(&mut predictions.censoring, bounds.min_survival, "censoring");
    } else {
        predictions.censoring.group0.fill(1.0);
        predictions.censoring.group1.fill(1.0);
    }

    let low = bounds.min_propensity;
    let high = 1.0 - bounds.min_propensity;
    let mut clamped = 0;
    predictions.propensity.mapv_inplace(|p| {
        let bounded = if p.is_finite() { p.clamp(low, high) } else { 0.5 };
        if bounded != p {
            clamped += 1;
        }
        bounded
    });
    if clamped > 0 {
        log::debug!("Clamped {clamped} propensity scores to [{low}, {high}]");
    }
    predictions
}
