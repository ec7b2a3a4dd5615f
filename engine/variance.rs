use crate::estimate::EstimationError;
use crate::solver::EstimatingEquation;
use ndarray::{Array1, Zip};

/// Per-observation influence contributions at `beta`:
///
/// `φ_i = Σ_j [dN1_ij - Ā_f dN0_ij - (Γ1_ij - Ā_f Γ0_ij) dΛ0_f(t_j)]`
///
/// with `f` the fold of observation `i`, `Γ1 = e^β Ỹ^1` and
/// `Γ0 = Ỹ^0 + e^β Ỹ^1`.
pub fn influence_contributions(equation: &EstimatingEquation<'_>, beta: f64) -> Array1<f64> {
    let tilt = beta.exp();
    let a_bar = equation.a_bar(beta);
    let increments = equation.baseline_increments(beta);
    let process = equation.process();
    let folds = equation.folds();
    let (y0, y1) = (process.at_risk(0), process.at_risk(1));
    let (dn0, dn1) = (process.jump(0), process.jump(1));

    let mut influence = Array1::<f64>::zeros(equation.num_observations());
    Zip::indexed(&mut influence).par_for_each(|i, phi| {
        let f = folds.fold_of(i);
        let mut total = 0.0;
        for j in 0..a_bar.ncols() {
            let a = a_bar[[f, j]];
            let jump1 = dn1[[i, j]];
            let jump0 = dn0[[i, j]] + jump1;
            let gamma1 = tilt * y1[[i, j]];
            let gamma0 = y0[[i, j]] + gamma1;
            total += jump1 - a * jump0 - (gamma1 - a * gamma0) * increments[[f, j]];
        }
        *phi = total;
    });
    influence
}

/// Model-based sandwich standard error of `β̂`: `sqrt(K / U'(β)² / n)` with
/// `K` the weighted mean of squared influence contributions. A variance that
/// is not finite, typically from a vanishing `U'`, is an error.
pub fn sandwich_standard_error(
    equation: &EstimatingEquation<'_>,
    beta: f64,
    derivative: f64,
) -> Result<f64, EstimationError> {
    let influence = influence_contributions(equation, beta);
    let weights = equation.weights();
    let meat = influence
        .iter()
        .zip(weights.iter())
        .map(|(phi, w)| w * phi * phi)
        .sum::<f64>()
        / equation.total_weight();
    let n = equation.num_observations() as f64;
    let variance = meat / (derivative * derivative) / n;
    if !variance.is_finite() || variance < 0.0 {
        return Err(EstimationError::NonFiniteVariance { meat, derivative });
    }
    Ok(variance.sqrt())
}
