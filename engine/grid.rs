//! Canonical follow-up time grid.
//!
//! Every prediction matrix in the engine has one column per grid time. The grid
//! is built once from the full sample after clipping follow-up at the horizon
//! `tau`, and is never modified afterwards.

use crate::estimate::EstimationError;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use std::collections::HashMap;

/// Relative size of the shift applied to tied follow-up times.
const TIE_PERTURBATION: f64 = 1e-9;

/// Strictly increasing distinct follow-up times, all `<= tau`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    times: Array1<f64>,
    tau: f64,
}

impl TimeGrid {
    #[inline]
    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    #[inline]
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Index of `time` in the grid, or of the last grid time below it.
    /// Returns `None` for times before the first grid point.
    pub fn rank_of(&self, time: f64) -> Option<usize> {
        let slice = self.times.as_slice()?;
        slice.partition_point(|&t| t <= time).checked_sub(1)
    }
}

/// Follow-up after horizon clipping and tie resolution, in original row order.
#[derive(Debug, Clone)]
pub struct AdjustedOutcomes {
    pub time: Array1<f64>,
    pub event: Array1<u8>,
    /// Grid index of each observation's (adjusted) time.
    pub rank: Vec<usize>,
}

/// Clips follow-up at `tau`, breaks ties below `tau` and builds the grid.
///
/// Rows with `time > tau` are recensored (`event = 0`) and moved to `tau`.
/// Repeated values below `tau` are shifted upwards in original row order: the
/// k-th repeat of a value (k >= 1) moves up by `k` perturbation steps. The pass
/// repeats until the sub-horizon times are distinct. Rows sitting exactly at
/// `tau` are allowed to stay tied.
pub fn build_time_grid(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, u8>,
    tau: Option<f64>,
) -> Result<(TimeGrid, AdjustedOutcomes), EstimationError> {
    if time.len() != event.len() {
        return Err(EstimationError::DimensionMismatch);
    }
    if time.is_empty() {
        return Err(EstimationError::InvalidConfig(
            "cannot build a time grid from an empty sample".to_string(),
        ));
    }
    if let Some(&bad) = time.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(EstimationError::InvalidConfig(format!(
            "follow-up time {bad} is not a finite non-negative number"
        )));
    }

    let max_time = time.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let tau = tau.unwrap_or(max_time);
    if !tau.is_finite() || tau <= 0.0 {
        return Err(EstimationError::InvalidConfig(format!(
            "horizon tau must be positive and finite, got {tau}"
        )));
    }

    let mut adjusted_time = time.to_owned();
    let mut adjusted_event = event.to_owned();
    let mut recensored = 0usize;
    for (t, e) in adjusted_time.iter_mut().zip(adjusted_event.iter_mut()) {
        if *t > tau {
            if *e == 1 {
                recensored += 1;
            }
            *e = 0;
            *t = tau;
        }
    }
    if recensored > 0 {
        log::info!("Recensored {recensored} events observed after tau = {tau}");
    }
    if !adjusted_event.iter().any(|&e| e == 1) {
        return Err(EstimationError::InvalidConfig(format!(
            "no events are observed at or before tau = {tau}"
        )));
    }

    let shifted = break_ties(&mut adjusted_time, tau);
    if shifted > 0 {
        log::debug!("Perturbed {shifted} tied follow-up times below tau");
    }

    let times: Array1<f64> = adjusted_time
        .iter()
        .copied()
        .sorted_by(f64::total_cmp)
        .dedup()
        .collect();
    let grid = TimeGrid { times, tau };

    let rank = adjusted_time
        .iter()
        .map(|&t| grid.rank_of(t).ok_or(EstimationError::DimensionMismatch))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        grid,
        AdjustedOutcomes {
            time: adjusted_time,
            event: adjusted_event,
            rank,
        },
    ))
}

fn break_ties(time: &mut Array1<f64>, tau: f64) -> usize {
    let step = TIE_PERTURBATION * tau.abs().max(1.0);
    let mut shifted = 0usize;
    loop {
        let mut seen: HashMap<u64, usize> = HashMap::new();
        let mut changed = false;
        for t in time.iter_mut() {
            if *t >= tau {
                continue;
            }
            let key = (*t + 0.0).to_bits();
            let repeats = seen.entry(key).or_insert(0);
            if *repeats > 0 {
                *t = (*t + step * (*repeats as f64)).min(tau);
                shifted += 1;
                changed = true;
            }
            *repeats += 1;
        }
        if !changed {
            return shifted;
        }
    }
}
