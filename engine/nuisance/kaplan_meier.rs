use super::{CounterfactualCurves, NuisanceError, SurvivalLearner, SurvivalModel};
use crate::grid::TimeGrid;
use crate::sample::Sample;
use ndarray::{Array1, Array2};

/// Weighted Kaplan–Meier curve per group; covariates are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct KaplanMeierLearner;

#[derive(Debug, Clone)]
struct GroupCurve {
    /// Distinct event times with the product-limit estimate just after each.
    steps: Vec<(f64, f64)>,
    observed: bool,
}

impl GroupCurve {
    fn fit(training: &Sample, group: u8) -> Self {
        let mut rows: Vec<usize> = (0..training.len())
            .filter(|&i| training.group()[i] == group)
            .collect();
        if rows.is_empty() {
            return Self {
                steps: Vec::new(),
                observed: false,
            };
        }
        let time = training.time();
        let event = training.event();
        let weight = training.weight();
        rows.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

        let mut at_risk: f64 = rows.iter().map(|&i| weight[i]).sum();
        let mut survival = 1.0;
        let mut steps = Vec::new();
        let mut start = 0usize;
        while start < rows.len() {
            let t = time[rows[start]];
            let mut end = start;
            let mut deaths = 0.0;
            let mut leaving = 0.0;
            while end < rows.len() && time[rows[end]] == t {
                let i = rows[end];
                if event[i] == 1 {
                    deaths += weight[i];
                }
                leaving += weight[i];
                end += 1;
            }
            if deaths > 0.0 {
                survival *= 1.0 - deaths / at_risk;
                steps.push((t, survival));
            }
            at_risk -= leaving;
            start = end;
        }
        Self {
            steps,
            observed: true,
        }
    }

    /// Curve on the grid; a group absent from training gives unknown (NaN) cells.
    fn on_grid(&self, grid: &TimeGrid) -> Array1<f64> {
        if !self.observed {
            return Array1::from_elem(grid.len(), f64::NAN);
        }
        let mut k = 0usize;
        let mut current = 1.0;
        grid.times()
            .iter()
            .map(|&t| {
                while k < self.steps.len() && self.steps[k].0 <= t {
                    current = self.steps[k].1;
                    k += 1;
                }
                current
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct KaplanMeierFit {
    curves: [GroupCurve; 2],
}

impl SurvivalLearner for KaplanMeierLearner {
    fn name(&self) -> &str {
        "KM"
    }

    fn fit(&self, training: &Sample) -> Result<Box<dyn SurvivalModel>, NuisanceError> {
        if training.num_events() == 0 {
            return Err(NuisanceError::FitFailed {
                model: "KM",
                reason: "training rows contain no events".to_string(),
            });
        }
        Ok(Box::new(KaplanMeierFit {
            curves: [GroupCurve::fit(training, 0), GroupCurve::fit(training, 1)],
        }))
    }
}

impl SurvivalModel for KaplanMeierFit {
    fn predict_survival(
        &self,
        rows: &Sample,
        grid: &TimeGrid,
    ) -> Result<CounterfactualCurves, NuisanceError> {
        let n = rows.len();
        let broadcast = |curve: &GroupCurve| -> Array2<f64> {
            let values = curve.on_grid(grid);
            Array2::from_shape_fn((n, grid.len()), |(_, j)| values[j])
        };
        Ok(CounterfactualCurves {
            group0: broadcast(&self.curves[0]),
            group1: broadcast(&self.curves[1]),
        })
    }
}
