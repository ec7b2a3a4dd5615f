use crate::estimate::EstimationError;
use crate::folds::FoldAssignment;
use crate::grid::TimeGrid;
use crate::nuisance::{CounterfactualCurves, NuisanceError, Nuisances};
use crate::sample::Sample;
use ndarray::{Array1, Array2};
use rayon::prelude::*;

/// Full-sample nuisance predictions, one row per observation in original order.
#[derive(Debug, Clone)]
pub struct NuisancePredictions {
    /// Event-time survival `S_T(t | A = a, Z_i)`, shape `[n, grid]` per group.
    pub event: CounterfactualCurves,
    /// Censoring-time survival `S_C(t | A = a, Z_i)`, shape `[n, grid]` per group.
    pub censoring: CounterfactualCurves,
    /// `P(A = 1 | Z_i)`, length `n`.
    pub propensity: Array1<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CrossFitPlan {
    pub cross_fit: bool,
    /// The censoring learner is skipped (curves fixed at 1) when false.
    pub fit_censoring: bool,
}

/// Predictions for the held-out rows of one fold.
#[derive(Debug)]
struct FoldPrediction {
    rows: Vec<usize>,
    event: CounterfactualCurves,
    censoring: CounterfactualCurves,
    propensity: Array1<f64>,
}

fn check_curves(
    curves: &CounterfactualCurves,
    model: &str,
    expected: (usize, usize),
) -> Result<(), NuisanceError> {
    if curves.group0.dim() != expected || curves.group1.dim() != expected {
        let found = if curves.group0.dim() != expected {
            curves.group0.dim()
        } else {
            curves.group1.dim()
        };
        return Err(NuisanceError::ShapeMismatch {
            model: model.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn fit_fold(
    sample: &Sample,
    grid: &TimeGrid,
    folds: &FoldAssignment,
    nuisances: &Nuisances,
    plan: CrossFitPlan,
    fold: usize,
) -> Result<FoldPrediction, EstimationError> {
    let rows = folds.members(fold);
    let training_rows = if plan.cross_fit {
        folds.complement(fold)
    } else {
        rows.clone()
    };
    let training = sample.subset(&training_rows);
    let held_out = sample.subset(&rows);
    let expected = (rows.len(), grid.len());

    if training.num_events() == 0 {
        return Err(EstimationError::DegenerateFold {
            fold,
            kind: "event",
        });
    }
    let event_model = nuisances.event.fit(&training)?;
    let event = event_model.predict_survival(&held_out, grid)?;
    check_curves(&event, nuisances.event.name(), expected)?;

    let censoring = if plan.fit_censoring {
        let censoring_training = training.censoring_outcome(grid.tau());
        if censoring_training.num_events() == 0 {
            return Err(EstimationError::DegenerateFold {
                fold,
                kind: "censoring",
            });
        }
        let censoring_model = nuisances.censoring.fit(&censoring_training)?;
        let curves = censoring_model.predict_survival(&held_out, grid)?;
        check_curves(&curves, nuisances.censoring.name(), expected)?;
        curves
    } else {
        CounterfactualCurves::ones(rows.len(), grid.len())
    };

    let propensity_model = nuisances.propensity.fit(&training)?;
    let propensity = propensity_model.predict_propensity(&held_out)?;
    if propensity.len() != rows.len() {
        return Err(NuisanceError::ShapeMismatch {
            model: nuisances.propensity.name().to_string(),
            expected: (rows.len(), 1),
            found: (propensity.len(), 1),
        }
        .into());
    }

    log::debug!(
        "Fold {fold}: trained on {} rows, predicted {} rows",
        training_rows.len(),
        rows.len()
    );
    Ok(FoldPrediction {
        rows,
        event,
        censoring,
        propensity,
    })
}

/// Fits every nuisance learner per fold and assembles full-sample predictions.
///
/// With cross-fitting each fold is predicted by models trained on the other
/// folds; without it a single model per role is trained and evaluated on the
/// full sample. Folds are processed in parallel and merged afterwards.
pub fn cross_fit(
    sample: &Sample,
    grid: &TimeGrid,
    folds: &FoldAssignment,
    nuisances: &Nuisances,
    plan: CrossFitPlan,
) -> Result<NuisancePredictions, EstimationError> {
    if folds.len() != sample.len() {
        return Err(EstimationError::DimensionMismatch);
    }
    let parts = (0..folds.num_folds())
        .into_par_iter()
        .map(|fold| fit_fold(sample, grid, folds, nuisances, plan, fold))
        .collect::<Result<Vec<_>, _>>()?;

    let n = sample.len();
    let m = grid.len();
    let mut event = CounterfactualCurves {
        group0: Array2::zeros((n, m)),
        group1: Array2::zeros((n, m)),
    };
    let mut censoring = event.clone();
    let mut propensity = Array1::<f64>::zeros(n);
    for part in parts {
        for (local, &row) in part.rows.iter().enumerate() {
            for group in 0..2 {
                event
                    .curve_mut(group)
                    .row_mut(row)
                    .assign(&part.event.curve(group).row(local));
                censoring
                    .curve_mut(group)
                    .row_mut(row)
                    .assign(&part.censoring.curve(group).row(local));
            }
            propensity[row] = part.propensity[local];
        }
    }

    Ok(NuisancePredictions {
        event,
        censoring,
        propensity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::build_time_grid;
    use crate::nuisance::{
        PropensityLearner, PropensityModel, PropensityModelKind, SurvivalLearner, SurvivalModel,
        SurvivalModelKind,
    };
    use ndarray::array;

    /// Survival learner whose predictions encode the training-set size.
    struct CountingLearner;

    struct CountingModel {
        training_rows: usize,
    }

    impl SurvivalLearner for CountingLearner {
        fn name(&self) -> &str {
            "counting"
        }

        fn fit(&self, training: &Sample) -> Result<Box<dyn SurvivalModel>, NuisanceError> {
            Ok(Box::new(CountingModel {
                training_rows: training.len(),
            }))
        }
    }

    impl SurvivalModel for CountingModel {
        fn predict_survival(
            &self,
            rows: &Sample,
            grid: &TimeGrid,
        ) -> Result<CounterfactualCurves, NuisanceError> {
            let value = 1.0 / (1.0 + self.training_rows as f64);
            Ok(CounterfactualCurves {
                group0: Array2::from_elem((rows.len(), grid.len()), value),
                group1: Array2::from_elem((rows.len(), grid.len()), value),
            })
        }
    }

    struct HalfPropensity;

    struct HalfModel;

    impl PropensityLearner for HalfPropensity {
        fn name(&self) -> &str {
            "half"
        }

        fn fit(&self, _training: &Sample) -> Result<Box<dyn PropensityModel>, NuisanceError> {
            Ok(Box::new(HalfModel))
        }
    }

    impl PropensityModel for HalfModel {
        fn predict_propensity(&self, rows: &Sample) -> Result<Array1<f64>, NuisanceError> {
            Ok(Array1::from_elem(rows.len(), 0.5))
        }
    }

    fn sample() -> Sample {
        Sample::new(
            array![1.0, 2.0, 3.0, 4.0, 5.0],
            array![1, 0, 1, 0, 1],
            array![0, 1, 0, 1, 1],
            Array2::zeros((5, 1)),
            None,
        )
        .expect("sample")
    }

    #[test]
    fn held_out_rows_use_complement_models() {
        let sample = sample();
        let (grid, _) = build_time_grid(sample.time(), sample.event(), None).expect("grid");
        let folds = FoldAssignment::contiguous(5, 2).expect("folds");
        let nuisances = Nuisances::custom(
            Box::new(CountingLearner),
            Box::new(CountingLearner),
            Box::new(HalfPropensity),
        );
        let plan = CrossFitPlan {
            cross_fit: true,
            fit_censoring: true,
        };
        let predictions = cross_fit(&sample, &grid, &folds, &nuisances, plan).expect("cross fit");
        // Fold 0 holds rows 0..3 and is trained on the 2 remaining rows.
        assert_eq!(predictions.event.group0[[0, 0]], 1.0 / 3.0);
        assert_eq!(predictions.event.group1[[2, 4]], 1.0 / 3.0);
        // Fold 1 holds rows 3..5 and is trained on 3 rows.
        assert_eq!(predictions.event.group0[[4, 0]], 1.0 / 4.0);
        assert_eq!(predictions.censoring.group0[[3, 1]], 1.0 / 4.0);
        assert!(predictions.propensity.iter().all(|&p| p == 0.5));
    }

    #[test]
    fn no_cross_fit_trains_on_everything() {
        let sample = sample();
        let (grid, _) = build_time_grid(sample.time(), sample.event(), None).expect("grid");
        let folds = FoldAssignment::single(5);
        let nuisances = Nuisances::custom(
            Box::new(CountingLearner),
            Box::new(CountingLearner),
            Box::new(HalfPropensity),
        );
        let plan = CrossFitPlan {
            cross_fit: false,
            fit_censoring: false,
        };
        let predictions = cross_fit(&sample, &grid, &folds, &nuisances, plan).expect("fit");
        assert!(predictions.event.group0.iter().all(|&v| v == 1.0 / 6.0));
        assert!(predictions.censoring.group1.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn fold_without_training_events_is_degenerate() {
        let sample = Sample::new(
            array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            array![1, 0, 1, 0, 0, 0],
            array![0, 1, 0, 1, 0, 1],
            Array2::zeros((6, 0)),
            None,
        )
        .expect("sample");
        let (grid, _) = build_time_grid(sample.time(), sample.event(), None).expect("grid");
        // Fold 0 is trained on rows 3..6, none of which has an event.
        let folds = FoldAssignment::contiguous(6, 2).expect("folds");
        let nuisances = Nuisances::from_kinds(
            SurvivalModelKind::KaplanMeier,
            SurvivalModelKind::KaplanMeier,
            PropensityModelKind::Marginal,
        );
        let plan = CrossFitPlan {
            cross_fit: true,
            fit_censoring: true,
        };
        let err = cross_fit(&sample, &grid, &folds, &nuisances, plan).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::DegenerateFold {
                fold: 0,
                kind: "event"
            }
        ));
    }
}
