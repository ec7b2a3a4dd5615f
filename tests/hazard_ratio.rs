mod common;

use approx::assert_abs_diff_eq;
use common::simulate_cohort;
use drcox::grid::TimeGrid;
use drcox::nuisance::{
    CounterfactualCurves, NuisanceError, Nuisances, PropensityLearner, PropensityModel,
    PropensityModelKind, SurvivalLearner, SurvivalModel, SurvivalModelKind,
};
use drcox::{
    Augmentation, EstimationError, EstimatorConfig, Sample, estimate_hazard_ratio,
    estimate_hazard_ratio_with,
};
use ndarray::{Array1, Array2, array};

fn reweighted(sample: &Sample, weight: f64) -> Sample {
    Sample::new(
        sample.time().to_owned(),
        sample.event().to_owned(),
        sample.group().to_owned(),
        sample.covariates().to_owned(),
        Some(Array1::from_elem(sample.len(), weight)),
    )
    .expect("reweighted sample")
}

#[test]
fn survival_curves_are_monotone_probabilities() {
    let sample = simulate_cohort(300, 11, 0.4, 0.5);
    let fit = estimate_hazard_ratio(&sample, &EstimatorConfig::default()).expect("fit");
    assert_eq!(fit.time_grid.len(), fit.baseline_cum_hazard.len());
    for curve in [&fit.survival_group0, &fit.survival_group1] {
        assert!(curve.iter().all(|&s| s > 0.0 && s <= 1.0));
        for w in curve.windows(2) {
            assert!(w[1] <= w[0]);
        }
    }
    let tilt = fit.beta.exp();
    for (s0, s1) in fit.survival_group0.iter().zip(fit.survival_group1.iter()) {
        assert_abs_diff_eq!(*s1, s0.powf(tilt), epsilon = 1e-10);
    }
    assert!(fit.model_se.is_finite() && fit.model_se > 0.0);
    let diagnostic = &fit.beta_t;
    assert_eq!(diagnostic.time.len(), diagnostic.value.len());
    assert!(!diagnostic.is_empty());
    let mean = diagnostic.value.iter().sum::<f64>() / diagnostic.len() as f64;
    assert_abs_diff_eq!(mean, fit.beta, epsilon = 1e-9);
}

#[test]
fn uniform_weight_scaling_changes_nothing() {
    let sample = simulate_cohort(200, 5, -0.3, 0.8);
    let config = EstimatorConfig {
        folds: 4,
        ..EstimatorConfig::default()
    };
    let base = estimate_hazard_ratio(&reweighted(&sample, 1.0), &config).expect("fit");
    let scaled = estimate_hazard_ratio(&reweighted(&sample, 4.0), &config).expect("fit");
    assert_abs_diff_eq!(base.beta, scaled.beta, epsilon = 1e-8);
    assert_abs_diff_eq!(base.model_se, scaled.model_se, epsilon = 1e-8);
    for (a, b) in base
        .baseline_cum_hazard
        .iter()
        .zip(scaled.baseline_cum_hazard.iter())
    {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
    }
}

#[test]
fn repeated_runs_are_identical() {
    let sample = simulate_cohort(150, 3, 0.2, 0.3);
    for cross_fit in [false, true] {
        let config = EstimatorConfig {
            cross_fit,
            folds: 3,
            ..EstimatorConfig::default()
        };
        let first = estimate_hazard_ratio(&sample, &config).expect("fit");
        let second = estimate_hazard_ratio(&sample, &config).expect("fit");
        assert_eq!(first.beta.to_bits(), second.beta.to_bits());
        assert_eq!(first.model_se.to_bits(), second.model_se.to_bits());
        assert_eq!(first.baseline_cum_hazard, second.baseline_cum_hazard);
        assert_eq!(first.beta_t, second.beta_t);
    }
}

#[test]
fn horizon_recensors_later_follow_up() {
    let sample = simulate_cohort(200, 17, 0.5, 0.0);
    let tau = 8.0;
    let config = EstimatorConfig {
        tau: Some(tau),
        augmentation: Augmentation::Aipcw,
        propensity_model: PropensityModelKind::Marginal,
        ..EstimatorConfig::default()
    };
    let fit = estimate_hazard_ratio(&sample, &config).expect("fit");
    assert!(fit.time_grid.iter().all(|&t| t <= tau));
    assert_eq!(fit.time_grid[fit.time_grid.len() - 1], tau);

    // Clipping by hand gives the same sample, with many rows tied at tau.
    let clipped_time = sample.time().mapv(|t| t.min(tau));
    let clipped_event = Array1::from_iter(
        sample
            .event()
            .iter()
            .zip(sample.time().iter())
            .map(|(&e, &t)| if t > tau { 0 } else { e }),
    );
    assert!(clipped_time.iter().filter(|&&t| t == tau).count() > 1);
    let clipped = Sample::new(
        clipped_time,
        clipped_event,
        sample.group().to_owned(),
        sample.covariates().to_owned(),
        None,
    )
    .expect("clipped sample");
    let by_hand = estimate_hazard_ratio(&clipped, &config).expect("fit");
    assert_eq!(fit.beta.to_bits(), by_hand.beta.to_bits());
    assert_eq!(fit.time_grid, by_hand.time_grid);
}

#[test]
fn four_subjects_without_cross_fitting() {
    let sample = Sample::new(
        array![1.0, 2.0, 3.0, 4.0],
        array![1, 1, 0, 1],
        array![0, 1, 0, 1],
        Array2::zeros((4, 1)),
        None,
    )
    .expect("sample");
    let config = EstimatorConfig {
        event_model: SurvivalModelKind::Cox,
        censoring_model: SurvivalModelKind::Cox,
        propensity_model: PropensityModelKind::Logit,
        tau: Some(4.0),
        folds: 2,
        augmentation: Augmentation::Aiptcw,
        cross_fit: false,
        ..EstimatorConfig::default()
    };
    let fit = estimate_hazard_ratio(&sample, &config).expect("fit");
    assert_eq!(fit.time_grid.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(fit.baseline_cum_hazard.len(), 4);
    for w in fit.baseline_cum_hazard.windows(2) {
        assert!(w[1] >= w[0]);
    }
    assert!(fit.beta.is_finite());
    // Without covariate signal the augmented root stays near the Cox estimate.
    assert!((fit.beta + 2.0f64.ln() / 2.0).abs() < 0.1, "beta = {}", fit.beta);
}

#[test]
fn unsupported_nuisance_name_is_invalid_config() {
    let err = EstimatorConfig::from_toml_str(r#"event_model = "spline""#).unwrap_err();
    assert!(err.to_string().contains("unsupported survival nuisance model"));
    assert!(matches!(
        "rf".parse::<PropensityModelKind>(),
        Err(EstimationError::InvalidConfig(_))
    ));
}

#[test]
fn fold_without_censoring_is_degenerate() {
    let sample = Sample::new(
        array![1.0, 2.0, 3.0, 4.0],
        array![0, 0, 1, 1],
        array![0, 1, 0, 1],
        Array2::zeros((4, 0)),
        None,
    )
    .expect("sample");
    let config = EstimatorConfig {
        folds: 2,
        event_model: SurvivalModelKind::KaplanMeier,
        censoring_model: SurvivalModelKind::KaplanMeier,
        propensity_model: PropensityModelKind::Marginal,
        ..EstimatorConfig::default()
    };
    assert!(matches!(
        estimate_hazard_ratio(&sample, &config),
        Err(EstimationError::DegenerateFold { .. })
    ));
}

/// Exponential model with the simulation's true parameters.
struct OracleSurvival {
    rate: f64,
    beta: f64,
    z_effect: f64,
}

impl SurvivalLearner for OracleSurvival {
    fn name(&self) -> &str {
        "oracle"
    }

    fn fit(&self, _training: &Sample) -> Result<Box<dyn SurvivalModel>, NuisanceError> {
        Ok(Box::new(OracleSurvival {
            rate: self.rate,
            beta: self.beta,
            z_effect: self.z_effect,
        }))
    }
}

impl SurvivalModel for OracleSurvival {
    fn predict_survival(
        &self,
        rows: &Sample,
        grid: &TimeGrid,
    ) -> Result<CounterfactualCurves, NuisanceError> {
        let z = rows.covariates();
        let times = grid.times();
        let curve = |group: f64| {
            Array2::from_shape_fn((rows.len(), grid.len()), |(i, j)| {
                let hazard = self.rate * (self.beta * group + self.z_effect * z[[i, 0]]).exp();
                (-hazard * times[j]).exp()
            })
        };
        Ok(CounterfactualCurves {
            group0: curve(0.0),
            group1: curve(1.0),
        })
    }
}

struct OraclePropensity {
    confounding: f64,
}

impl PropensityLearner for OraclePropensity {
    fn name(&self) -> &str {
        "oracle"
    }

    fn fit(&self, _training: &Sample) -> Result<Box<dyn PropensityModel>, NuisanceError> {
        Ok(Box::new(OraclePropensity {
            confounding: self.confounding,
        }))
    }
}

impl PropensityModel for OraclePropensity {
    fn predict_propensity(&self, rows: &Sample) -> Result<Array1<f64>, NuisanceError> {
        Ok(rows
            .covariates()
            .column(0)
            .mapv(|z| 1.0 / (1.0 + (-self.confounding * z).exp())))
    }
}

#[test]
fn custom_oracle_learners_recover_the_effect() {
    let sample = simulate_cohort(400, 23, 0.5, 0.7);
    let nuisances = Nuisances::custom(
        Box::new(OracleSurvival {
            rate: 0.1,
            beta: 0.5,
            z_effect: 0.5,
        }),
        Box::new(OracleSurvival {
            rate: 0.05,
            beta: 0.0,
            z_effect: 0.0,
        }),
        Box::new(OraclePropensity { confounding: 0.7 }),
    );
    let fit = estimate_hazard_ratio_with(&sample, &EstimatorConfig::default(), &nuisances)
        .expect("fit");
    assert!(fit.beta.is_finite());
    assert!((fit.beta - 0.5).abs() < 0.5, "beta = {}", fit.beta);
    let (lo, hi) = fit.confidence_interval(1.96);
    assert!(lo < fit.beta && fit.beta < hi);
}

#[test]
fn default_cross_fit_converges_within_the_iteration_limit() {
    let sample = simulate_cohort(300, 11, 0.4, 0.5);
    let config = EstimatorConfig::default();
    let fit = estimate_hazard_ratio(&sample, &config).expect("fit");
    assert!(fit.beta.is_finite());
    assert!(fit.iterations < config.max_iterations);
    assert!((fit.beta - 0.4).abs() < 1.0, "beta = {}", fit.beta);
}

#[test]
fn default_cross_fit_converges_across_seeds() {
    let config = EstimatorConfig::default();
    for seed in 0..20 {
        let sample = simulate_cohort(300, 100 + seed, 0.4, 0.5);
        match estimate_hazard_ratio(&sample, &config) {
            Ok(fit) => {
                assert!(fit.beta.is_finite(), "seed {seed}: beta = {}", fit.beta);
                assert!(
                    fit.model_se.is_finite() && fit.model_se > 0.0,
                    "seed {seed}: se = {}",
                    fit.model_se
                );
            }
            Err(err) => panic!("seed {seed}: {err}"),
        }
    }
}
