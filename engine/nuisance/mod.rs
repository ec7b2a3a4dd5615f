//! Nuisance-model strategies.
//!
//! The engine consumes three nuisance roles: the event-time survival model, the
//! censoring-time survival model and the propensity model. Each is a learner
//! (`fit`) producing a fitted model (`predict`). Survival models predict the
//! counterfactual curves `S(t | A = 0, Z)` and `S(t | A = 1, Z)` on the
//! canonical grid; propensity models predict `P(A = 1 | Z)`.
//!
//! Learners only see a `Sample` whose `event` column is already the indicator
//! of the target they model, so the same learner serves both survival roles.

pub mod cox;
pub mod kaplan_meier;
pub mod logistic;

use crate::estimate::EstimationError;
use crate::grid::TimeGrid;
use crate::sample::Sample;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use cox::CoxLearner;
pub use kaplan_meier::KaplanMeierLearner;
pub use logistic::{LogisticLearner, MarginalPropensityLearner};

#[derive(Debug, Error)]
pub enum NuisanceError {
    #[error("{model} fit failed: {reason}")]
    FitFailed { model: &'static str, reason: String },
    #[error("{model} linear solve failed: {source}")]
    LinearSolve {
        model: &'static str,
        #[source]
        source: ndarray_linalg::error::LinalgError,
    },
    #[error("{model} expects {expected} covariates, found {found}")]
    CovariateDimension {
        model: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{model} returned predictions of shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        model: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Counterfactual survival curves for a set of rows, shape `[rows, grid]` each.
#[derive(Debug, Clone)]
pub struct CounterfactualCurves {
    pub group0: Array2<f64>,
    pub group1: Array2<f64>,
}

impl CounterfactualCurves {
    pub fn ones(rows: usize, columns: usize) -> Self {
        Self {
            group0: Array2::ones((rows, columns)),
            group1: Array2::ones((rows, columns)),
        }
    }

    #[inline]
    pub fn curve(&self, group: usize) -> &Array2<f64> {
        if group == 0 { &self.group0 } else { &self.group1 }
    }

    #[inline]
    pub fn curve_mut(&mut self, group: usize) -> &mut Array2<f64> {
        if group == 0 {
            &mut self.group0
        } else {
            &mut self.group1
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.group0.dim()
    }
}

pub trait SurvivalLearner: Send + Sync {
    fn name(&self) -> &str;
    fn fit(&self, training: &Sample) -> Result<Box<dyn SurvivalModel>, NuisanceError>;
}

pub trait SurvivalModel: Send + Sync {
    fn predict_survival(
        &self,
        rows: &Sample,
        grid: &TimeGrid,
    ) -> Result<CounterfactualCurves, NuisanceError>;
}

pub trait PropensityLearner: Send + Sync {
    fn name(&self) -> &str;
    fn fit(&self, training: &Sample) -> Result<Box<dyn PropensityModel>, NuisanceError>;
}

pub trait PropensityModel: Send + Sync {
    fn predict_propensity(&self, rows: &Sample) -> Result<Array1<f64>, NuisanceError>;
}

/// Built-in survival strategies, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SurvivalModelKind {
    Cox,
    KaplanMeier,
}

impl FromStr for SurvivalModelKind {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cox" | "coxph" => Ok(Self::Cox),
            "km" | "kaplan-meier" | "kaplan_meier" => Ok(Self::KaplanMeier),
            other => Err(EstimationError::InvalidConfig(format!(
                "unsupported survival nuisance model '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SurvivalModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cox => write!(f, "Cox"),
            Self::KaplanMeier => write!(f, "KM"),
        }
    }
}

impl TryFrom<String> for SurvivalModelKind {
    type Error = EstimationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SurvivalModelKind> for String {
    fn from(value: SurvivalModelKind) -> Self {
        value.to_string()
    }
}

/// Built-in propensity strategies, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PropensityModelKind {
    Logit,
    Marginal,
}

impl FromStr for PropensityModelKind {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logit" | "logistic" => Ok(Self::Logit),
            "marginal" | "constant" => Ok(Self::Marginal),
            other => Err(EstimationError::InvalidConfig(format!(
                "unsupported propensity nuisance model '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PropensityModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logit => write!(f, "logit"),
            Self::Marginal => write!(f, "marginal"),
        }
    }
}

impl TryFrom<String> for PropensityModelKind {
    type Error = EstimationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PropensityModelKind> for String {
    fn from(value: PropensityModelKind) -> Self {
        value.to_string()
    }
}

fn survival_learner(kind: SurvivalModelKind) -> Box<dyn SurvivalLearner> {
    match kind {
        SurvivalModelKind::Cox => Box::new(CoxLearner::default()),
        SurvivalModelKind::KaplanMeier => Box::new(KaplanMeierLearner),
    }
}

fn propensity_learner(kind: PropensityModelKind) -> Box<dyn PropensityLearner> {
    match kind {
        PropensityModelKind::Logit => Box::new(LogisticLearner::default()),
        PropensityModelKind::Marginal => Box::new(MarginalPropensityLearner),
    }
}

/// The three nuisance strategies used by one estimation run.
pub struct Nuisances {
    pub event: Box<dyn SurvivalLearner>,
    pub censoring: Box<dyn SurvivalLearner>,
    pub propensity: Box<dyn PropensityLearner>,
}

impl Nuisances {
    pub fn from_kinds(
        event: SurvivalModelKind,
        censoring: SurvivalModelKind,
        propensity: PropensityModelKind,
    ) -> Self {
        Self {
            event: survival_learner(event),
            censoring: survival_learner(censoring),
            propensity: propensity_learner(propensity),
        }
    }

    pub fn custom(
        event: Box<dyn SurvivalLearner>,
        censoring: Box<dyn SurvivalLearner>,
        propensity: Box<dyn PropensityLearner>,
    ) -> Self {
        Self {
            event,
            censoring,
            propensity,
        }
    }
}

/// Design row `[group, covariates...]` used by the regression-type learners.
pub(crate) fn design_with_group(rows: &Sample, group: Option<u8>) -> Array2<f64> {
    let n = rows.len();
    let q = rows.num_covariates();
    let covariates = rows.covariates();
    let groups = rows.group();
    Array2::from_shape_fn((n, q + 1), |(i, j)| {
        if j == 0 {
            f64::from(group.unwrap_or(groups[i]))
        } else {
            covariates[[i, j - 1]]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_parse_case_insensitively() {
        assert_eq!("Cox".parse::<SurvivalModelKind>().unwrap(), SurvivalModelKind::Cox);
        assert_eq!("coxph".parse::<SurvivalModelKind>().unwrap(), SurvivalModelKind::Cox);
        assert_eq!(
            "KM".parse::<SurvivalModelKind>().unwrap(),
            SurvivalModelKind::KaplanMeier
        );
        assert_eq!(
            "Logit".parse::<PropensityModelKind>().unwrap(),
            PropensityModelKind::Logit
        );
    }

    #[test]
    fn unsupported_model_names_are_config_errors() {
        for name in ["rsf", "spline", "gbm"] {
            assert!(matches!(
                name.parse::<SurvivalModelKind>(),
                Err(EstimationError::InvalidConfig(_))
            ));
        }
        assert!(matches!(
            "rf".parse::<PropensityModelKind>(),
            Err(EstimationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn learners_report_their_names() {
        let nuisances = Nuisances::from_kinds(
            SurvivalModelKind::Cox,
            SurvivalModelKind::KaplanMeier,
            PropensityModelKind::Marginal,
        );
        assert_eq!(nuisances.event.name(), "Cox");
        assert_eq!(nuisances.censoring.name(), "KM");
        assert_eq!(nuisances.propensity.name(), "marginal");
    }
}
