use crate::estimate::EstimationError;
use crate::nuisance::{PropensityModelKind, SurvivalModelKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Which augmentation terms enter the estimating equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Augmentation {
    /// Observational data with informative censoring: propensity and
    /// censoring augmentation.
    Aiptcw,
    /// Observational data with non-informative censoring: the censoring
    /// curves are fixed at 1 and only the propensity augmentation remains.
    Aiptw,
    /// Randomised groups with informative censoring: censoring augmentation
    /// only, each subject contributes to its own arm.
    Aipcw,
}

impl Augmentation {
    /// Whether a censoring model is fitted and its martingale used.
    #[inline]
    pub fn uses_censoring_model(self) -> bool {
        !matches!(self, Self::Aiptw)
    }
}

impl FromStr for Augmentation {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AIPTCW" => Ok(Self::Aiptcw),
            "AIPTW" => Ok(Self::Aiptw),
            "AIPCW" => Ok(Self::Aipcw),
            other => Err(EstimationError::InvalidConfig(format!(
                "augmentation must be one of AIPTCW, AIPTW, AIPCW; got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Augmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aiptcw => "AIPTCW",
            Self::Aiptw => "AIPTW",
            Self::Aipcw => "AIPCW",
        };
        f.write_str(name)
    }
}

impl TryFrom<String> for Augmentation {
    type Error = EstimationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Augmentation> for String {
    fn from(value: Augmentation) -> Self {
        value.to_string()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Options for one estimation run. Serialised as TOML; missing keys take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub event_model: SurvivalModelKind,
    pub censoring_model: SurvivalModelKind,
    pub propensity_model: PropensityModelKind,
    /// Study horizon; the largest observed time when absent.
    pub tau: Option<f64>,
    pub folds: usize,
    pub beta0: f64,
    pub min_survival: f64,
    pub min_propensity: f64,
    pub augmentation: Augmentation,
    pub cross_fit: bool,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            event_model: SurvivalModelKind::Cox,
            censoring_model: SurvivalModelKind::Cox,
            propensity_model: PropensityModelKind::Logit,
            tau: None,
            folds: 5,
            beta0: 0.0,
            min_survival: 0.05,
            min_propensity: 0.1,
            augmentation: Augmentation::Aiptcw,
            cross_fit: true,
            max_iterations: 50,
            tolerance: 1e-9,
        }
    }
}

impl EstimatorConfig {
    /// Checks option ranges against a sample of `n` observations.
    pub fn validate(&self, n: usize) -> Result<(), EstimationError> {
        if self.folds < 1 || self.folds > n {
            return Err(EstimationError::InvalidConfig(format!(
                "fold count k = {} must lie in [1, {n}]",
                self.folds
            )));
        }
        if let Some(tau) = self.tau {
            if !tau.is_finite() || tau <= 0.0 {
                return Err(EstimationError::InvalidConfig(format!(
                    "horizon tau must be positive and finite, got {tau}"
                )));
            }
        }
        if !(self.min_survival > 0.0 && self.min_survival < 1.0) {
            return Err(EstimationError::InvalidConfig(format!(
                "min_survival must lie in (0, 1), got {}",
                self.min_survival
            )));
        }
        if !(self.min_propensity > 0.0 && self.min_propensity < 0.5) {
            return Err(EstimationError::InvalidConfig(format!(
                "min_propensity must lie in (0, 0.5), got {}",
                self.min_propensity
            )));
        }
        if !self.beta0.is_finite() {
            return Err(EstimationError::InvalidConfig(format!(
                "beta0 must be finite, got {}",
                self.beta0
            )));
        }
        if self.max_iterations == 0 || !(self.tolerance > 0.0) {
            return Err(EstimationError::InvalidConfig(
                "max_iterations must be positive and tolerance must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_fills_defaults() {
        let config = EstimatorConfig::from_toml_str(
            r#"
            event_model = "coxph"
            propensity_model = "marginal"
            augmentation = "aipcw"
            tau = 12.5
            cross_fit = false
            "#,
        )
        .expect("config");
        assert_eq!(config.event_model, SurvivalModelKind::Cox);
        assert_eq!(config.propensity_model, PropensityModelKind::Marginal);
        assert_eq!(config.augmentation, Augmentation::Aipcw);
        assert_eq!(config.tau, Some(12.5));
        assert!(!config.cross_fit);
        assert_eq!(config.folds, 5);
        assert_eq!(config.min_survival, 0.05);
        assert_eq!(config.min_propensity, 0.1);
    }

    #[test]
    fn unknown_model_name_is_rejected() {
        let err = EstimatorConfig::from_toml_str(r#"event_model = "rsf""#).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
        assert!(matches!(
            "IPW".parse::<Augmentation>(),
            Err(EstimationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn save_and_load_agree() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let config = EstimatorConfig {
            tau: Some(3.0),
            folds: 2,
            augmentation: Augmentation::Aiptw,
            ..EstimatorConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(EstimatorConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn validation_bounds() {
        let config = EstimatorConfig::default();
        assert!(config.validate(10).is_ok());
        assert!(config.validate(4).is_err());
        let config = EstimatorConfig {
            min_propensity: 0.5,
            ..EstimatorConfig::default()
        };
        assert!(matches!(
            config.validate(10),
            Err(EstimationError::InvalidConfig(_))
        ));
    }
}
