#![deny(dead_code)]
#![deny(unused_imports)]

pub mod baseline;
pub mod clipping;
pub mod config;
pub mod counting;
pub mod crossfit;
pub mod data;
pub mod diagnostic;
pub mod estimate;
pub mod folds;
pub mod grid;
pub mod nuisance;
pub mod sample;
pub mod solver;
pub mod variance;

pub use config::{Augmentation, EstimatorConfig};
pub use estimate::{
    EstimationError, HazardRatioFit, estimate_hazard_ratio, estimate_hazard_ratio_with,
};
pub use sample::{Observation, Sample};
