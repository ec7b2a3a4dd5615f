use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// One subject as supplied by the caller.
#[derive(Debug, Clone)]
pub struct Observation {
    pub time: f64,
    pub event: u8,
    pub group: u8,
    pub covariates: Vec<f64>,
    /// Defaults to 1.0 when absent.
    pub weight: Option<f64>,
}

impl Observation {
    pub fn new(time: f64, event: u8, group: u8, covariates: Vec<f64>) -> Self {
        Self {
            time,
            event,
            group,
            covariates,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("sample is empty")]
    Empty,
    #[error("dimension mismatch across inputs")]
    DimensionMismatch,
    #[error("column {column} contains non-finite value {value} at row {row}")]
    NonFiniteValue {
        column: &'static str,
        row: usize,
        value: f64,
    },
    #[error("negative follow-up time {value} at row {row}")]
    NegativeTime { row: usize, value: f64 },
    #[error("invalid {column} flag {value} at row {row}; expected 0 or 1")]
    InvalidFlag {
        column: &'static str,
        row: usize,
        value: u8,
    },
    #[error("invalid weight {value} at row {row}; weights must be positive and finite")]
    InvalidWeight { row: usize, value: f64 },
}

/// Column-oriented view of all observations used for one estimation run.
///
/// Row `i` of every array refers to the same subject; `covariates` has shape
/// `[n, q]` and never contains the group indicator.
#[derive(Debug, Clone)]
pub struct Sample {
    time: Array1<f64>,
    event: Array1<u8>,
    group: Array1<u8>,
    covariates: Array2<f64>,
    weight: Array1<f64>,
}

impl Sample {
    pub fn new(
        time: Array1<f64>,
        event: Array1<u8>,
        group: Array1<u8>,
        covariates: Array2<f64>,
        weight: Option<Array1<f64>>,
    ) -> Result<Self, SampleError> {
        let n = time.len();
        let weight = weight.unwrap_or_else(|| Array1::ones(n));
        let sample = Self {
            time,
            event,
            group,
            covariates,
            weight,
        };
        sample.validate()?;
        Ok(sample)
    }

    pub fn from_observations(observations: &[Observation]) -> Result<Self, SampleError> {
        let n = observations.len();
        if n == 0 {
            return Err(SampleError::Empty);
        }
        let q = observations[0].covariates.len();
        let mut covariates = Array2::<f64>::zeros((n, q));
        for (i, obs) in observations.iter().enumerate() {
            if obs.covariates.len() != q {
                return Err(SampleError::DimensionMismatch);
            }
            for (j, &value) in obs.covariates.iter().enumerate() {
                covariates[[i, j]] = value;
            }
        }
        Self::new(
            observations.iter().map(|o| o.time).collect(),
            observations.iter().map(|o| o.event).collect(),
            observations.iter().map(|o| o.group).collect(),
            covariates,
            Some(
                observations
                    .iter()
                    .map(|o| o.weight.unwrap_or(1.0))
                    .collect(),
            ),
        )
    }

    fn validate(&self) -> Result<(), SampleError> {
        let n = self.time.len();
        if n == 0 {
            return Err(SampleError::Empty);
        }
        if self.event.len() != n
            || self.group.len() != n
            || self.weight.len() != n
            || self.covariates.nrows() != n
        {
            return Err(SampleError::DimensionMismatch);
        }
        for row in 0..n {
            let time = self.time[row];
            if !time.is_finite() {
                return Err(SampleError::NonFiniteValue {
                    column: "time",
                    row,
                    value: time,
                });
            }
            if time < 0.0 {
                return Err(SampleError::NegativeTime { row, value: time });
            }
            if self.event[row] > 1 {
                return Err(SampleError::InvalidFlag {
                    column: "event",
                    row,
                    value: self.event[row],
                });
            }
            if self.group[row] > 1 {
                return Err(SampleError::InvalidFlag {
                    column: "group",
                    row,
                    value: self.group[row],
                });
            }
            let weight = self.weight[row];
            if !(weight > 0.0) || !weight.is_finite() {
                return Err(SampleError::InvalidWeight { row, value: weight });
            }
            if let Some(&value) = self.covariates.row(row).iter().find(|v| !v.is_finite()) {
                return Err(SampleError::NonFiniteValue {
                    column: "covariate",
                    row,
                    value,
                });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    #[inline]
    pub fn num_covariates(&self) -> usize {
        self.covariates.ncols()
    }

    #[inline]
    pub fn time(&self) -> ArrayView1<'_, f64> {
        self.time.view()
    }

    #[inline]
    pub fn event(&self) -> ArrayView1<'_, u8> {
        self.event.view()
    }

    #[inline]
    pub fn group(&self) -> ArrayView1<'_, u8> {
        self.group.view()
    }

    #[inline]
    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    #[inline]
    pub fn weight(&self) -> ArrayView1<'_, f64> {
        self.weight.view()
    }

    pub fn total_weight(&self) -> f64 {
        self.weight.sum()
    }

    /// Rows selected by index, in the given order.
    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            time: self.time.select(Axis(0), rows),
            event: self.event.select(Axis(0), rows),
            group: self.group.select(Axis(0), rows),
            covariates: self.covariates.select(Axis(0), rows),
            weight: self.weight.select(Axis(0), rows),
        }
    }

    /// Same subjects with replaced follow-up columns (after horizon clipping).
    pub fn with_outcomes(&self, time: Array1<f64>, event: Array1<u8>) -> Self {
        debug_assert_eq!(time.len(), self.len());
        debug_assert_eq!(event.len(), self.len());
        Self {
            time,
            event,
            group: self.group.clone(),
            covariates: self.covariates.clone(),
            weight: self.weight.clone(),
        }
    }

    /// Same subjects with the event indicator replaced by the censoring
    /// indicator `(1 - event) * 1{time < tau}`, for fitting censoring models.
    pub fn censoring_outcome(&self, tau: f64) -> Self {
        let event = self
            .event
            .iter()
            .zip(self.time.iter())
            .map(|(&e, &t)| u8::from(e == 0 && t < tau))
            .collect();
        Self {
            time: self.time.clone(),
            event,
            group: self.group.clone(),
            covariates: self.covariates.clone(),
            weight: self.weight.clone(),
        }
    }

    pub fn num_events(&self) -> usize {
        self.event.iter().filter(|&&e| e == 1).count()
    }
}
