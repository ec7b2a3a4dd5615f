//! Tab-separated input and output.
//!
//! Input files carry a header row with the required columns `time`, `event`
//! and `group`, an optional `weight` column, and any number of further numeric
//! columns that are used as covariates in file order.

use crate::diagnostic::TimeVaryingBeta;
use crate::estimate::HazardRatioFit;
use crate::sample::{Sample, SampleError};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::{Array1, Array2};
use std::path::Path;
use thiserror::Error;

const TIME_COLUMN: &str = "time";
const EVENT_COLUMN: &str = "event";
const GROUP_COLUMN: &str = "group";
const WEIGHT_COLUMN: &str = "weight";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the CSV reader or writer: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Row {row}, column '{column}': could not parse '{value}' as a number.")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Row {row}, column '{column}': expected 0 or 1, found {value}.")]
    InvalidIndicator {
        row: usize,
        column: String,
        value: f64,
    },
    #[error("Input file contains no data rows.")]
    NoRows,
    #[error(transparent)]
    Sample(#[from] SampleError),
}

/// Header layout of an input file.
#[derive(Debug)]
struct Layout {
    time: usize,
    event: usize,
    group: usize,
    weight: Option<usize>,
    covariates: Vec<usize>,
    names: Vec<String>,
}

impl Layout {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, DataError> {
        let names: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
        let find = |column: &str| -> Result<usize, DataError> {
            names
                .iter()
                .position(|name| name == column)
                .ok_or_else(|| DataError::ColumnNotFound(column.to_string()))
        };
        let time = find(TIME_COLUMN)?;
        let event = find(EVENT_COLUMN)?;
        let group = find(GROUP_COLUMN)?;
        let weight = names.iter().position(|name| name == WEIGHT_COLUMN);
        let covariates = (0..names.len())
            .filter(|&j| j != time && j != event && j != group && Some(j) != weight)
            .collect();
        Ok(Self {
            time,
            event,
            group,
            weight,
            covariates,
            names,
        })
    }
}

fn parse_field(
    record: &csv::StringRecord,
    row: usize,
    column: usize,
    names: &[String],
) -> Result<f64, DataError> {
    let raw = record.get(column).unwrap_or("").trim();
    raw.parse::<f64>().map_err(|_| DataError::InvalidValue {
        row,
        column: names[column].clone(),
        value: raw.to_string(),
    })
}

fn parse_indicator(
    record: &csv::StringRecord,
    row: usize,
    column: usize,
    names: &[String],
) -> Result<u8, DataError> {
    let value = parse_field(record, row, column, names)?;
    if value == 0.0 {
        Ok(0)
    } else if value == 1.0 {
        Ok(1)
    } else {
        Err(DataError::InvalidIndicator {
            row,
            column: names[column].clone(),
            value,
        })
    }
}

/// Reads a tab-separated sample file. Returns the sample and the covariate
/// column names in file order.
pub fn load_sample(path: impl AsRef<Path>) -> Result<(Sample, Vec<String>), DataError> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let layout = Layout::from_headers(reader.headers()?)?;

    let mut time = Vec::new();
    let mut event = Vec::new();
    let mut group = Vec::new();
    let mut weight = Vec::new();
    let mut covariates = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 1;
        time.push(parse_field(&record, row, layout.time, &layout.names)?);
        event.push(parse_indicator(&record, row, layout.event, &layout.names)?);
        group.push(parse_indicator(&record, row, layout.group, &layout.names)?);
        if let Some(column) = layout.weight {
            weight.push(parse_field(&record, row, column, &layout.names)?);
        }
        for &column in &layout.covariates {
            covariates.push(parse_field(&record, row, column, &layout.names)?);
        }
    }
    let n = time.len();
    if n == 0 {
        return Err(DataError::NoRows);
    }
    let covariates = Array2::from_shape_vec((n, layout.covariates.len()), covariates)
        .map_err(|_| SampleError::DimensionMismatch)?;
    let weight = layout.weight.map(|_| Array1::from(weight));
    let sample = Sample::new(
        Array1::from(time),
        Array1::from(event),
        Array1::from(group),
        covariates,
        weight,
    )?;
    let names = layout
        .covariates
        .iter()
        .map(|&j| layout.names[j].clone())
        .collect();
    log::info!(
        "Loaded {n} observations with {} covariates from {}",
        sample.num_covariates(),
        path.display()
    );
    Ok((sample, names))
}

/// Writes `time, cumulative_hazard, survival_group0, survival_group1`.
pub fn write_curves(path: impl AsRef<Path>, fit: &HazardRatioFit) -> Result<(), DataError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record([
        "time",
        "cumulative_hazard",
        "survival_group0",
        "survival_group1",
    ])?;
    for j in 0..fit.time_grid.len() {
        writer.write_record([
            fit.time_grid[j].to_string(),
            fit.baseline_cum_hazard[j].to_string(),
            fit.survival_group0[j].to_string(),
            fit.survival_group1[j].to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the time-varying diagnostic as `time, beta`.
pub fn write_time_varying_beta(
    path: impl AsRef<Path>,
    diagnostic: &TimeVaryingBeta,
) -> Result<(), DataError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["time", "beta"])?;
    for (t, value) in diagnostic.time.iter().zip(&diagnostic.value) {
        writer.write_record([t.to_string(), value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_required_optional_and_covariate_columns() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.tsv");
        fs::write(
            &path,
            "age\ttime\tevent\tgroup\tweight\tbmi\n\
             50\t1.5\t1\t0\t2\t22.1\n\
             61\t2.0\t0\t1\t1\t27.4\n\
             47\t3.25\t1\t1\t0.5\t24.0\n",
        )
        .expect("write");
        let (sample, names) = load_sample(&path).expect("load");
        assert_eq!(sample.len(), 3);
        assert_eq!(names, vec!["age".to_string(), "bmi".to_string()]);
        assert_eq!(sample.time().to_vec(), vec![1.5, 2.0, 3.25]);
        assert_eq!(sample.event().to_vec(), vec![1, 0, 1]);
        assert_eq!(sample.group().to_vec(), vec![0, 1, 1]);
        assert_eq!(sample.weight().to_vec(), vec![2.0, 1.0, 0.5]);
        assert_eq!(sample.covariates()[[1, 0]], 61.0);
        assert_eq!(sample.covariates()[[2, 1]], 24.0);
    }

    #[test]
    fn missing_weight_column_defaults_to_one() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.tsv");
        fs::write(&path, "time\tevent\tgroup\n1\t1\t0\n2\t0\t1\n").expect("write");
        let (sample, names) = load_sample(&path).expect("load");
        assert!(names.is_empty());
        assert_eq!(sample.weight().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn reports_missing_columns_and_bad_values() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.tsv");
        fs::write(&path, "time\tstatus\tgroup\n1\t1\t0\n").expect("write");
        assert!(matches!(
            load_sample(&path),
            Err(DataError::ColumnNotFound(column)) if column == "event"
        ));

        fs::write(&path, "time\tevent\tgroup\n1\t1\t2\n").expect("write");
        assert!(matches!(
            load_sample(&path),
            Err(DataError::InvalidIndicator { row: 1, .. })
        ));

        fs::write(&path, "time\tevent\tgroup\nsoon\t1\t0\n").expect("write");
        assert!(matches!(
            load_sample(&path),
            Err(DataError::InvalidValue { row: 1, .. })
        ));
    }

    #[test]
    fn writes_diagnostic_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("beta_t.tsv");
        let diagnostic = TimeVaryingBeta {
            time: vec![1.0, 2.5],
            value: vec![0.1, -0.2],
        };
        write_time_varying_beta(&path, &diagnostic).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "time\tbeta\n1\t0.1\n2.5\t-0.2\n");
    }
}
