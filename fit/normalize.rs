use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Below this, a column is treated as constant and left unscaled.
const MIN_STD_DEV: f64 = 1e-12;

#[derive(Error, Debug, PartialEq)]
pub enum NormalizationError {
    #[error("Cannot fit normalization on an empty matrix.")]
    Empty,
    #[error("Expected {expected} columns, found {found}.")]
    ColumnMismatch { expected: usize, found: usize },
    #[error("{names} names were given for {columns} columns.")]
    NameMismatch { names: usize, columns: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnScale {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
}

/// Per-column (mean, standard deviation) learned from a training matrix and
/// applied identically to every later input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParameters {
    pub columns: Vec<ColumnScale>,
}

impl NormalizationParameters {
    /// Fits on the rows of `x`, using the sample standard deviation.
    ///
    /// Constant columns get a standard deviation of 1 so they map to zero
    /// rather than to NaN.
    pub fn fit(names: &[String], x: ArrayView2<f64>) -> Result<Self, NormalizationError> {
        if x.nrows() == 0 {
            return Err(NormalizationError::Empty);
        }
        if names.len() != x.ncols() {
            return Err(NormalizationError::NameMismatch {
                names: names.len(),
                columns: x.ncols(),
            });
        }
        let ddof = if x.nrows() > 1 { 1.0 } else { 0.0 };
        let means = x.mean_axis(Axis(0)).ok_or(NormalizationError::Empty)?;
        let std_devs = x.std_axis(Axis(0), ddof);

        let columns = names
            .iter()
            .zip(means.iter().zip(std_devs.iter()))
            .map(|(name, (&mean, &std_dev))| ColumnScale {
                name: name.clone(),
                mean,
                std_dev: if std_dev.is_finite() && std_dev > MIN_STD_DEV {
                    std_dev
                } else {
                    1.0
                },
            })
            .collect();
        Ok(Self { columns })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, NormalizationError> {
        if x.ncols() != self.columns.len() {
            return Err(NormalizationError::ColumnMismatch {
                expected: self.columns.len(),
                found: x.ncols(),
            });
        }
        let mut scaled = x.to_owned();
        for (mut column, scale) in scaled.columns_mut().into_iter().zip(&self.columns) {
            column.mapv_inplace(|v| (v - scale.mean) / scale.std_dev);
        }
        Ok(scaled)
    }

    pub fn transform_row(&self, row: ArrayView1<f64>) -> Result<Array1<f64>, NormalizationError> {
        if row.len() != self.columns.len() {
            return Err(NormalizationError::ColumnMismatch {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        Ok(row
            .iter()
            .zip(&self.columns)
            .map(|(&v, scale)| (v - scale.mean) / scale.std_dev)
            .collect())
    }
}
