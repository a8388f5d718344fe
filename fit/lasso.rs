//! # LASSO by Coordinate Descent
//!
//! Minimizes `(1/2n)||y - b0 - X b||^2 + lambda * ||b||_1` for every lambda of a
//! [`PenaltyGrid`]. The path is walked from the largest penalty to the smallest,
//! each fit warm-started from the previous one, which is what makes a full path
//! barely more expensive than a single fit.
//!
//! Columns are centered internally, so the intercept is never penalized. Callers
//! are expected to hand in standardized features; nothing here rescales them.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum LassoError {
    #[error("Penalty grid is invalid: {0}")]
    InvalidGrid(String),
    #[error("Design has {rows} rows but the response has {response} values.")]
    DimensionMismatch { rows: usize, response: usize },
    #[error("Cannot fit a penalized regression to an empty design.")]
    EmptyDesign,
}

/// Ascending, strictly positive candidate penalties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyGrid {
    lambdas: Vec<f64>,
}

impl PenaltyGrid {
    pub fn new(mut lambdas: Vec<f64>) -> Result<Self, LassoError> {
        if lambdas.is_empty() {
            return Err(LassoError::InvalidGrid("no penalties given".into()));
        }
        if let Some(bad) = lambdas.iter().find(|l| !(l.is_finite() && **l > 0.0)) {
            return Err(LassoError::InvalidGrid(format!(
                "penalty {bad} is not a positive finite number"
            )));
        }
        lambdas.sort_by(f64::total_cmp);
        lambdas.dedup();
        Ok(Self { lambdas })
    }

    /// `count` penalties evenly spaced on a log scale over `[min, max]`.
    pub fn log_spaced(min: f64, max: f64, count: usize) -> Result<Self, LassoError> {
        if !(min > 0.0 && max > min && min.is_finite() && max.is_finite()) {
            return Err(LassoError::InvalidGrid(format!(
                "range [{min}, {max}] must be positive and increasing"
            )));
        }
        if count < 2 {
            return Err(LassoError::InvalidGrid(format!(
                "at least two penalties are needed, got {count}"
            )));
        }
        let (lo, hi) = (min.ln(), max.ln());
        let step = (hi - lo) / (count - 1) as f64;
        Self::new((0..count).map(|i| (lo + step * i as f64).exp()).collect())
    }

    /// Spans `[ratio * lambda_max, lambda_max]`, where `lambda_max` is the
    /// smallest penalty at which every coefficient is zero for this data.
    pub fn from_data(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        count: usize,
        ratio: f64,
    ) -> Result<Self, LassoError> {
        let lambda_max = lambda_max(x, y)?;
        if lambda_max <= 0.0 {
            return Err(LassoError::InvalidGrid(
                "response is uncorrelated with every feature".into(),
            ));
        }
        Self::log_spaced(lambda_max * ratio, lambda_max, count)
    }

    pub fn lambdas(&self) -> &[f64] {
        &self.lambdas
    }

    pub fn len(&self) -> usize {
        self.lambdas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lambdas.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LassoOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the largest scaled coefficient change per sweep.
    pub tolerance: f64,
}

impl Default for LassoOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            tolerance: 1e-9,
        }
    }
}

/// Coefficients for every penalty of a grid, aligned with the grid's ascending order.
#[derive(Debug, Clone)]
pub struct LassoPath {
    pub lambdas: Vec<f64>,
    /// Shape `[n_lambdas, n_features]`.
    pub coefficients: Array2<f64>,
    pub intercepts: Array1<f64>,
    /// Sweeps used per penalty; equal to `max_iterations` when a fit did not converge.
    pub iterations: Vec<usize>,
}

impl LassoPath {
    pub fn predict(&self, index: usize, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients.row(index)) + self.intercepts[index]
    }
}

/// Smallest lambda at which the LASSO solution is identically zero.
pub fn lambda_max(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, LassoError> {
    let centered = Centered::new(x, y)?;
    let n = centered.x.nrows() as f64;
    Ok(centered
        .x
        .columns()
        .into_iter()
        .map(|col| (col.dot(&centered.y) / n).abs())
        .fold(0.0, f64::max))
}

struct Centered {
    x: Array2<f64>,
    y: Array1<f64>,
    x_mean: Array1<f64>,
    y_mean: f64,
}

impl Centered {
    fn new(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Self, LassoError> {
        if x.nrows() != y.len() {
            return Err(LassoError::DimensionMismatch {
                rows: x.nrows(),
                response: y.len(),
            });
        }
        let x_mean = x.mean_axis(Axis(0)).ok_or(LassoError::EmptyDesign)?;
        let y_mean = y.mean().ok_or(LassoError::EmptyDesign)?;
        Ok(Self {
            x: &x - &x_mean,
            y: &y - y_mean,
            x_mean,
            y_mean,
        })
    }
}

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

/// Fits the full regularization path over `grid`.
pub fn fit_path(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    grid: &PenaltyGrid,
    options: &LassoOptions,
) -> Result<LassoPath, LassoError> {
    let Centered {
        x: xc,
        y: yc,
        x_mean,
        y_mean,
    } = Centered::new(x, y)?;
    let n = xc.nrows() as f64;
    let p = xc.ncols();

    // Mean squared norm of each column; zero for columns with no variation.
    let col_norms: Vec<f64> = xc
        .columns()
        .into_iter()
        .map(|col| col.dot(&col) / n)
        .collect();

    let mut beta = Array1::<f64>::zeros(p);
    let mut residual = yc.clone();
    let mut coefficients = Array2::<f64>::zeros((grid.len(), p));
    let mut intercepts = Array1::<f64>::zeros(grid.len());
    let mut iterations = vec![0; grid.len()];

    for (index, &lambda) in grid.lambdas().iter().enumerate().rev() {
        let mut sweeps = 0;
        while sweeps < options.max_iterations {
            sweeps += 1;
            let mut max_change = 0.0_f64;
            for j in 0..p {
                if col_norms[j] <= f64::EPSILON {
                    continue;
                }
                let column = xc.column(j);
                let old = beta[j];
                let rho = column.dot(&residual) / n + col_norms[j] * old;
                let new = soft_threshold(rho, lambda) / col_norms[j];
                if new != old {
                    residual.scaled_add(old - new, &column);
                    beta[j] = new;
                    max_change = max_change.max((new - old).abs() * col_norms[j].sqrt());
                }
            }
            if max_change < options.tolerance {
                break;
            }
        }
        if sweeps == options.max_iterations {
            log::warn!(
                "Coordinate descent hit the {} sweep limit at lambda = {:.4e}.",
                options.max_iterations,
                lambda
            );
        }
        iterations[index] = sweeps;
        coefficients.row_mut(index).assign(&beta);
        intercepts[index] = y_mean - x_mean.dot(&beta);
    }

    Ok(LassoPath {
        lambdas: grid.lambdas().to_vec(),
        coefficients,
        intercepts,
        iterations,
    })
}
