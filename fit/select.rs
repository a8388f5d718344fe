//! # Cross-Validated Feature Selection
//!
//! Ranks candidate predictors by walking a LASSO path over a [`PenaltyGrid`]:
//!
//! - **Cross-validation:** the training rows are shuffled once with a seed and
//!   dealt into `k` folds. Every fold is scored independently (in parallel), with
//!   its own normalization fitted on its own training rows, so no held-out value
//!   ever shapes the scaling it is evaluated under.
//! - **Full-data path:** the whole training partition is then normalized once and
//!   fitted along the same grid; those models define which features are
//!   selected at each penalty.
//! - **Nesting:** as the penalty grows the selected set must only shrink. A
//!   feature that drops out and later comes back is reported as a
//!   [`NestingViolation`] instead of being silently accepted.

use crate::fit::lasso::{self, LassoError, LassoOptions, PenaltyGrid};
use crate::fit::normalize::{NormalizationError, NormalizationParameters};
use crate::fit::reduced::{DEFAULT_ZERO_TOLERANCE, FeatureCoefficient, FitMetrics, FittedModel};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_FOLDS: usize = 10;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("{folds}-fold cross-validation needs at least {needed} rows, found {rows}.")]
    InsufficientData {
        rows: usize,
        folds: usize,
        needed: usize,
    },
    #[error("Cross-validation needs at least 2 folds, {0} were requested.")]
    TooFewFolds(usize),
    #[error("{names} feature names were given for a design with {columns} columns.")]
    FeatureMismatch { names: usize, columns: usize },
    #[error(transparent)]
    Lasso(#[from] LassoError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error("The regularization path is not nested: {} feature reappearance(s).", .0.len())]
    NonMonotonePath(Vec<NestingViolation>),
}

/// Cross-validated error at one penalty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PenaltyMetrics {
    pub lambda: f64,
    /// Mean of the per-fold held-out RMSE.
    pub rmse: f64,
    pub rmse_std_error: f64,
    /// Mean of the per-fold held-out coefficient of determination.
    pub r_squared: f64,
    /// Nonzero coefficients of the full-data fit at this penalty.
    pub nonzero: usize,
}

/// A feature that was zero at `dropped_at` but nonzero again at the larger
/// penalty `reappeared_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestingViolation {
    pub feature: String,
    pub dropped_at: f64,
    pub reappeared_at: f64,
}

/// Where a feature enters the path, scanning from the largest penalty down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRank {
    pub feature: String,
    pub entry_lambda: f64,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureSelector {
    pub folds: usize,
    pub seed: u64,
    pub zero_tolerance: f64,
    pub strict_nesting: bool,
    pub lasso: LassoOptions,
    pub show_progress: bool,
}

impl Default for FeatureSelector {
    fn default() -> Self {
        Self {
            folds: DEFAULT_FOLDS,
            seed: 42,
            zero_tolerance: DEFAULT_ZERO_TOLERANCE,
            strict_nesting: false,
            lasso: LassoOptions::default(),
            show_progress: false,
        }
    }
}

/// Everything the selector learned: CV metrics and a full-data model per penalty.
#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub features: Vec<String>,
    pub folds: usize,
    pub zero_tolerance: f64,
    /// Ascending by lambda, aligned with `models`.
    pub metrics: Vec<PenaltyMetrics>,
    pub models: Vec<FittedModel>,
    pub violations: Vec<NestingViolation>,
}

/// The persistable part of a [`SelectionReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub folds: usize,
    pub best_lambda: f64,
    pub one_se_lambda: f64,
    pub ranking: Vec<FeatureRank>,
    pub metrics: Vec<PenaltyMetrics>,
    pub violations: Vec<NestingViolation>,
}

impl FeatureSelector {
    pub fn with_folds(mut self, folds: usize) -> Self {
        self.folds = folds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strict_nesting(mut self, strict: bool) -> Self {
        self.strict_nesting = strict;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// A grid spanning `[ratio * lambda_max, lambda_max]` of the normalized design,
    /// i.e. on the scale the full-data path is fitted on.
    pub fn penalty_grid(
        &self,
        features: &[String],
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        count: usize,
        ratio: f64,
    ) -> Result<PenaltyGrid, SelectionError> {
        let normalization = NormalizationParameters::fit(features, x)?;
        let z = normalization.transform(x)?;
        Ok(PenaltyGrid::from_data(z.view(), y, count, ratio)?)
    }

    /// Runs cross-validation and the full-data path for raw (unnormalized) `x`.
    pub fn fit(
        &self,
        features: &[String],
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        grid: &PenaltyGrid,
    ) -> Result<SelectionReport, SelectionError> {
        if self.folds < 2 {
            return Err(SelectionError::TooFewFolds(self.folds));
        }
        let rows = x.nrows();
        let needed = 2 * self.folds;
        if rows < needed {
            return Err(SelectionError::InsufficientData {
                rows,
                folds: self.folds,
                needed,
            });
        }
        if features.len() != x.ncols() {
            return Err(SelectionError::FeatureMismatch {
                names: features.len(),
                columns: x.ncols(),
            });
        }
        if y.len() != rows {
            return Err(LassoError::DimensionMismatch {
                rows,
                response: y.len(),
            }
            .into());
        }

        log::info!(
            "Selecting among {} features: {}-fold CV over {} penalties on {} rows.",
            features.len(),
            self.folds,
            grid.len(),
            rows
        );

        let assignment = self.fold_assignment(rows);
        let pb = self.progress_bar(self.folds as u64 + 1);

        let per_fold: Vec<Vec<FitMetrics>> = (0..self.folds)
            .into_par_iter()
            .map(|fold| {
                let scored = self.score_fold(fold, &assignment, features, x, y, grid);
                pb.inc(1);
                scored
            })
            .collect::<Result<_, _>>()?;

        pb.set_message("full-data path");
        let models = self.fit_full(features, x, y, grid)?;
        pb.inc(1);
        pb.finish_with_message("done");

        let metrics = grid
            .lambdas()
            .iter()
            .enumerate()
            .map(|(index, &lambda)| {
                let fold_rmse: Vec<f64> = per_fold.iter().map(|m| m[index].rmse).collect();
                let fold_r2: Vec<f64> = per_fold.iter().map(|m| m[index].r_squared).collect();
                let (rmse, rmse_std_error) = mean_and_std_error(&fold_rmse);
                let (r_squared, _) = mean_and_std_error(&fold_r2);
                PenaltyMetrics {
                    lambda,
                    rmse,
                    rmse_std_error,
                    r_squared,
                    nonzero: models[index].nonzero_count(self.zero_tolerance),
                }
            })
            .collect();

        let violations = nesting_violations(&models, self.zero_tolerance);
        for violation in &violations {
            log::warn!(
                "Feature '{}' dropped out at lambda = {:.4e} but reappeared at lambda = {:.4e}.",
                violation.feature,
                violation.dropped_at,
                violation.reappeared_at
            );
        }
        if self.strict_nesting && !violations.is_empty() {
            return Err(SelectionError::NonMonotonePath(violations));
        }

        let report = SelectionReport {
            features: features.to_vec(),
            folds: self.folds,
            zero_tolerance: self.zero_tolerance,
            metrics,
            models,
            violations,
        };
        if let Some(best) = report.best_lambda() {
            log::info!(
                "Best CV lambda = {:.4e}; one-SE lambda = {:.4e}.",
                best,
                report.one_se_lambda().unwrap_or(best)
            );
        }
        Ok(report)
    }

    /// Fold index per row, from one seeded shuffle dealt round-robin.
    fn fold_assignment(&self, rows: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..rows).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        let mut assignment = vec![0; rows];
        for (position, &row) in order.iter().enumerate() {
            assignment[row] = position % self.folds;
        }
        assignment
    }

    fn score_fold(
        &self,
        fold: usize,
        assignment: &[usize],
        features: &[String],
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        grid: &PenaltyGrid,
    ) -> Result<Vec<FitMetrics>, SelectionError> {
        let (held_out, kept): (Vec<usize>, Vec<usize>) =
            (0..assignment.len()).partition(|&row| assignment[row] == fold);

        let x_train = x.select(Axis(0), &kept);
        let y_train = y.select(Axis(0), &kept);
        let x_test = x.select(Axis(0), &held_out);
        let y_test = y.select(Axis(0), &held_out);

        let normalization = NormalizationParameters::fit(features, x_train.view())?;
        let z_train = normalization.transform(x_train.view())?;
        let z_test = normalization.transform(x_test.view())?;

        let path = lasso::fit_path(z_train.view(), y_train.view(), grid, &self.lasso)?;
        log::debug!(
            "Fold {}: {} training rows, {} held out.",
            fold + 1,
            kept.len(),
            held_out.len()
        );
        Ok((0..grid.len())
            .map(|index| {
                let predicted = path.predict(index, z_test.view());
                FitMetrics::compute(predicted.view(), y_test.view())
            })
            .collect())
    }

    fn fit_full(
        &self,
        features: &[String],
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        grid: &PenaltyGrid,
    ) -> Result<Vec<FittedModel>, SelectionError> {
        let normalization = NormalizationParameters::fit(features, x)?;
        let z = normalization.transform(x)?;
        let path = lasso::fit_path(z.view(), y, grid, &self.lasso)?;
        Ok(path
            .lambdas
            .iter()
            .enumerate()
            .map(|(index, &lambda)| FittedModel {
                lambda,
                intercept: path.intercepts[index],
                coefficients: features
                    .iter()
                    .zip(path.coefficients.row(index).iter())
                    .map(|(feature, &coefficient)| FeatureCoefficient {
                        feature: feature.clone(),
                        coefficient,
                    })
                    .collect(),
                normalization: normalization.clone(),
            })
            .collect())
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        let target = if self.show_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(len), target);
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} folds ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        pb.set_style(style);
        pb.set_message("cross-validating");
        pb
    }
}

/// Mean over finite values and the standard error of that mean.
fn mean_and_std_error(values: &[f64]) -> (f64, f64) {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let n = finite.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = finite.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, (variance / n as f64).sqrt())
}

/// Checks that the selected set only shrinks as lambda grows.
///
/// `models` must be in ascending lambda order. A feature that is zero at one
/// penalty and nonzero at a larger one yields one violation per reappearance.
pub fn nesting_violations(models: &[FittedModel], tolerance: f64) -> Vec<NestingViolation> {
    let Some(first) = models.first() else {
        return Vec::new();
    };
    let mut violations = Vec::new();
    for (slot, coefficient) in first.coefficients.iter().enumerate() {
        let mut dropped_at: Option<f64> = None;
        for model in models {
            let active = model
                .coefficients
                .get(slot)
                .is_some_and(|c| c.coefficient.abs() > tolerance);
            match (active, dropped_at) {
                (false, None) => dropped_at = Some(model.lambda),
                (true, Some(dropped)) => {
                    violations.push(NestingViolation {
                        feature: coefficient.feature.clone(),
                        dropped_at: dropped,
                        reappeared_at: model.lambda,
                    });
                    dropped_at = None;
                }
                _ => {}
            }
        }
    }
    violations
}

impl SelectionReport {
    pub fn lambdas(&self) -> impl Iterator<Item = f64> + '_ {
        self.metrics.iter().map(|m| m.lambda)
    }

    fn best_index(&self) -> Option<usize> {
        self.metrics
            .iter()
            .enumerate()
            .filter(|(_, m)| m.rmse.is_finite())
            .min_by(|(_, a), (_, b)| a.rmse.total_cmp(&b.rmse))
            .map(|(index, _)| index)
    }

    /// The penalty with the lowest cross-validated RMSE.
    pub fn best_lambda(&self) -> Option<f64> {
        self.best_index().map(|index| self.metrics[index].lambda)
    }

    /// The largest penalty whose CV RMSE is within one standard error of the minimum.
    pub fn one_se_lambda(&self) -> Option<f64> {
        let best = &self.metrics[self.best_index()?];
        let threshold = best.rmse + best.rmse_std_error;
        self.metrics
            .iter()
            .filter(|m| m.rmse <= threshold)
            .map(|m| m.lambda)
            .reduce(f64::max)
    }

    /// The full-data model fitted at the grid penalty nearest to `lambda`.
    pub fn model_at(&self, lambda: f64) -> Option<&FittedModel> {
        self.models
            .iter()
            .min_by(|a, b| (a.lambda - lambda).abs().total_cmp(&(b.lambda - lambda).abs()))
    }

    /// Nonzero features at `lambda`, by decreasing coefficient magnitude.
    pub fn selected_features(&self, lambda: f64) -> Vec<&str> {
        self.model_at(lambda)
            .map(|model| model.selected(self.zero_tolerance))
            .unwrap_or_default()
    }

    /// Features in the order they enter the path as the penalty is lowered.
    ///
    /// Ties (features entering at the same penalty) are broken by coefficient
    /// magnitude at that penalty. Features that are never selected are omitted.
    pub fn feature_ranking(&self) -> Vec<FeatureRank> {
        let mut ranking: Vec<(usize, FeatureRank)> = self
            .features
            .iter()
            .enumerate()
            .filter_map(|(slot, feature)| {
                self.models.iter().enumerate().rev().find_map(|(index, model)| {
                    let c = model.coefficients.get(slot)?.coefficient;
                    (c.abs() > self.zero_tolerance).then(|| {
                        (
                            index,
                            FeatureRank {
                                feature: feature.clone(),
                                entry_lambda: model.lambda,
                                coefficient: c,
                            },
                        )
                    })
                })
            })
            .collect();
        ranking.sort_by(|(ia, a), (ib, b)| {
            ib.cmp(ia)
                .then_with(|| b.coefficient.abs().total_cmp(&a.coefficient.abs()))
        });
        ranking.into_iter().map(|(_, rank)| rank).collect()
    }

    pub fn top_features(&self, n: usize) -> Vec<String> {
        self.feature_ranking()
            .into_iter()
            .take(n)
            .map(|rank| rank.feature)
            .collect()
    }

    pub fn summary(&self) -> SelectionSummary {
        let best = self.best_lambda().unwrap_or(f64::NAN);
        SelectionSummary {
            folds: self.folds,
            best_lambda: best,
            one_se_lambda: self.one_se_lambda().unwrap_or(best),
            ranking: self.feature_ranking(),
            metrics: self.metrics.clone(),
            violations: self.violations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand_distr::{Distribution, Normal};

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("x{i}")).collect()
    }

    /// y = 3*x0 + 0.5*x1 + noise; x2 is irrelevant.
    fn synthetic(rows: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let noise = Normal::new(0.0, 0.1).unwrap();
        let x = Array2::from_shape_fn((rows, 3), |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(rows, |i| {
            3.0 * x[[i, 0]] + 0.5 * x[[i, 1]] + noise.sample(&mut rng)
        });
        (x, y)
    }

    fn model(lambda: f64, coefficients: &[f64]) -> FittedModel {
        FittedModel {
            lambda,
            intercept: 0.0,
            coefficients: coefficients
                .iter()
                .enumerate()
                .map(|(i, &coefficient)| FeatureCoefficient {
                    feature: format!("x{i}"),
                    coefficient,
                })
                .collect(),
            normalization: NormalizationParameters { columns: Vec::new() },
        }
    }

    #[test]
    fn too_few_rows_for_the_folds_is_insufficient_data() {
        let (x, y) = synthetic(15, 1);
        let grid = PenaltyGrid::log_spaced(0.01, 1.0, 5).unwrap();
        let err = FeatureSelector::default()
            .fit(&names(3), x.view(), y.view(), &grid)
            .unwrap_err();
        assert!(matches!(
            err,
            SelectionError::InsufficientData { rows: 15, folds: 10, needed: 20 }
        ));
        assert!(matches!(
            FeatureSelector::default()
                .with_folds(1)
                .fit(&names(3), x.view(), y.view(), &grid),
            Err(SelectionError::TooFewFolds(1))
        ));
    }

    #[test]
    fn strong_signal_is_ranked_first_and_noise_last() {
        let (x, y) = synthetic(300, 7);
        let selector = FeatureSelector::default();
        let grid = selector.penalty_grid(&names(3), x.view(), y.view(), 40, 1e-3).unwrap();
        let report = selector
            .fit(&names(3), x.view(), y.view(), &grid)
            .unwrap();

        assert_eq!(report.metrics.len(), 40);
        assert_eq!(report.top_features(2), vec!["x0".to_string(), "x1".to_string()]);

        // At the largest penalty nothing survives; at the smallest the model is dense.
        let largest = report.metrics.last().unwrap().lambda;
        assert!(report.selected_features(largest).is_empty());
        let smallest = report.metrics[0].lambda;
        assert_eq!(report.selected_features(smallest)[0], "x0");

        let best = report.best_lambda().unwrap();
        let best_metrics = report.metrics.iter().find(|m| m.lambda == best).unwrap();
        assert!(best_metrics.r_squared > 0.95);
        assert!(report.one_se_lambda().unwrap() >= best);
    }

    #[test]
    fn selection_is_reproducible_from_the_seed() {
        let (x, y) = synthetic(120, 3);
        let selector = FeatureSelector::default().with_folds(5).with_seed(9);
        let grid = selector.penalty_grid(&names(3), x.view(), y.view(), 10, 1e-2).unwrap();
        let a = selector.fit(&names(3), x.view(), y.view(), &grid).unwrap();
        let b = selector.fit(&names(3), x.view(), y.view(), &grid).unwrap();
        assert_eq!(a.metrics, b.metrics);
    }

    #[test]
    fn selected_sets_shrink_along_the_path() {
        let (x, y) = synthetic(200, 11);
        let selector = FeatureSelector::default().with_strict_nesting(true);
        let grid = selector.penalty_grid(&names(3), x.view(), y.view(), 25, 1e-3).unwrap();
        let report = selector
            .fit(&names(3), x.view(), y.view(), &grid)
            .unwrap();
        assert!(report.violations.is_empty());
        for pair in report.metrics.windows(2) {
            assert!(pair[1].nonzero <= pair[0].nonzero);
        }
    }

    #[test]
    fn reappearing_feature_is_flagged() {
        let models = vec![
            model(0.1, &[1.0, 0.5]),
            model(0.2, &[1.0, 0.0]),
            model(0.3, &[0.8, 0.2]),
            model(0.4, &[0.0, 0.0]),
        ];
        let violations = nesting_violations(&models, DEFAULT_ZERO_TOLERANCE);
        assert_eq!(
            violations,
            vec![NestingViolation {
                feature: "x1".into(),
                dropped_at: 0.2,
                reappeared_at: 0.3,
            }]
        );
    }

    #[test]
    fn ranking_orders_by_entry_then_magnitude() {
        let report = SelectionReport {
            features: names(3),
            folds: 5,
            zero_tolerance: DEFAULT_ZERO_TOLERANCE,
            metrics: Vec::new(),
            models: vec![
                model(0.1, &[0.3, 0.9, 0.2]),
                model(0.5, &[0.1, -0.4, 0.0]),
                model(1.0, &[0.0, 0.0, 0.0]),
            ],
            violations: Vec::new(),
        };
        let ranking = report.feature_ranking();
        let order: Vec<&str> = ranking.iter().map(|r| r.feature.as_str()).collect();
        assert_eq!(order, vec!["x1", "x0", "x2"]);
        assert_abs_diff_eq!(ranking[0].entry_lambda, 0.5);
        assert_eq!(report.selected_features(0.1), vec!["x1", "x0", "x2"]);
    }

    #[test]
    fn entry_ties_use_the_magnitude_at_entry() {
        let report = SelectionReport {
            features: names(2),
            folds: 5,
            zero_tolerance: DEFAULT_ZERO_TOLERANCE,
            metrics: Vec::new(),
            models: vec![
                // Smaller penalty: x1 has overtaken x0.
                model(0.1, &[0.2, 1.5]),
                model(0.5, &[0.6, -0.1]),
                model(1.0, &[0.0, 0.0]),
            ],
            violations: Vec::new(),
        };
        let ranking = report.feature_ranking();
        let order: Vec<&str> = ranking.iter().map(|r| r.feature.as_str()).collect();
        assert_eq!(order, vec!["x0", "x1"]);
        assert_abs_diff_eq!(ranking[1].coefficient, -0.1);
    }

    #[test]
    fn standard_error_of_fold_scores() {
        let (mean, se) = mean_and_std_error(&[1.0, 2.0, 3.0, f64::NAN]);
        assert_abs_diff_eq!(mean, 2.0);
        assert_abs_diff_eq!(se, (1.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
    }
}
