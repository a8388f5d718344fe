use crate::fit::normalize::{NormalizationError, NormalizationParameters};
use crate::prepare::table::{ApplicantTable, TableError, is_present};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coefficients whose magnitude does not exceed this are treated as zero.
pub const DEFAULT_ZERO_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error("The least-squares system is singular: {0}")]
    Singular(#[from] ndarray_linalg::error::LinalgError),
    #[error("Fitting {features} features needs more than {features} complete rows, found {rows}.")]
    InsufficientData { rows: usize, features: usize },
    #[error("The model was trained on {expected} features but received {found}.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Feature '{0}' is required by the model but has no usable value.")]
    MissingValue(String),
    #[error("The reduced feature set is empty.")]
    NoFeatures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCoefficient {
    pub feature: String,
    /// Coefficient on the normalized feature scale.
    pub coefficient: f64,
}

/// A linear model at one penalty strength: intercept plus one coefficient per
/// feature, both on the normalized scale, together with the normalization that
/// maps raw inputs onto that scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub lambda: f64,
    pub intercept: f64,
    pub coefficients: Vec<FeatureCoefficient>,
    pub normalization: NormalizationParameters,
}

impl FittedModel {
    pub fn features(&self) -> Vec<&str> {
        self.coefficients.iter().map(|c| c.feature.as_str()).collect()
    }

    pub fn coefficient(&self, feature: &str) -> Option<f64> {
        self.coefficients
            .iter()
            .find(|c| c.feature == feature)
            .map(|c| c.coefficient)
    }

    pub fn is_selected(&self, feature: &str, tolerance: f64) -> bool {
        self.coefficient(feature)
            .is_some_and(|c| c.abs() > tolerance)
    }

    /// Nonzero features, largest magnitude first; ties keep feature order.
    pub fn selected(&self, tolerance: f64) -> Vec<&str> {
        let mut nonzero: Vec<&FeatureCoefficient> = self
            .coefficients
            .iter()
            .filter(|c| c.coefficient.abs() > tolerance)
            .collect();
        nonzero.sort_by(|a, b| b.coefficient.abs().total_cmp(&a.coefficient.abs()));
        nonzero.into_iter().map(|c| c.feature.as_str()).collect()
    }

    pub fn nonzero_count(&self, tolerance: f64) -> usize {
        self.coefficients
            .iter()
            .filter(|c| c.coefficient.abs() > tolerance)
            .count()
    }

    fn beta(&self) -> Array1<f64> {
        self.coefficients.iter().map(|c| c.coefficient).collect()
    }

    /// Prediction for one raw (unnormalized) row in feature order.
    pub fn predict_row(&self, row: ArrayView1<f64>) -> Result<f64, ModelError> {
        let z = self.normalization.transform_row(row)?;
        Ok(self.intercept + z.dot(&self.beta()))
    }

    /// Predictions for raw rows `[n, features]`.
    pub fn predict_matrix(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let z = self.normalization.transform(x)?;
        Ok(z.dot(&self.beta()) + self.intercept)
    }

    /// Intercept and coefficients expressed on the raw feature scale.
    pub fn raw_coefficients(&self) -> (f64, Vec<FeatureCoefficient>) {
        let mut intercept = self.intercept;
        let raw = self
            .coefficients
            .iter()
            .zip(&self.normalization.columns)
            .map(|(c, scale)| {
                let slope = c.coefficient / scale.std_dev;
                intercept -= slope * scale.mean;
                FeatureCoefficient {
                    feature: c.feature.clone(),
                    coefficient: slope,
                }
            })
            .collect();
        (intercept, raw)
    }
}

/// Out-of-sample fit quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    pub rows: usize,
    pub rmse: f64,
    pub r_squared: f64,
}

impl FitMetrics {
    pub fn compute(predicted: ArrayView1<f64>, observed: ArrayView1<f64>) -> Self {
        let rows = observed.len();
        if rows == 0 {
            return Self {
                rows,
                rmse: f64::NAN,
                r_squared: f64::NAN,
            };
        }
        let sse: f64 = predicted
            .iter()
            .zip(observed.iter())
            .map(|(p, o)| (p - o).powi(2))
            .sum();
        let mean = observed.sum() / rows as f64;
        let sst: f64 = observed.iter().map(|o| (o - mean).powi(2)).sum();
        Self {
            rows,
            rmse: (sse / rows as f64).sqrt(),
            r_squared: if sst > 0.0 { 1.0 - sse / sst } else { f64::NAN },
        }
    }
}

/// A row the batch predictor had to skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub row: usize,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchPredictions {
    /// One entry per input row; `None` where the row was skipped.
    pub predictions: Vec<Option<f64>>,
    pub skipped: Vec<RowIssue>,
}

/// The small, explainable model served to users: an unpenalized least-squares
/// fit restricted to a hand-picked feature subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedModel {
    pub target: String,
    pub model: FittedModel,
}

impl ReducedModel {
    /// Retrains from scratch on `features`, using only rows where all of them are present.
    pub fn fit(table: &ApplicantTable, features: &[String]) -> Result<Self, ModelError> {
        if features.is_empty() {
            return Err(ModelError::NoFeatures);
        }
        let rows = table.complete_rows(features)?;
        if rows.len() < table.len() {
            log::warn!(
                "Reduced model: {} of {} rows lack one of [{}] and were left out.",
                table.len() - rows.len(),
                table.len(),
                itertools::Itertools::join(&mut features.iter(), ", ")
            );
        }
        let (x, y) = table.select_rows(&rows).design_matrix(features)?;
        Self::fit_matrix(table.target_name(), features, x.view(), y.view())
    }

    pub fn fit_matrix(
        target: &str,
        features: &[String],
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<Self, ModelError> {
        if features.is_empty() {
            return Err(ModelError::NoFeatures);
        }
        if x.ncols() != features.len() {
            return Err(ModelError::DimensionMismatch {
                expected: features.len(),
                found: x.ncols(),
            });
        }
        if x.nrows() <= features.len() {
            return Err(ModelError::InsufficientData {
                rows: x.nrows(),
                features: features.len(),
            });
        }

        let normalization = NormalizationParameters::fit(features, x)?;
        let z = normalization.transform(x)?;
        let z_mean = z.mean_axis(Axis(0)).ok_or(ModelError::NoFeatures)?;
        let y_mean = y.mean().ok_or(ModelError::NoFeatures)?;
        let zc: Array2<f64> = &z - &z_mean;
        let yc = &y - y_mean;

        let gram = zc.t().dot(&zc);
        let moment = zc.t().dot(&yc);
        let beta = gram.solve_into(moment)?;
        let intercept = y_mean - z_mean.dot(&beta);

        let coefficients = features
            .iter()
            .zip(beta.iter())
            .map(|(feature, &coefficient)| FeatureCoefficient {
                feature: feature.clone(),
                coefficient,
            })
            .collect();

        log::info!(
            "Reduced model fitted on {} rows with {} features.",
            x.nrows(),
            features.len()
        );
        Ok(Self {
            target: target.to_string(),
            model: FittedModel {
                lambda: 0.0,
                intercept,
                coefficients,
                normalization,
            },
        })
    }

    pub fn features(&self) -> Vec<&str> {
        self.model.features()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.model
            .coefficients
            .iter()
            .map(|c| c.feature.clone())
            .collect()
    }

    /// Predicts from raw values given in model feature order.
    pub fn predict(&self, values: &[f64]) -> Result<f64, ModelError> {
        if values.len() != self.model.coefficients.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.model.coefficients.len(),
                found: values.len(),
            });
        }
        if let Some((index, _)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(ModelError::MissingValue(
                self.model.coefficients[index].feature.clone(),
            ));
        }
        self.model.predict_row(ArrayView1::from(values))
    }

    /// Predicts every row of `table`, skipping and reporting rows that lack a
    /// required feature instead of failing the whole batch.
    pub fn predict_table(&self, table: &ApplicantTable) -> Result<BatchPredictions, ModelError> {
        let features = self.feature_names();
        let columns: Vec<&[Option<f64>]> = features
            .iter()
            .map(|name| {
                table
                    .numeric(name)
                    .ok_or_else(|| TableError::UnknownColumn(name.clone()))
            })
            .collect::<Result<_, _>>()?;

        let mut predictions = Vec::with_capacity(table.len());
        let mut skipped = Vec::new();
        let mut row_values = vec![0.0; features.len()];
        for row in 0..table.len() {
            let gap = columns.iter().position(|values| !is_present(values[row]));
            if let Some(slot) = gap {
                skipped.push(RowIssue {
                    row,
                    column: features[slot].clone(),
                });
                predictions.push(None);
                continue;
            }
            for (value, values) in row_values.iter_mut().zip(&columns) {
                *value = values[row].unwrap_or(f64::NAN);
            }
            predictions.push(Some(self.predict(&row_values)?));
        }

        if !skipped.is_empty() {
            log::warn!(
                "Skipped {} of {} rows with missing model features.",
                skipped.len(),
                table.len()
            );
        }
        Ok(BatchPredictions {
            predictions,
            skipped,
        })
    }

    /// Held-out quality over the rows that could be predicted.
    pub fn evaluate(&self, table: &ApplicantTable) -> Result<FitMetrics, ModelError> {
        let batch = self.predict_table(table)?;
        let (predicted, observed): (Vec<f64>, Vec<f64>) = batch
            .predictions
            .iter()
            .zip(table.target())
            .filter_map(|(p, &o)| p.map(|p| (p, o)))
            .unzip();
        Ok(FitMetrics::compute(
            ArrayView1::from(&predicted),
            ArrayView1::from(&observed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn exact_table() -> ApplicantTable {
        // rate = 1 + 2a - 3b exactly.
        let a = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [1.0, 0.0, 2.0, 1.0, 3.0, 0.5];
        let rate = a.iter().zip(&b).map(|(a, b)| 1.0 + 2.0 * a - 3.0 * b).collect();
        ApplicantTable::new("rate", rate)
            .with_numeric("a", a.iter().map(|v| Some(*v)).collect())
            .unwrap()
            .with_numeric("b", b.iter().map(|v| Some(*v)).collect())
            .unwrap()
    }

    #[test]
    fn exact_linear_data_is_recovered_on_the_raw_scale() {
        let model = ReducedModel::fit(&exact_table(), &names(&["a", "b"])).unwrap();
        let (intercept, raw) = model.model.raw_coefficients();
        assert_abs_diff_eq!(intercept, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(raw[0].coefficient, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(raw[1].coefficient, -3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.predict(&[10.0, 1.0]).unwrap(), 18.0, epsilon = 1e-9);
    }

    #[test]
    fn batch_prediction_skips_incomplete_rows() {
        let model = ReducedModel::fit(&exact_table(), &names(&["a", "b"])).unwrap();
        let batch_input = ApplicantTable::new("rate", vec![0.0; 3])
            .with_numeric("a", vec![Some(1.0), None, Some(2.0)])
            .unwrap()
            .with_numeric("b", vec![Some(0.0), Some(1.0), Some(f64::NAN)])
            .unwrap();
        let batch = model.predict_table(&batch_input).unwrap();
        assert_abs_diff_eq!(batch.predictions[0].unwrap(), 3.0, epsilon = 1e-9);
        assert_eq!(batch.predictions[1], None);
        assert_eq!(batch.predictions[2], None);
        assert_eq!(
            batch.skipped,
            vec![
                RowIssue { row: 1, column: "a".into() },
                RowIssue { row: 2, column: "b".into() },
            ]
        );
    }

    #[test]
    fn single_row_prediction_reports_the_missing_feature() {
        let model = ReducedModel::fit(&exact_table(), &names(&["a", "b"])).unwrap();
        assert!(matches!(
            model.predict(&[1.0, f64::NAN]),
            Err(ModelError::MissingValue(ref f)) if f == "b"
        ));
        assert!(matches!(
            model.predict(&[1.0]),
            Err(ModelError::DimensionMismatch { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn too_few_rows_is_insufficient_data() {
        let x = array![[1.0, 2.0], [2.0, 1.0]];
        let y = array![1.0, 2.0];
        assert!(matches!(
            ReducedModel::fit_matrix("rate", &names(&["a", "b"]), x.view(), y.view()),
            Err(ModelError::InsufficientData { rows: 2, features: 2 })
        ));
    }

    #[test]
    fn selected_features_are_ordered_by_magnitude() {
        let model = FittedModel {
            lambda: 0.1,
            intercept: 0.0,
            coefficients: vec![
                FeatureCoefficient { feature: "a".into(), coefficient: 0.2 },
                FeatureCoefficient { feature: "b".into(), coefficient: -0.9 },
                FeatureCoefficient { feature: "c".into(), coefficient: 0.0 },
            ],
            normalization: NormalizationParameters { columns: Vec::new() },
        };
        assert_eq!(model.selected(DEFAULT_ZERO_TOLERANCE), vec!["b", "a"]);
        assert!(!model.is_selected("c", DEFAULT_ZERO_TOLERANCE));
        assert_eq!(model.nonzero_count(DEFAULT_ZERO_TOLERANCE), 2);
    }

    #[test]
    fn fit_metrics_match_hand_computation() {
        let metrics = FitMetrics::compute(array![1.0, 2.0, 4.0].view(), array![1.0, 3.0, 5.0].view());
        assert_eq!(metrics.rows, 3);
        assert_abs_diff_eq!(metrics.rmse, (2.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(metrics.r_squared, 1.0 - 2.0 / 8.0, epsilon = 1e-12);
    }
}
