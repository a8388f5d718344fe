//! # Missing-Value Imputation
//!
//! Imputation is split into two steps that must never be merged:
//!
//! 1. [`ImputationPolicy::fit`] looks at the *training* partition only and freezes
//!    one fill value per column into a [`FittedImputer`].
//! 2. [`FittedImputer::apply`] writes those frozen values into any partition.
//!
//! Applying a fitted imputer to held-out rows therefore cannot leak their
//! statistics back into the model.

use crate::prepare::derive;
use crate::prepare::schema::columns;
use crate::prepare::table::{ApplicantTable, TableError, is_present};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    Zero,
    TrainingMax,
    TrainingMean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationRule {
    pub column: String,
    pub fill: FillPolicy,
}

/// Column name -> fill policy. Part of the pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationPolicy {
    pub rules: Vec<ImputationRule>,
}

#[derive(Error, Debug)]
pub enum ImputeError {
    #[error("Imputation rule references column '{0}', which is not in the data.")]
    UnknownColumn(String),
    #[error("Imputation rule references the label column '{0}'; labels are never imputed.")]
    LabelColumn(String),
    #[error("Column '{0}' has more than one imputation rule.")]
    DuplicateRule(String),
    #[error(
        "Column '{column}' has no non-missing training values, so no {policy:?} fill value can be derived."
    )]
    NoStatistic { column: String, policy: FillPolicy },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// A frozen fill value for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillValue {
    pub column: String,
    pub policy: FillPolicy,
    pub value: f64,
}

/// Fill values computed once from a training partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedImputer {
    pub fills: Vec<FillValue>,
}

impl ImputationPolicy {
    pub fn new(rules: Vec<ImputationRule>) -> Self {
        Self { rules }
    }

    /// The policy used for the v1 lending schema plus its derived features.
    ///
    /// Counts of adverse events default to zero, "months since" counters to the
    /// longest observed gap, and balances and ratios to the training mean.
    pub fn lending_default() -> Self {
        use FillPolicy::*;
        let rule = |column: &str, fill| ImputationRule {
            column: column.to_string(),
            fill,
        };
        Self::new(vec![
            rule(columns::DELINQ_2YRS, Zero),
            rule(columns::PUB_REC, Zero),
            rule(columns::INQ_LAST_12M, Zero),
            rule(columns::MORT_ACC, Zero),
            rule(columns::NUM_ACTV_BC_TL, Zero),
            rule(columns::OPEN_ACC, Zero),
            rule(columns::TOTAL_ACC, Zero),
            rule(columns::REVOL_BAL, Zero),
            rule(columns::MTHS_SINCE_RECENT_INQ, TrainingMax),
            rule(columns::MO_SIN_OLD_REV_TL_OP, TrainingMax),
            rule(columns::EMP_LENGTH, TrainingMean),
            rule(columns::DTI, TrainingMean),
            rule(columns::REVOL_UTIL, TrainingMean),
            rule(columns::ALL_UTIL, TrainingMean),
            rule(columns::BC_UTIL, TrainingMean),
            rule(columns::BC_OPEN_TO_BUY, TrainingMean),
            rule(columns::PERCENT_BC_GT_75, TrainingMean),
            rule(columns::TOT_CUR_BAL, TrainingMean),
            rule(columns::TOTAL_BAL_EX_MORT, TrainingMean),
            rule(columns::TOTAL_IL_HIGH_CREDIT_LIMIT, TrainingMean),
            rule(derive::JOINT_INCOME, TrainingMean),
            rule(derive::JOINT_DTI, TrainingMean),
            rule(derive::LOAN_TO_INCOME, TrainingMean),
            rule(derive::INSTALLMENT_PCT_INCOME, TrainingMean),
            rule(derive::ADJUSTED_DTI, TrainingMean),
        ])
    }

    /// The same policy minus every rule on `absent`, for optional columns the
    /// source table does not carry. Those columns stay entirely missing and so
    /// never become selection candidates.
    pub fn without_columns(&self, absent: &[String]) -> Self {
        let (dropped, rules): (Vec<_>, Vec<_>) = self
            .rules
            .iter()
            .cloned()
            .partition(|rule| absent.contains(&rule.column));
        if !dropped.is_empty() {
            log::warn!(
                "Skipping imputation for columns the source table lacks: {}",
                dropped
                    .iter()
                    .map(|rule| rule.column.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Self::new(rules)
    }

    /// Freezes fill values from `train`.
    ///
    /// Every rule is checked against the table up front; a rule naming an absent
    /// column or the label is a configuration error reported here, not at
    /// prediction time.
    pub fn fit(&self, train: &ApplicantTable) -> Result<FittedImputer, ImputeError> {
        let mut seen = ahash::AHashSet::with_capacity(self.rules.len());
        for rule in &self.rules {
            if rule.column == train.target_name() {
                return Err(ImputeError::LabelColumn(rule.column.clone()));
            }
            if !train.has_numeric(&rule.column) {
                return Err(ImputeError::UnknownColumn(rule.column.clone()));
            }
            if !seen.insert(rule.column.as_str()) {
                return Err(ImputeError::DuplicateRule(rule.column.clone()));
            }
        }

        let mut fills = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let values = train
                .numeric(&rule.column)
                .ok_or_else(|| ImputeError::UnknownColumn(rule.column.clone()))?;
            let present = values.iter().filter_map(|v| v.filter(|x| x.is_finite()));

            let value = match rule.fill {
                FillPolicy::Zero => Some(0.0),
                FillPolicy::TrainingMax => present.reduce(f64::max),
                FillPolicy::TrainingMean => {
                    let (sum, count) = present.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                    (count > 0).then(|| sum / count as f64)
                }
            };
            let value = value.ok_or_else(|| ImputeError::NoStatistic {
                column: rule.column.clone(),
                policy: rule.fill,
            })?;

            log::debug!("Imputer: '{}' -> {:?} = {:.6}", rule.column, rule.fill, value);
            fills.push(FillValue {
                column: rule.column.clone(),
                policy: rule.fill,
                value,
            });
        }
        Ok(FittedImputer { fills })
    }
}

impl Default for ImputationPolicy {
    fn default() -> Self {
        Self::lending_default()
    }
}

impl FittedImputer {
    pub fn fill_value(&self, column: &str) -> Option<f64> {
        self.fills
            .iter()
            .find(|f| f.column == column)
            .map(|f| f.value)
    }

    /// Returns a copy of `table` with every missing or non-finite cell of a
    /// covered column replaced by its frozen fill value.
    pub fn apply(&self, table: &ApplicantTable) -> Result<ApplicantTable, ImputeError> {
        let mut imputed = table.clone();
        let mut filled = 0usize;
        for fill in &self.fills {
            let values = table
                .numeric(&fill.column)
                .ok_or_else(|| ImputeError::UnknownColumn(fill.column.clone()))?;
            let replaced: Vec<Option<f64>> = values
                .iter()
                .map(|&v| {
                    if is_present(v) {
                        v
                    } else {
                        filled += 1;
                        Some(fill.value)
                    }
                })
                .collect();
            imputed.upsert_numeric(&fill.column, replaced)?;
        }
        log::debug!(
            "Imputed {} cells across {} columns of {} rows.",
            filled,
            self.fills.len(),
            table.len()
        );
        Ok(imputed)
    }
}
