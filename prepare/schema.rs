//! # Schema Normalization
//!
//! The warehouse hands back loosely typed columns: money amounts as integers,
//! rates as `"13.5%"` strings, loan terms as `"36 months"`. This module owns the
//! explicit, versioned list of columns the rest of the crate relies on and the
//! transform that turns each declared column into a clean `Float64` column.
//!
//! - Strict Schema: the set of columns is a fixed, enumerated list. It is
//!   validated against the frame the warehouse returns before anything else
//!   happens, so a renamed upstream column fails at startup rather than
//!   surfacing as a silently empty feature later.
//! - Cell-level Leniency: a single unparseable cell never fails the batch. It
//!   becomes a null and is dealt with by the imputer.

use crate::prepare::derive::{
    parse_employment_years, parse_leading_integer, parse_number, parse_percent,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical column names of the lending schema.
pub mod columns {
    pub const INTEREST_RATE: &str = "interest_rate";
    pub const LOAN_AMOUNT: &str = "loan_amount";
    pub const TERM: &str = "term";
    pub const INSTALLMENT: &str = "installment";
    pub const ANNUAL_INCOME: &str = "annual_income";
    pub const ANNUAL_INCOME_JOINT: &str = "annual_income_joint";
    pub const DTI: &str = "dti";
    pub const DTI_JOINT: &str = "dti_joint";
    pub const APPLICATION_TYPE: &str = "application_type";
    pub const EMP_LENGTH: &str = "emp_length";
    pub const ADDR_STATE: &str = "addr_state";
    pub const HOME_OWNERSHIP: &str = "home_ownership";
    pub const REVOL_UTIL: &str = "revol_util";
    pub const REVOL_BAL: &str = "revol_bal";
    pub const ALL_UTIL: &str = "all_util";
    pub const BC_UTIL: &str = "bc_util";
    pub const BC_OPEN_TO_BUY: &str = "bc_open_to_buy";
    pub const PERCENT_BC_GT_75: &str = "percent_bc_gt_75";
    pub const TOT_CUR_BAL: &str = "tot_cur_bal";
    pub const TOTAL_BAL_EX_MORT: &str = "total_bal_ex_mort";
    pub const TOTAL_IL_HIGH_CREDIT_LIMIT: &str = "total_il_high_credit_limit";
    pub const OPEN_ACC: &str = "open_acc";
    pub const TOTAL_ACC: &str = "total_acc";
    pub const MORT_ACC: &str = "mort_acc";
    pub const NUM_ACTV_BC_TL: &str = "num_actv_bc_tl";
    pub const INQ_LAST_12M: &str = "inq_last_12m";
    pub const DELINQ_2YRS: &str = "delinq_2yrs";
    pub const PUB_REC: &str = "pub_rec";
    pub const MTHS_SINCE_RECENT_INQ: &str = "mths_since_recent_inq";
    pub const MO_SIN_OLD_REV_TL_OP: &str = "mo_sin_old_rev_tl_op";
}

/// The role a declared column plays downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    /// The regression label. Numeric, and rows lacking it are excluded from training.
    Target,
}

impl ColumnKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Numeric | Self::Target)
    }
}

/// How a text cell is turned into a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellTransform {
    Plain,
    /// `"13.5%"` -> 13.5
    Percent,
    /// `"36 months"` -> 36
    LeadingInteger,
    /// `"10+ years"` -> 10, `"< 1 year"` -> 0
    EmploymentYears,
}

impl CellTransform {
    pub fn apply(self, cell: &str) -> Option<f64> {
        match self {
            Self::Plain => parse_number(cell),
            Self::Percent => parse_percent(cell),
            Self::LeadingInteger => parse_leading_integer(cell),
            Self::EmploymentYears => parse_employment_years(cell),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub transform: CellTransform,
    /// Required columns must be present in the warehouse frame. Optional columns
    /// that are absent are treated as entirely missing.
    pub required: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind, transform: CellTransform, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            transform,
            required,
        }
    }
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error(
        "The required column '{0}' was not found in the warehouse frame. The declared schema and the warehouse disagree."
    )]
    ColumnNotFound(String),
    #[error("Schema v{1} declares column '{0}' more than once.")]
    DuplicateColumn(String, u32),
    #[error("Schema v{0} must declare exactly one target column, found {1}.")]
    TargetCount(u32, usize),
}

/// An explicit, versioned lending schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanSchema {
    pub version: u32,
    pub columns: Vec<ColumnSpec>,
}

impl LoanSchema {
    /// Builds a schema, rejecting duplicate names and anything but a single target.
    pub fn new(version: u32, columns: Vec<ColumnSpec>) -> Result<Self, SchemaError> {
        let mut seen = ahash::AHashSet::with_capacity(columns.len());
        for spec in &columns {
            if !seen.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(spec.name.clone(), version));
            }
        }
        let targets = columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Target)
            .count();
        if targets != 1 {
            return Err(SchemaError::TargetCount(version, targets));
        }
        Ok(Self { version, columns })
    }

    /// The built-in lending schema, version 1.
    pub fn v1() -> Self {
        use CellTransform::*;
        use ColumnKind::*;
        use columns::*;

        let columns = vec![
            ColumnSpec::new(INTEREST_RATE, Target, Percent, true),
            ColumnSpec::new(LOAN_AMOUNT, Numeric, Plain, true),
            ColumnSpec::new(TERM, Numeric, LeadingInteger, true),
            ColumnSpec::new(INSTALLMENT, Numeric, Plain, true),
            ColumnSpec::new(ANNUAL_INCOME, Numeric, Plain, true),
            ColumnSpec::new(ANNUAL_INCOME_JOINT, Numeric, Plain, false),
            ColumnSpec::new(DTI, Numeric, Plain, true),
            ColumnSpec::new(DTI_JOINT, Numeric, Plain, false),
            ColumnSpec::new(APPLICATION_TYPE, Categorical, Plain, true),
            ColumnSpec::new(EMP_LENGTH, Numeric, EmploymentYears, false),
            ColumnSpec::new(ADDR_STATE, Categorical, Plain, false),
            ColumnSpec::new(HOME_OWNERSHIP, Categorical, Plain, false),
            ColumnSpec::new(REVOL_UTIL, Numeric, Percent, false),
            ColumnSpec::new(REVOL_BAL, Numeric, Plain, false),
            ColumnSpec::new(ALL_UTIL, Numeric, Percent, true),
            ColumnSpec::new(BC_UTIL, Numeric, Percent, true),
            ColumnSpec::new(BC_OPEN_TO_BUY, Numeric, Plain, true),
            ColumnSpec::new(PERCENT_BC_GT_75, Numeric, Percent, false),
            ColumnSpec::new(TOT_CUR_BAL, Numeric, Plain, true),
            ColumnSpec::new(TOTAL_BAL_EX_MORT, Numeric, Plain, true),
            ColumnSpec::new(TOTAL_IL_HIGH_CREDIT_LIMIT, Numeric, Plain, true),
            ColumnSpec::new(OPEN_ACC, Numeric, Plain, false),
            ColumnSpec::new(TOTAL_ACC, Numeric, Plain, false),
            ColumnSpec::new(MORT_ACC, Numeric, Plain, false),
            ColumnSpec::new(NUM_ACTV_BC_TL, Numeric, Plain, false),
            ColumnSpec::new(INQ_LAST_12M, Numeric, Plain, false),
            ColumnSpec::new(DELINQ_2YRS, Numeric, Plain, false),
            ColumnSpec::new(PUB_REC, Numeric, Plain, false),
            ColumnSpec::new(MTHS_SINCE_RECENT_INQ, Numeric, Plain, false),
            ColumnSpec::new(MO_SIN_OLD_REV_TL_OP, Numeric, Plain, false),
        ];
        Self {
            version: 1,
            columns,
        }
    }

    /// The single target column. A schema deserialized without going through
    /// [`Self::new`] may lack one, which is reported rather than assumed away.
    pub fn target(&self) -> Result<&ColumnSpec, SchemaError> {
        let mut targets = self.columns.iter().filter(|c| c.kind == ColumnKind::Target);
        match (targets.next(), targets.next()) {
            (Some(target), None) => Ok(target),
            _ => Err(SchemaError::TargetCount(
                self.version,
                self.columns
                    .iter()
                    .filter(|c| c.kind == ColumnKind::Target)
                    .count(),
            )),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The transform declared for `name`, or `Plain` for undeclared names.
    pub fn transform_for(&self, name: &str) -> CellTransform {
        self.column(name)
            .map(|c| c.transform)
            .unwrap_or(CellTransform::Plain)
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Numeric)
    }

    pub fn categorical_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Categorical)
    }

    /// All declared column names, in declaration order. Used as the warehouse projection.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Checks that every required column exists in `frame`.
    pub fn validate(&self, frame: &DataFrame) -> Result<(), SchemaError> {
        for spec in self.columns.iter().filter(|c| c.required) {
            if frame.get_column_index(&spec.name).is_none() {
                return Err(SchemaError::ColumnNotFound(spec.name.clone()));
            }
        }
        Ok(())
    }

    /// Produces a new frame in which every declared numeric column is `Float64`.
    ///
    /// Text cells go through the column's transform; anything that cannot be
    /// converted becomes null. Columns the schema does not mention are left as
    /// they are, and the input frame is never modified.
    pub fn normalize(&self, frame: &DataFrame) -> Result<DataFrame, SchemaError> {
        self.validate(frame)?;

        let mut normalized = frame.clone();
        let mut degraded_cells = 0usize;
        for spec in self.columns.iter().filter(|c| c.kind.is_numeric()) {
            if frame.get_column_index(&spec.name).is_none() {
                continue;
            }
            let column = frame.column(&spec.name)?;
            let (values, degraded) = numeric_cells(column, spec.transform)?;
            degraded_cells += degraded;
            normalized.with_column(Series::new(spec.name.as_str().into(), values))?;
        }

        if degraded_cells > 0 {
            log::warn!(
                "Schema v{}: {} non-empty cells could not be parsed and were set to missing.",
                self.version,
                degraded_cells
            );
        }
        Ok(normalized)
    }
}

/// Converts one column into optional floats, counting non-empty cells that
/// failed to parse.
fn numeric_cells(
    column: &Column,
    transform: CellTransform,
) -> Result<(Vec<Option<f64>>, usize), SchemaError> {
    let mut degraded = 0usize;
    let values = if column.dtype() == &DataType::String {
        column
            .as_materialized_series()
            .str()?
            .into_iter()
            .map(|cell| {
                let cell = cell?;
                let parsed = transform.apply(cell);
                if parsed.is_none() && !cell.trim().is_empty() {
                    degraded += 1;
                }
                parsed
            })
            .collect()
    } else {
        let casted = column.cast(&DataType::Float64)?;
        let chunked = casted.f64()?;
        chunked
            .into_iter()
            .map(|value| value.filter(|v| v.is_finite()))
            .collect()
    };
    Ok((values, degraded))
}
