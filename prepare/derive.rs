//! # Derived Features
//!
//! Engineered ratios that put an application's size in the context of the income
//! it is judged against. Whether that income is the individual applicant's or the
//! joint household's is decided once per record by [`IncomeBasis`]; every ratio
//! below asks the basis rather than branching on the application type itself.
//!
//! Division by a zero income with a non-zero numerator produces `f64::INFINITY`,
//! an explicit sentinel that survives until the imputer replaces it. A missing
//! operand produces a missing value. Neither is ever an error.

use crate::prepare::schema::columns;
use crate::prepare::table::{ApplicantRecord, ApplicantTable, TableError};

pub const LOAN_TO_INCOME: &str = "loan_to_income";
pub const INSTALLMENT_PCT_INCOME: &str = "installment_pct_income";
pub const ADJUSTED_DTI: &str = "adjusted_dti";
pub const IL_UTIL_EX_MORTGAGE: &str = "il_util_ex_mortgage";
pub const JOINT_INCOME: &str = "joint_income";
pub const JOINT_DTI: &str = "joint_dti";

/// Names of every derived column, in the order they are appended to a table.
pub const DERIVED_FEATURES: [&str; 6] = [
    JOINT_INCOME,
    JOINT_DTI,
    LOAN_TO_INCOME,
    INSTALLMENT_PCT_INCOME,
    ADJUSTED_DTI,
    IL_UTIL_EX_MORTGAGE,
];

/// Which applicant's finances an application is judged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomeBasis {
    Individual,
    Joint,
}

impl IncomeBasis {
    /// Anything other than an explicit "Individual" application is judged jointly.
    pub fn resolve(application_type: Option<&str>) -> Self {
        match application_type.map(str::trim) {
            Some(kind) if kind.eq_ignore_ascii_case("individual") => Self::Individual,
            _ => Self::Joint,
        }
    }

    pub fn of(record: &ApplicantRecord<'_>) -> Self {
        Self::resolve(record.categorical(columns::APPLICATION_TYPE))
    }

    pub fn income(self, record: &ApplicantRecord<'_>) -> Option<f64> {
        match self {
            Self::Individual => record.numeric(columns::ANNUAL_INCOME),
            Self::Joint => joint_income(record),
        }
    }

    pub fn dti(self, record: &ApplicantRecord<'_>) -> Option<f64> {
        match self {
            Self::Individual => record.numeric(columns::DTI),
            Self::Joint => joint_dti(record),
        }
    }
}

/// First present value, in order.
pub fn coalesce(values: &[Option<f64>]) -> Option<f64> {
    values.iter().copied().flatten().next()
}

pub fn joint_income(record: &ApplicantRecord<'_>) -> Option<f64> {
    coalesce(&[
        record.numeric(columns::ANNUAL_INCOME_JOINT),
        record.numeric(columns::ANNUAL_INCOME),
    ])
}

pub fn joint_dti(record: &ApplicantRecord<'_>) -> Option<f64> {
    coalesce(&[
        record.numeric(columns::DTI_JOINT),
        record.numeric(columns::DTI),
    ])
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let (numerator, denominator) = (numerator?, denominator?);
    if denominator == 0.0 {
        if numerator == 0.0 {
            None
        } else {
            Some(f64::INFINITY.copysign(numerator))
        }
    } else {
        Some(numerator / denominator)
    }
}

/// Engineered features for one record, keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFeatureSet {
    basis: IncomeBasis,
    values: Vec<(&'static str, Option<f64>)>,
}

impl DerivedFeatureSet {
    pub fn basis(&self) -> IncomeBasis {
        self.basis
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .and_then(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<f64>)> + '_ {
        self.values.iter().copied()
    }
}

/// Computes every derived feature for a single record.
pub fn derive_record(record: &ApplicantRecord<'_>) -> DerivedFeatureSet {
    let basis = IncomeBasis::of(record);
    let income = basis.income(record);
    let loan = record.numeric(columns::LOAN_AMOUNT);

    let installment_pct_income = ratio(
        record.numeric(columns::INSTALLMENT).map(|monthly| monthly * 12.0),
        income,
    );
    let exposure = match (loan, record.numeric(columns::TOT_CUR_BAL)) {
        (Some(loan), Some(balance)) => Some(loan + balance),
        _ => None,
    };

    // Defined for every input: no positive limit, or nothing to divide, means no utilization.
    let il_util_ex_mortgage = match (
        record.numeric(columns::TOTAL_BAL_EX_MORT),
        record.numeric(columns::TOTAL_IL_HIGH_CREDIT_LIMIT),
    ) {
        (Some(balance), Some(limit)) if limit > 0.0 => balance / limit,
        _ => 0.0,
    };

    DerivedFeatureSet {
        basis,
        values: vec![
            (JOINT_INCOME, joint_income(record)),
            (JOINT_DTI, joint_dti(record)),
            (LOAN_TO_INCOME, ratio(loan, income)),
            (INSTALLMENT_PCT_INCOME, installment_pct_income),
            (ADJUSTED_DTI, ratio(exposure, income)),
            (IL_UTIL_EX_MORTGAGE, Some(il_util_ex_mortgage)),
        ],
    }
}

/// Returns a new table with every derived feature appended as a numeric column.
pub fn derive_table(table: &ApplicantTable) -> Result<ApplicantTable, TableError> {
    let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(table.len()); DERIVED_FEATURES.len()];
    let mut sentinels = 0usize;
    let mut joint_rows = 0usize;

    for record in table.records() {
        let features = derive_record(&record);
        if features.basis() == IncomeBasis::Joint {
            joint_rows += 1;
        }
        for (slot, (_, value)) in features.iter().enumerate() {
            if value.is_some_and(f64::is_infinite) {
                sentinels += 1;
            }
            columns[slot].push(value);
        }
    }

    if sentinels > 0 {
        log::warn!(
            "{} derived ratios divided by a zero income and were flagged as infinite.",
            sentinels
        );
    }
    log::debug!(
        "Derived {} features for {} rows ({} judged on joint income).",
        DERIVED_FEATURES.len(),
        table.len(),
        joint_rows
    );

    let mut derived = table.clone();
    for (name, values) in DERIVED_FEATURES.iter().zip(columns) {
        derived.upsert_numeric(name, values)?;
    }
    Ok(derived)
}

// --- Text parsing shared by the schema normalizer and the serving form ---

/// Parses a plain decimal number, tolerating surrounding whitespace.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    lexical_core::parse::<f64>(trimmed.as_bytes())
        .ok()
        .filter(|v| v.is_finite())
}

/// `"13.5%"` -> 13.5. A bare number is accepted as already being a percentage.
pub fn parse_percent(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    parse_number(trimmed.strip_suffix('%').unwrap_or(trimmed))
}

/// `" 36 months"` -> 36.
pub fn parse_leading_integer(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let digits = trimmed
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    lexical_core::parse::<u64>(&trimmed.as_bytes()[..digits])
        .ok()
        .map(|v| v as f64)
}

/// `"10+ years"` -> 10, `"< 1 year"` -> 0, `"n/a"` -> missing.
pub fn parse_employment_years(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.starts_with('<') {
        return Some(0.0);
    }
    parse_leading_integer(trimmed)
}
