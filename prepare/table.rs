//! # Applicant Table
//!
//! A small, column-oriented store for cleaned applicant rows. Every stage of the
//! offline pipeline takes a table by reference and hands back a fresh one, so no
//! stage ever mutates data another stage can see.
//!
//! The target column is held separately and is never missing: rows without a
//! target are dropped when the table is built from a warehouse frame.

use crate::prepare::schema::{ColumnKind, LoanSchema, SchemaError};
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("Column '{0}' does not exist in the applicant table.")]
    UnknownColumn(String),
    #[error("Column '{column}' has {found} values but the table has {expected} rows.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Row {row} has no usable value for required feature '{column}'.")]
    MissingValue { row: usize, column: String },
    #[error("A split with test fraction {fraction} of {rows} rows leaves one side empty.")]
    DegenerateSplit { rows: usize, fraction: f64 },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Column-oriented applicant rows with a never-missing target.
#[derive(Debug, Clone)]
pub struct ApplicantTable {
    target_name: String,
    target: Vec<f64>,
    numeric: Vec<(String, Vec<Option<f64>>)>,
    categorical: Vec<(String, Vec<Option<String>>)>,
    numeric_index: AHashMap<String, usize>,
    categorical_index: AHashMap<String, usize>,
}

/// A read-only view of one row of an [`ApplicantTable`].
#[derive(Debug, Clone, Copy)]
pub struct ApplicantRecord<'a> {
    table: &'a ApplicantTable,
    row: usize,
}

impl<'a> ApplicantRecord<'a> {
    pub fn row(&self) -> usize {
        self.row
    }

    /// The value of a numeric column, or `None` if the column is absent or the cell is missing.
    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.table.numeric(name).and_then(|values| values[self.row])
    }

    pub fn categorical(&self, name: &str) -> Option<&'a str> {
        self.table
            .categorical(name)
            .and_then(|values| values[self.row].as_deref())
    }

    pub fn target(&self) -> f64 {
        self.table.target[self.row]
    }
}

impl ApplicantTable {
    /// An empty-columned table holding only the target.
    pub fn new(target_name: &str, target: Vec<f64>) -> Self {
        Self {
            target_name: target_name.to_string(),
            target,
            numeric: Vec::new(),
            categorical: Vec::new(),
            numeric_index: AHashMap::new(),
            categorical_index: AHashMap::new(),
        }
    }

    /// Builder-style numeric column insertion. Replaces a column of the same name.
    pub fn with_numeric(
        mut self,
        name: &str,
        values: Vec<Option<f64>>,
    ) -> Result<Self, TableError> {
        self.upsert_numeric(name, values)?;
        Ok(self)
    }

    pub fn with_categorical(
        mut self,
        name: &str,
        values: Vec<Option<String>>,
    ) -> Result<Self, TableError> {
        self.check_len(name, values.len())?;
        match self.categorical_index.get(name) {
            Some(&slot) => self.categorical[slot].1 = values,
            None => {
                self.categorical_index
                    .insert(name.to_string(), self.categorical.len());
                self.categorical.push((name.to_string(), values));
            }
        }
        Ok(self)
    }

    /// Builds a table from a schema-normalized frame.
    ///
    /// Rows whose target is missing are dropped. Optional columns the frame lacks
    /// become entirely missing columns so downstream stages see a stable layout.
    pub fn from_frame(frame: &DataFrame, schema: &LoanSchema) -> Result<Self, TableError> {
        let target_spec = schema.target()?;
        let target = float_column(frame, &target_spec.name)?
            .ok_or_else(|| TableError::UnknownColumn(target_spec.name.clone()))?;
        let keep: Vec<usize> = target
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|_| i))
            .collect();
        let dropped = target.len() - keep.len();
        if dropped > 0 {
            log::info!(
                "Dropped {} of {} rows with no '{}' value.",
                dropped,
                target.len(),
                target_spec.name
            );
        }

        let target_values = keep.iter().filter_map(|&i| target[i]).collect();
        let mut table = Self::new(&target_spec.name, target_values);

        for spec in &schema.columns {
            match spec.kind {
                ColumnKind::Target => {}
                ColumnKind::Numeric => {
                    let values = match float_column(frame, &spec.name)? {
                        Some(all) => keep.iter().map(|&i| all[i]).collect(),
                        None => vec![None; keep.len()],
                    };
                    table.upsert_numeric(&spec.name, values)?;
                }
                ColumnKind::Categorical => {
                    let values = match text_column(frame, &spec.name)? {
                        Some(all) => keep.iter().map(|&i| all[i].clone()).collect(),
                        None => vec![None; keep.len()],
                    };
                    table = table.with_categorical(&spec.name, values)?;
                }
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn target(&self) -> &[f64] {
        &self.target
    }

    pub fn numeric(&self, name: &str) -> Option<&[Option<f64>]> {
        self.numeric_index
            .get(name)
            .map(|&slot| self.numeric[slot].1.as_slice())
    }

    pub fn categorical(&self, name: &str) -> Option<&[Option<String>]> {
        self.categorical_index
            .get(name)
            .map(|&slot| self.categorical[slot].1.as_slice())
    }

    pub fn has_numeric(&self, name: &str) -> bool {
        self.numeric_index.contains_key(name)
    }

    /// Numeric column names in insertion order.
    pub fn numeric_names(&self) -> impl Iterator<Item = &str> {
        self.numeric.iter().map(|(name, _)| name.as_str())
    }

    pub fn record(&self, row: usize) -> ApplicantRecord<'_> {
        ApplicantRecord { table: self, row }
    }

    pub fn records(&self) -> impl Iterator<Item = ApplicantRecord<'_>> {
        (0..self.len()).map(move |row| self.record(row))
    }

    /// Number of missing (or non-finite) cells in a numeric column.
    pub fn missing_count(&self, name: &str) -> Result<usize, TableError> {
        let values = self
            .numeric(name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))?;
        Ok(values.iter().filter(|v| !is_present(**v)).count())
    }

    /// Inserts or replaces a numeric column in place. Only stages that already
    /// own a private copy of the table call this.
    pub(crate) fn upsert_numeric(
        &mut self,
        name: &str,
        values: Vec<Option<f64>>,
    ) -> Result<(), TableError> {
        self.check_len(name, values.len())?;
        match self.numeric_index.get(name) {
            Some(&slot) => self.numeric[slot].1 = values,
            None => {
                self.numeric_index.insert(name.to_string(), self.numeric.len());
                self.numeric.push((name.to_string(), values));
            }
        }
        Ok(())
    }

    fn check_len(&self, name: &str, found: usize) -> Result<(), TableError> {
        if found != self.len() {
            return Err(TableError::LengthMismatch {
                column: name.to_string(),
                expected: self.len(),
                found,
            });
        }
        Ok(())
    }

    /// A new table holding the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let numeric: Vec<(String, Vec<Option<f64>>)> = self
            .numeric
            .iter()
            .map(|(name, values)| (name.clone(), rows.iter().map(|&r| values[r]).collect()))
            .collect();
        let categorical: Vec<(String, Vec<Option<String>>)> = self
            .categorical
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    rows.iter().map(|&r| values[r].clone()).collect(),
                )
            })
            .collect();
        Self {
            target_name: self.target_name.clone(),
            target: rows.iter().map(|&r| self.target[r]).collect(),
            numeric,
            categorical,
            numeric_index: self.numeric_index.clone(),
            categorical_index: self.categorical_index.clone(),
        }
    }

    /// Seeded random partition into `(train, test)`.
    pub fn split(&self, test_fraction: f64, seed: u64) -> Result<(Self, Self), TableError> {
        let rows = self.len();
        let test_rows = (rows as f64 * test_fraction).round() as usize;
        if !(0.0..1.0).contains(&test_fraction) || test_rows == 0 || test_rows >= rows {
            return Err(TableError::DegenerateSplit {
                rows,
                fraction: test_fraction,
            });
        }

        let mut order: Vec<usize> = (0..rows).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let (test_idx, train_idx) = order.split_at(test_rows);

        let mut train_idx = train_idx.to_vec();
        let mut test_idx = test_idx.to_vec();
        train_idx.sort_unstable();
        test_idx.sort_unstable();
        Ok((self.select_rows(&train_idx), self.select_rows(&test_idx)))
    }

    /// Indices of rows where every named feature holds a finite value.
    pub fn complete_rows(&self, features: &[String]) -> Result<Vec<usize>, TableError> {
        let columns = self.feature_columns(features)?;
        Ok((0..self.len())
            .filter(|&row| columns.iter().all(|values| is_present(values[row])))
            .collect())
    }

    /// Dense design matrix `[rows, features]` plus the target vector.
    ///
    /// Any missing cell is an error naming the first offending row; callers that
    /// want to skip such rows should filter with [`Self::complete_rows`] first.
    pub fn design_matrix(
        &self,
        features: &[String],
    ) -> Result<(Array2<f64>, Array1<f64>), TableError> {
        let columns = self.feature_columns(features)?;
        let mut x = Array2::<f64>::zeros((self.len(), features.len()));
        for (j, values) in columns.iter().enumerate() {
            for (row, value) in values.iter().enumerate() {
                match value {
                    Some(v) if v.is_finite() => x[[row, j]] = *v,
                    _ => {
                        return Err(TableError::MissingValue {
                            row,
                            column: features[j].clone(),
                        });
                    }
                }
            }
        }
        Ok((x, Array1::from_vec(self.target.clone())))
    }

    fn feature_columns(&self, features: &[String]) -> Result<Vec<&[Option<f64>]>, TableError> {
        features
            .iter()
            .map(|name| {
                self.numeric(name)
                    .ok_or_else(|| TableError::UnknownColumn(name.clone()))
            })
            .collect()
    }
}

/// A cell counts as present when it holds a finite number.
pub fn is_present(value: Option<f64>) -> bool {
    value.is_some_and(f64::is_finite)
}

fn float_column(frame: &DataFrame, name: &str) -> Result<Option<Vec<Option<f64>>>, TableError> {
    if frame.get_column_index(name).is_none() {
        return Ok(None);
    }
    let casted = frame.column(name)?.cast(&DataType::Float64)?;
    let values = casted
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect();
    Ok(Some(values))
}

fn text_column(frame: &DataFrame, name: &str) -> Result<Option<Vec<Option<String>>>, TableError> {
    if frame.get_column_index(name).is_none() {
        return Ok(None);
    }
    let casted = frame.column(name)?.cast(&DataType::String)?;
    let values = casted
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect();
    Ok(Some(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::schema::{CellTransform, ColumnSpec};

    fn schema() -> LoanSchema {
        LoanSchema::new(
            1,
            vec![
                ColumnSpec::new("rate", ColumnKind::Target, CellTransform::Percent, true),
                ColumnSpec::new("amount", ColumnKind::Numeric, CellTransform::Plain, true),
                ColumnSpec::new("kind", ColumnKind::Categorical, CellTransform::Plain, true),
                ColumnSpec::new("joint", ColumnKind::Numeric, CellTransform::Plain, false),
            ],
        )
        .unwrap()
    }

    fn sample_table(rows: usize) -> ApplicantTable {
        let target = (0..rows).map(|i| i as f64).collect();
        ApplicantTable::new("rate", target)
            .with_numeric("amount", (0..rows).map(|i| Some(i as f64 * 10.0)).collect())
            .unwrap()
    }

    #[test]
    fn rows_without_target_are_dropped() {
        let frame = DataFrame::new(vec![
            Series::new("rate".into(), vec![Some(10.0), None, Some(12.5)]).into(),
            Series::new("amount".into(), vec![Some(1.0), Some(2.0), None]).into(),
            Series::new("kind".into(), vec!["Individual", "Joint App", "Individual"]).into(),
        ])
        .unwrap();

        let table = ApplicantTable::from_frame(&frame, &schema()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.target(), &[10.0, 12.5]);
        assert_eq!(table.numeric("amount").unwrap(), &[Some(1.0), None]);
        assert_eq!(table.record(1).categorical("kind"), Some("Individual"));
        // Absent optional column is materialised as all-missing.
        assert_eq!(table.numeric("joint").unwrap(), &[None, None]);
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let table = sample_table(50);
        let (train_a, test_a) = table.split(0.2, 11).unwrap();
        let (train_b, test_b) = table.split(0.2, 11).unwrap();
        assert_eq!(train_a.len(), 40);
        assert_eq!(test_a.len(), 10);
        assert_eq!(train_a.target(), train_b.target());
        assert_eq!(test_a.target(), test_b.target());

        let mut all: Vec<f64> = train_a.target().iter().chain(test_a.target()).copied().collect();
        all.sort_by(f64::total_cmp);
        assert_eq!(all, table.target());
    }

    #[test]
    fn degenerate_split_is_rejected() {
        let table = sample_table(3);
        assert!(matches!(
            table.split(0.01, 1),
            Err(TableError::DegenerateSplit { rows: 3, .. })
        ));
    }

    #[test]
    fn design_matrix_reports_missing_cells() {
        let table = sample_table(3)
            .with_numeric("gap", vec![Some(1.0), None, Some(f64::NAN)])
            .unwrap();
        let features = vec!["amount".to_string(), "gap".to_string()];
        match table.design_matrix(&features) {
            Err(TableError::MissingValue { row, column }) => {
                assert_eq!(row, 1);
                assert_eq!(column, "gap");
            }
            other => panic!("Expected MissingValue, got {:?}", other),
        }
        assert_eq!(table.complete_rows(&features).unwrap(), vec![0]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = sample_table(3).with_numeric("short", vec![Some(1.0)]).unwrap_err();
        assert!(matches!(err, TableError::LengthMismatch { expected: 3, found: 1, .. }));
    }
}
