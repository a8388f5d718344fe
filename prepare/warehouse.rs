//! # Warehouse Access
//!
//! The pipeline only needs read access to named tables with column projection,
//! a not-null filter and row counts. [`Warehouse`] hands out a [`WarehouseSession`]
//! per logical unit of work; the session is released when it is dropped, so no
//! connection outlives the work that needed it.
//!
//! [`CsvWarehouse`] serves a directory of delimited extracts and is what the CLI
//! and the tests use. Every column is read as text so the schema normalizer sees
//! the same loosely typed cells a live warehouse returns.

use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Table '{table}' was not found in the warehouse at '{location}'.")]
    UnknownTable { table: String, location: String },
    #[error("Table '{table}' has no column named '{column}'.")]
    UnknownColumn { table: String, column: String },
}

/// A read query: projection, a not-null filter and an optional row limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableQuery {
    pub table: String,
    /// Columns to return. Empty means every column.
    pub columns: Vec<String>,
    /// Rows with a null in any of these columns are filtered out.
    pub non_null: Vec<String>,
    pub limit: Option<usize>,
}

impl TableQuery {
    pub fn table(name: &str) -> Self {
        Self {
            table: name.to_string(),
            columns: Vec::new(),
            non_null: Vec::new(),
            limit: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn require(mut self, column: &str) -> Self {
        self.non_null.push(column.to_string());
        self
    }

    pub fn limit(mut self, rows: usize) -> Self {
        self.limit = Some(rows);
        self
    }
}

/// A scoped, read-only handle on the warehouse.
pub trait WarehouseSession {
    fn fetch(&mut self, query: &TableQuery) -> Result<DataFrame, WarehouseError>;

    /// Row count after the query's not-null filter, ignoring projection and limit.
    fn count(&mut self, query: &TableQuery) -> Result<usize, WarehouseError>;
}

pub trait Warehouse {
    fn open(&self) -> Result<Box<dyn WarehouseSession + '_>, WarehouseError>;
}

/// A warehouse backed by delimited files: table `t` is `<root>/t.csv`.
#[derive(Debug, Clone)]
pub struct CsvWarehouse {
    root: PathBuf,
    separator: u8,
}

impl CsvWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            separator: b',',
        }
    }

    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &str) -> Result<PathBuf, WarehouseError> {
        let path = self.root.join(format!("{table}.csv"));
        if !path.is_file() {
            return Err(WarehouseError::UnknownTable {
                table: table.to_string(),
                location: self.root.display().to_string(),
            });
        }
        Ok(path)
    }
}

impl Warehouse for CsvWarehouse {
    fn open(&self) -> Result<Box<dyn WarehouseSession + '_>, WarehouseError> {
        if !self.root.is_dir() {
            return Err(WarehouseError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("warehouse directory '{}' does not exist", self.root.display()),
            )));
        }
        log::debug!("Opened warehouse session on '{}'.", self.root.display());
        Ok(Box::new(CsvSession {
            warehouse: self,
            queries: 0,
        }))
    }
}

struct CsvSession<'w> {
    warehouse: &'w CsvWarehouse,
    queries: usize,
}

impl CsvSession<'_> {
    fn read_filtered(&mut self, query: &TableQuery) -> Result<DataFrame, WarehouseError> {
        self.queries += 1;
        let path = self.warehouse.table_path(&query.table)?;
        let frame = CsvReader::new(File::open(&path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(Some(0))
                    .with_parse_options(
                        CsvParseOptions::default().with_separator(self.warehouse.separator),
                    ),
            )
            .finish()?;

        for column in query.columns.iter().chain(&query.non_null) {
            if frame.get_column_index(column).is_none() {
                return Err(WarehouseError::UnknownColumn {
                    table: query.table.clone(),
                    column: column.clone(),
                });
            }
        }

        if query.non_null.is_empty() {
            return Ok(frame);
        }
        let mut keep = vec![true; frame.height()];
        for column in &query.non_null {
            let nulls = frame.column(column)?.as_materialized_series().is_null();
            for (slot, is_null) in keep.iter_mut().zip(&nulls) {
                if is_null.unwrap_or(true) {
                    *slot = false;
                }
            }
        }
        let mask = BooleanChunked::new("keep".into(), keep);
        Ok(frame.filter(&mask)?)
    }
}

impl WarehouseSession for CsvSession<'_> {
    fn fetch(&mut self, query: &TableQuery) -> Result<DataFrame, WarehouseError> {
        let mut frame = self.read_filtered(query)?;
        if !query.columns.is_empty() {
            frame = frame.select(query.columns.iter().map(String::as_str))?;
        }
        if let Some(limit) = query.limit {
            frame = frame.head(Some(limit));
        }
        log::info!(
            "Fetched {} rows x {} columns from '{}'.",
            frame.height(),
            frame.width(),
            query.table
        );
        Ok(frame)
    }

    fn count(&mut self, query: &TableQuery) -> Result<usize, WarehouseError> {
        Ok(self.read_filtered(query)?.height())
    }
}

impl Drop for CsvSession<'_> {
    fn drop(&mut self) {
        log::debug!(
            "Released warehouse session on '{}' after {} queries.",
            self.warehouse.root.display(),
            self.queries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn warehouse_with(table: &str, content: &str) -> (TempDir, CsvWarehouse) {
        let dir = TempDir::new().unwrap();
        let mut file = File::create(dir.path().join(format!("{table}.csv"))).unwrap();
        writeln!(file, "{}", content).unwrap();
        let warehouse = CsvWarehouse::new(dir.path());
        (dir, warehouse)
    }

    const LOANS: &str = "interest_rate,term,loan_amount\n13.5%,36 months,1000\n,60 months,2000\n7.1%,36 months,abc";

    #[test]
    fn fetch_projects_filters_and_reads_text() {
        let (_dir, warehouse) = warehouse_with("loans", LOANS);
        let mut session = warehouse.open().unwrap();
        let frame = session
            .fetch(
                &TableQuery::table("loans")
                    .select(["interest_rate", "loan_amount"])
                    .require("interest_rate"),
            )
            .unwrap();
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.column("loan_amount").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn count_and_limit() {
        let (_dir, warehouse) = warehouse_with("loans", LOANS);
        let mut session = warehouse.open().unwrap();
        assert_eq!(session.count(&TableQuery::table("loans")).unwrap(), 3);
        assert_eq!(
            session
                .count(&TableQuery::table("loans").require("interest_rate"))
                .unwrap(),
            2
        );
        let head = session.fetch(&TableQuery::table("loans").limit(1)).unwrap();
        assert_eq!(head.height(), 1);
    }

    #[test]
    fn unknown_table_and_column_are_reported() {
        let (_dir, warehouse) = warehouse_with("loans", LOANS);
        let mut session = warehouse.open().unwrap();
        assert!(matches!(
            session.fetch(&TableQuery::table("nope")),
            Err(WarehouseError::UnknownTable { .. })
        ));
        assert!(matches!(
            session.fetch(&TableQuery::table("loans").select(["grade"])),
            Err(WarehouseError::UnknownColumn { ref column, .. }) if column == "grade"
        ));
    }
}
