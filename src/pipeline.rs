//! # Offline Training Pipeline
//!
//! Turns one warehouse table into a publishable model:
//!
//! - **Fetch:** open a warehouse session, project the declared schema columns the
//!   table actually has, keep rows with a target, release the session.
//! - **Prepare:** normalize text cells, build the applicant table, append derived
//!   features, split into train and test.
//! - **Impute:** fit fill values on the training partition only, then apply them
//!   to both partitions.
//! - **Select:** cross-validate a LASSO path over the candidate features.
//! - **Reduce:** retrain an unpenalized model on the configured reduced feature
//!   set, score it on the test partition, and index the cleaned (un-imputed)
//!   training rows for comparison queries.

use crate::config::{ConfigError, PipelineConfig};
use crate::fit::lasso::{LassoError, PenaltyGrid};
use crate::fit::model::{ArtifactError, ComparisonDefaults, ModelArtifact, ModelRegistry};
use crate::fit::reduced::{FitMetrics, ModelError, ReducedModel};
use crate::fit::select::{SelectionError, SelectionReport};
use crate::prepare::derive;
use crate::prepare::impute::{FittedImputer, ImputeError};
use crate::prepare::schema::{LoanSchema, SchemaError};
use crate::prepare::table::{ApplicantTable, TableError};
use crate::prepare::warehouse::{TableQuery, Warehouse, WarehouseError};
use crate::serve::similarity::{SimilarityError, SimilarityIndex};
use itertools::Itertools;
use std::path::PathBuf;
use thiserror::Error;

// ========================================================================================
//                                  ERROR HANDLING
// ========================================================================================

/// Coarse failure categories a caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration or declared schema cannot work with this data.
    Configuration,
    /// Too few rows survive for the requested operation.
    InsufficientData,
    /// A required value is absent where no imputation applies.
    MissingValue,
    /// The numerical routines could not produce a trustworthy answer.
    Numerical,
    Io,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Warehouse access failed: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("Schema check failed: {0}")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Imputation failed: {0}")]
    Impute(#[from] ImputeError),
    #[error("Penalty grid could not be built: {0}")]
    Lasso(#[from] LassoError),
    #[error("Feature selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error("Reduced model failed: {0}")]
    Model(#[from] ModelError),
    #[error("Similarity index failed: {0}")]
    Similarity(#[from] SimilarityError),
    #[error("Artifact store failed: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("Reduced feature '{0}' is not a numeric column of the prepared data.")]
    UnknownFeature(String),
    #[error("No candidate feature is complete after imputation; add imputation rules or list candidates.")]
    NoCandidates,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        use ErrorKind::*;
        match self {
            Self::Config(ConfigError::IoError(_)) => Io,
            Self::Config(_) | Self::Schema(_) | Self::UnknownFeature(_) | Self::NoCandidates => {
                Configuration
            }
            Self::Warehouse(WarehouseError::UnknownTable { .. })
            | Self::Warehouse(WarehouseError::UnknownColumn { .. }) => Configuration,
            Self::Warehouse(_) => Io,
            Self::Table(e) => table_kind(e),
            Self::Impute(ImputeError::Table(e)) => table_kind(e),
            Self::Impute(_) => Configuration,
            Self::Lasso(LassoError::InvalidGrid(_)) => Configuration,
            Self::Lasso(_) => Numerical,
            Self::Selection(SelectionError::InsufficientData { .. }) => InsufficientData,
            Self::Selection(SelectionError::TooFewFolds(_)) => Configuration,
            Self::Selection(_) => Numerical,
            Self::Model(ModelError::InsufficientData { .. }) => InsufficientData,
            Self::Model(ModelError::MissingValue(_)) => MissingValue,
            Self::Model(ModelError::NoFeatures) => Configuration,
            Self::Model(ModelError::Table(e)) => table_kind(e),
            Self::Model(_) => Numerical,
            Self::Similarity(SimilarityError::Empty) => InsufficientData,
            Self::Similarity(SimilarityError::MissingValue(_)) => MissingValue,
            Self::Similarity(SimilarityError::Csv(_) | SimilarityError::IoError(_)) => Io,
            Self::Similarity(_) => Configuration,
            Self::Artifact(ArtifactError::IoError(_)) => Io,
            Self::Artifact(_) => Configuration,
        }
    }
}

fn table_kind(error: &TableError) -> ErrorKind {
    match error {
        TableError::MissingValue { .. } => ErrorKind::MissingValue,
        TableError::DegenerateSplit { .. } => ErrorKind::InsufficientData,
        TableError::UnknownColumn(_)
        | TableError::LengthMismatch { .. }
        | TableError::Schema(_) => ErrorKind::Configuration,
        TableError::PolarsError(_) => ErrorKind::Io,
    }
}

// ========================================================================================
//                                  PIPELINE RESULTS
// ========================================================================================

/// Row counts at each stage, for the training summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub fetched: usize,
    pub labelled: usize,
    pub train: usize,
    pub test: usize,
    pub selection: usize,
    pub reference: usize,
}

#[derive(Debug)]
pub struct TrainingOutcome {
    pub schema_version: u32,
    pub rows: RowCounts,
    pub candidates: Vec<String>,
    pub selection: SelectionReport,
    pub reduced: ReducedModel,
    pub imputer: FittedImputer,
    pub holdout: FitMetrics,
    pub index: SimilarityIndex,
    pub comparison: ComparisonDefaults,
}

/// Where a published model landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedModel {
    pub name: String,
    pub version: String,
    pub directory: PathBuf,
}

impl TrainingOutcome {
    pub fn to_artifact(&self, name: &str, version: &str) -> ModelArtifact {
        ModelArtifact {
            name: name.to_string(),
            version: version.to_string(),
            schema_version: self.schema_version,
            target: self.reduced.target.clone(),
            comparison: self.comparison,
            holdout: Some(self.holdout),
            reduced: self.reduced.clone(),
            imputer: self.imputer.clone(),
            selection: Some(self.selection.summary()),
        }
    }

    /// Saves the artifact and its reference rows. With no `version`, the
    /// registry's next free version is used.
    pub fn publish(
        &self,
        registry: &ModelRegistry,
        name: &str,
        version: Option<&str>,
    ) -> Result<PublishedModel, PipelineError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => registry.next_version(name)?,
        };
        let directory = registry.save(&self.to_artifact(name, &version))?;
        self.index
            .write_reference(&registry.reference_path(name, &version)?)?;
        Ok(PublishedModel {
            name: name.to_string(),
            version,
            directory,
        })
    }
}

// ========================================================================================
//                                  ORCHESTRATION
// ========================================================================================

pub struct TrainingPipeline {
    config: PipelineConfig,
    schema: LoanSchema,
}

impl TrainingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            schema: LoanSchema::v1(),
        })
    }

    pub fn with_schema(mut self, schema: LoanSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, warehouse: &dyn Warehouse) -> Result<TrainingOutcome, PipelineError> {
        let mut rows = RowCounts::default();

        // --- Fetch ---
        let (frame, absent) = {
            let mut session = warehouse.open()?;
            let table = &self.config.warehouse.table;
            let header = session.fetch(&TableQuery::table(table).limit(0))?;
            let (available, absent): (Vec<String>, Vec<String>) = self
                .schema
                .column_names()
                .into_iter()
                .partition(|name| header.get_column_index(name).is_some());
            let mut query = TableQuery::table(table)
                .select(available)
                .require(&self.schema.target()?.name);
            if let Some(limit) = self.config.warehouse.limit {
                query = query.limit(limit);
            }
            (session.fetch(&query)?, absent)
        };
        rows.fetched = frame.height();

        // --- Prepare ---
        let normalized = self.schema.normalize(&frame)?;
        let table = ApplicantTable::from_frame(&normalized, &self.schema)?;
        let table = derive::derive_table(&table)?;
        rows.labelled = table.len();

        let features = &self.config.reduced.features;
        if let Some(unknown) = features.iter().find(|f| !table.has_numeric(f)) {
            return Err(PipelineError::UnknownFeature(unknown.clone()));
        }

        let split = &self.config.split;
        let (train, test) = table.split(split.test_fraction, split.seed)?;
        rows.train = train.len();
        rows.test = test.len();
        log::info!(
            "Prepared {} labelled rows: {} train, {} test.",
            table.len(),
            train.len(),
            test.len()
        );

        // --- Impute ---
        let imputer = self
            .config
            .imputation
            .without_columns(&absent)
            .fit(&train)?;
        let train_imputed = imputer.apply(&train)?;
        let test_imputed = imputer.apply(&test)?;

        // --- Select ---
        let candidates = self.candidates(&train_imputed)?;
        let complete = train_imputed.complete_rows(&candidates)?;
        let (x, y) = train_imputed
            .select_rows(&complete)
            .design_matrix(&candidates)?;
        rows.selection = x.nrows();

        let selection = &self.config.selection;
        let selector = selection.selector();
        let grid = match (selection.lambda_min, selection.lambda_max) {
            (Some(lo), Some(hi)) => PenaltyGrid::log_spaced(lo, hi, selection.penalties)?,
            _ => selector.penalty_grid(
                &candidates,
                x.view(),
                y.view(),
                selection.penalties,
                selection.lambda_ratio,
            )?,
        };
        let report = selector.fit(&candidates, x.view(), y.view(), &grid)?;

        // --- Reduce ---
        let reduced = ReducedModel::fit(&train_imputed, features)?;
        let holdout = reduced.evaluate(&test_imputed)?;
        log::info!(
            "Reduced model on [{}]: held-out RMSE {:.4}, R^2 {:.4} over {} rows.",
            features.iter().join(", "),
            holdout.rmse,
            holdout.r_squared,
            holdout.rows
        );

        let index = SimilarityIndex::build(&train, features)?;
        rows.reference = index.len();

        Ok(TrainingOutcome {
            schema_version: self.schema.version,
            rows,
            candidates,
            selection: report,
            reduced,
            imputer,
            holdout,
            index,
            comparison: self.config.comparison,
        })
    }

    /// Configured candidates, or every numeric column with no gaps left after imputation.
    fn candidates(&self, train: &ApplicantTable) -> Result<Vec<String>, PipelineError> {
        let configured = &self.config.selection.candidates;
        if !configured.is_empty() {
            if let Some(unknown) = configured.iter().find(|f| !train.has_numeric(f)) {
                return Err(PipelineError::UnknownFeature(unknown.clone()));
            }
            return Ok(configured.clone());
        }

        let mut candidates = Vec::new();
        let mut incomplete = Vec::new();
        for name in train.numeric_names() {
            if train.missing_count(name)? == 0 {
                candidates.push(name.to_string());
            } else {
                incomplete.push(name);
            }
        }
        if !incomplete.is_empty() {
            log::warn!(
                "Left out of selection because they still have gaps: {}",
                incomplete.iter().join(", ")
            );
        }
        if candidates.is_empty() {
            return Err(PipelineError::NoCandidates);
        }
        Ok(candidates)
    }
}
