//! Pipeline configuration, read from TOML.
//!
//! Every section has a complete default, so a file only needs the values it
//! changes. `ratecard init-config` writes the defaults out as a starting point.

use crate::fit::lasso::LassoOptions;
use crate::fit::model::ComparisonDefaults;
use crate::fit::reduced::DEFAULT_ZERO_TOLERANCE;
use crate::fit::select::{DEFAULT_FOLDS, FeatureSelector};
use crate::prepare::impute::ImputationPolicy;
use crate::prepare::schema::columns;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: [{section}] {message}")]
    Invalid { section: &'static str, message: String },
}

fn invalid(section: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Directory of delimited table extracts.
    pub root: PathBuf,
    pub table: String,
    pub separator: char,
    pub limit: Option<usize>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("warehouse"),
            table: "loans".to_string(),
            separator: ',',
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub folds: usize,
    pub seed: u64,
    /// Number of penalties on the grid.
    pub penalties: usize,
    /// With no explicit bounds, the grid spans `[lambda_ratio * lambda_max, lambda_max]`.
    pub lambda_ratio: f64,
    pub lambda_min: Option<f64>,
    pub lambda_max: Option<f64>,
    pub zero_tolerance: f64,
    pub strict_nesting: bool,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Candidate features. Empty means every complete numeric column after imputation.
    pub candidates: Vec<String>,
    pub show_progress: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        let lasso = LassoOptions::default();
        Self {
            folds: DEFAULT_FOLDS,
            seed: 7,
            penalties: 50,
            lambda_ratio: 1e-3,
            lambda_min: None,
            lambda_max: None,
            zero_tolerance: DEFAULT_ZERO_TOLERANCE,
            strict_nesting: false,
            max_iterations: lasso.max_iterations,
            tolerance: lasso.tolerance,
            candidates: Vec::new(),
            show_progress: true,
        }
    }
}

impl SelectionConfig {
    pub fn selector(&self) -> FeatureSelector {
        FeatureSelector {
            folds: self.folds,
            seed: self.seed,
            zero_tolerance: self.zero_tolerance,
            strict_nesting: self.strict_nesting,
            lasso: LassoOptions {
                max_iterations: self.max_iterations,
                tolerance: self.tolerance,
            },
            show_progress: self.show_progress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducedConfig {
    pub features: Vec<String>,
}

impl Default for ReducedConfig {
    fn default() -> Self {
        Self {
            features: vec![
                columns::TERM.to_string(),
                columns::ALL_UTIL.to_string(),
                columns::BC_UTIL.to_string(),
                columns::BC_OPEN_TO_BUY.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub name: String,
    /// With no version, the registry's next `v<N>` is used.
    pub version: Option<String>,
    pub registry: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            name: "interest-rate".to_string(),
            version: None,
            registry: PathBuf::from("models"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub warehouse: WarehouseConfig,
    pub split: SplitConfig,
    pub selection: SelectionConfig,
    pub reduced: ReducedConfig,
    pub comparison: ComparisonDefaults,
    pub artifact: ArtifactConfig,
    pub imputation: ImputationPolicy,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        log::info!("Loaded configuration from '{}'.", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warehouse.table.trim().is_empty() {
            return Err(invalid("warehouse", "table must not be empty"));
        }
        if !self.warehouse.separator.is_ascii() {
            return Err(invalid("warehouse", "separator must be a single ASCII character"));
        }
        let fraction = self.split.test_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(invalid(
                "split",
                format!("test_fraction must lie in (0, 1), got {fraction}"),
            ));
        }

        let s = &self.selection;
        if s.folds < 2 {
            return Err(invalid("selection", format!("folds must be at least 2, got {}", s.folds)));
        }
        if s.penalties < 2 {
            return Err(invalid("selection", "penalties must be at least 2"));
        }
        match (s.lambda_min, s.lambda_max) {
            (Some(lo), Some(hi)) if !(lo > 0.0 && hi > lo) => {
                return Err(invalid(
                    "selection",
                    format!("lambda range [{lo}, {hi}] must be positive and increasing"),
                ));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(invalid("selection", "set both lambda_min and lambda_max, or neither"));
            }
            _ => {}
        }
        if !(s.lambda_ratio > 0.0 && s.lambda_ratio < 1.0) {
            return Err(invalid("selection", "lambda_ratio must lie in (0, 1)"));
        }
        if !(s.tolerance > 0.0) || s.max_iterations == 0 {
            return Err(invalid("selection", "tolerance and max_iterations must be positive"));
        }

        if self.reduced.features.is_empty() {
            return Err(invalid("reduced", "features must name at least one column"));
        }
        if let Some(dup) = self
            .reduced
            .features
            .iter()
            .enumerate()
            .find(|(i, f)| self.reduced.features[..*i].contains(f))
            .map(|(_, f)| f)
        {
            return Err(invalid("reduced", format!("feature '{dup}' is listed twice")));
        }

        if self.comparison.k == 0 {
            return Err(invalid("comparison", "k must be at least 1"));
        }
        if !(self.comparison.bin_width.is_finite() && self.comparison.bin_width > 0.0) {
            return Err(invalid("comparison", "bin_width must be positive"));
        }
        if self.artifact.name.trim().is_empty() {
            return Err(invalid("artifact", "name must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_survive_toml() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        let text = config.to_toml().unwrap();
        assert_eq!(PipelineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [selection]
            folds = 5

            [reduced]
            features = ["term", "all_util"]
            "#,
        )
        .unwrap();
        assert_eq!(config.selection.folds, 5);
        assert_eq!(config.selection.penalties, 50);
        assert_eq!(config.reduced.features, vec!["term", "all_util"]);
        assert_eq!(config.comparison.k, 50);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        for text in [
            "[selection]\nfolds = 1",
            "[split]\ntest_fraction = 1.0",
            "[comparison]\nbin_width = 0.0",
            "[reduced]\nfeatures = []",
            "[reduced]\nfeatures = [\"term\", \"term\"]",
            "[selection]\nlambda_min = 1.0\nlambda_max = 0.1",
            "[selection]\nlambda_min = 1.0",
        ] {
            assert!(
                matches!(PipelineConfig::from_toml(text), Err(ConfigError::Invalid { .. })),
                "accepted: {text}"
            );
        }
    }
}
