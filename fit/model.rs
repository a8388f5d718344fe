//! # Model Artifacts
//!
//! A published model is a directory `<root>/<name>/<version>/` holding:
//!
//! - `model.toml`: the [`ModelArtifact`] (reduced model, frozen imputer, selection
//!   summary, comparison defaults), human-readable and diffable.
//! - `reference.tsv`: the comparison reference rows written by the similarity index.
//!
//! Published versions are never overwritten. Versions order naturally, so `v10`
//! is later than `v9`.

use crate::fit::reduced::{FitMetrics, ReducedModel};
use crate::fit::select::SelectionSummary;
use crate::prepare::impute::FittedImputer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MODEL_FILE: &str = "model.toml";
pub const REFERENCE_FILE: &str = "reference.tsv";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("'{0}' is not a valid model name or version; use letters, digits, '-', '_' or '.'.")]
    InvalidName(String),
    #[error("Model '{name}' version '{version}' is already published.")]
    AlreadyPublished { name: String, version: String },
    #[error("Model '{name}' has no published version{}.", .version.as_ref().map(|v| format!(" '{v}'")).unwrap_or_default())]
    NotFound {
        name: String,
        version: Option<String>,
    },
}

/// Defaults the serving layer uses for comparison queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonDefaults {
    pub k: usize,
    pub bin_width: f64,
}

impl Default for ComparisonDefaults {
    fn default() -> Self {
        Self {
            k: 50,
            bin_width: 0.5,
        }
    }
}

/// Everything needed to serve a trained model, minus the reference rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    pub schema_version: u32,
    pub target: String,
    pub comparison: ComparisonDefaults,
    pub holdout: Option<FitMetrics>,
    pub reduced: ReducedModel,
    pub imputer: FittedImputer,
    pub selection: Option<SelectionSummary>,
}

impl ModelArtifact {
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact = toml::from_str(&toml_string)?;
        Ok(artifact)
    }
}

/// A directory-backed store of published artifacts keyed by name and version.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

fn check_name(name: &str) -> Result<(), ArtifactError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, name: &str, version: &str) -> Result<PathBuf, ArtifactError> {
        check_name(name)?;
        check_name(version)?;
        Ok(self.root.join(name).join(version))
    }

    pub fn reference_path(&self, name: &str, version: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.version_dir(name, version)?.join(REFERENCE_FILE))
    }

    /// Published versions of `name`, oldest first.
    pub fn versions(&self, name: &str) -> Result<Vec<String>, ArtifactError> {
        check_name(name)?;
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().join(MODEL_FILE).is_file() {
                if let Some(version) = entry.file_name().to_str() {
                    versions.push(version.to_string());
                }
            }
        }
        versions.sort_by(|a, b| natord::compare(a, b));
        Ok(versions)
    }

    pub fn latest(&self, name: &str) -> Result<String, ArtifactError> {
        self.versions(name)?
            .pop()
            .ok_or_else(|| ArtifactError::NotFound {
                name: name.to_string(),
                version: None,
            })
    }

    /// The first unused `v<N>` after the published versions.
    pub fn next_version(&self, name: &str) -> Result<String, ArtifactError> {
        let taken = self.versions(name)?;
        let mut n = taken.len() + 1;
        loop {
            let candidate = format!("v{n}");
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Writes `artifact` under its own name and version and returns its directory.
    pub fn save(&self, artifact: &ModelArtifact) -> Result<PathBuf, ArtifactError> {
        let dir = self.version_dir(&artifact.name, &artifact.version)?;
        let model_path = dir.join(MODEL_FILE);
        if model_path.exists() {
            return Err(ArtifactError::AlreadyPublished {
                name: artifact.name.clone(),
                version: artifact.version.clone(),
            });
        }
        fs::create_dir_all(&dir)?;
        artifact.save(&model_path)?;
        log::info!(
            "Saved model '{}' version '{}' to '{}'.",
            artifact.name,
            artifact.version,
            dir.display()
        );
        Ok(dir)
    }

    /// Loads `name` at `version`, or the latest version when none is given.
    pub fn load(&self, name: &str, version: Option<&str>) -> Result<ModelArtifact, ArtifactError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self.latest(name)?,
        };
        let path = self.version_dir(name, &version)?.join(MODEL_FILE);
        if !path.is_file() {
            return Err(ArtifactError::NotFound {
                name: name.to_string(),
                version: Some(version),
            });
        }
        ModelArtifact::load(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::normalize::{ColumnScale, NormalizationParameters};
    use crate::fit::reduced::{FeatureCoefficient, FittedModel};
    use crate::prepare::impute::{FillPolicy, FillValue};
    use tempfile::TempDir;

    fn artifact(version: &str) -> ModelArtifact {
        ModelArtifact {
            name: "rates".into(),
            version: version.into(),
            schema_version: 1,
            target: "interest_rate".into(),
            comparison: ComparisonDefaults::default(),
            holdout: Some(FitMetrics {
                rows: 10,
                rmse: 1.25,
                r_squared: 0.5,
            }),
            reduced: ReducedModel {
                target: "interest_rate".into(),
                model: FittedModel {
                    lambda: 0.0,
                    intercept: 12.0,
                    coefficients: vec![FeatureCoefficient {
                        feature: "term".into(),
                        coefficient: 1.5,
                    }],
                    normalization: NormalizationParameters {
                        columns: vec![ColumnScale {
                            name: "term".into(),
                            mean: 42.0,
                            std_dev: 10.5,
                        }],
                    },
                },
            },
            imputer: FittedImputer {
                fills: vec![FillValue {
                    column: "bc_util".into(),
                    policy: FillPolicy::TrainingMean,
                    value: 61.5,
                }],
            },
            selection: None,
        }
    }

    #[test]
    fn artifact_survives_a_toml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MODEL_FILE);
        let original = artifact("v1");
        original.save(&path).unwrap();
        assert_eq!(ModelArtifact::load(&path).unwrap(), original);
    }

    #[test]
    fn registry_orders_versions_naturally_and_refuses_overwrites() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(dir.path());
        assert!(matches!(
            registry.latest("rates"),
            Err(ArtifactError::NotFound { version: None, .. })
        ));

        for version in ["v2", "v10", "v9"] {
            registry.save(&artifact(version)).unwrap();
        }
        assert_eq!(registry.versions("rates").unwrap(), vec!["v2", "v9", "v10"]);
        assert_eq!(registry.latest("rates").unwrap(), "v10");
        assert_eq!(registry.load("rates", None).unwrap().version, "v10");
        assert_eq!(registry.next_version("rates").unwrap(), "v4");

        assert!(matches!(
            registry.save(&artifact("v9")),
            Err(ArtifactError::AlreadyPublished { .. })
        ));
        assert!(matches!(
            registry.load("rates", Some("v3")),
            Err(ArtifactError::NotFound { version: Some(_), .. })
        ));
    }

    #[test]
    fn path_like_names_are_rejected() {
        let registry = ModelRegistry::new("/tmp/unused");
        assert!(matches!(
            registry.version_dir("../etc", "v1"),
            Err(ArtifactError::InvalidName(_))
        ));
        assert!(matches!(
            registry.version_dir("rates", ".."),
            Err(ArtifactError::InvalidName(_))
        ));
    }
}
