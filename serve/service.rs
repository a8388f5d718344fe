//! # Rate Service
//!
//! The synchronous surface a form or web handler calls. It answers two questions
//! for one applicant: the predicted rate, and the rates paid by similar
//! historical applicants. Neither call returns an error; failures come back as
//! `Unavailable` with a reason the caller can show as-is.
//!
//! Comparisons are deterministic, so they are memoised in a concurrent map keyed
//! by the rounded query values plus `k`. The map holds at most
//! `cache_capacity` histograms; when it is full it is emptied and starts over.

use crate::fit::model::{ArtifactError, ComparisonDefaults, ModelArtifact, ModelRegistry};
use crate::fit::reduced::ReducedModel;
use crate::prepare::schema::LoanSchema;
use crate::serve::similarity::{Histogram, SimilarityError, SimilarityIndex};
use crate::serve::vector::{QueryKey, ReducedFeatureVector, VectorError};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Similarity(#[from] SimilarityError),
    #[error("The model uses features [{model}] but the reference set has [{reference}].")]
    FeatureMismatch { model: String, reference: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Available { predicted_rate: f64 },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Available(Arc<Histogram>),
    Unavailable { reason: String },
}

pub struct RateService {
    model: ReducedModel,
    index: SimilarityIndex,
    schema: LoanSchema,
    defaults: ComparisonDefaults,
    cache: DashMap<QueryKey, Arc<Histogram>>,
    cache_capacity: usize,
}

impl RateService {
    pub fn new(
        model: ReducedModel,
        index: SimilarityIndex,
        defaults: ComparisonDefaults,
    ) -> Result<Self, ServiceError> {
        let model_features = model.feature_names();
        if model_features != index.features() {
            return Err(ServiceError::FeatureMismatch {
                model: model_features.join(", "),
                reference: index.features().join(", "),
            });
        }
        Ok(Self {
            model,
            index,
            schema: LoanSchema::v1(),
            defaults,
            cache: DashMap::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        })
    }

    /// Bounds the comparison cache; zero disables it.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self.cache.clear();
        self
    }

    pub fn from_artifact(
        artifact: ModelArtifact,
        index: SimilarityIndex,
    ) -> Result<Self, ServiceError> {
        log::info!(
            "Serving model '{}' version '{}' over {} reference rows.",
            artifact.name,
            artifact.version,
            index.len()
        );
        Self::new(artifact.reduced, index, artifact.comparison)
    }

    /// Loads a published model and its reference rows; the latest version when
    /// `version` is `None`.
    pub fn from_registry(
        registry: &ModelRegistry,
        name: &str,
        version: Option<&str>,
    ) -> Result<Self, ServiceError> {
        let artifact = registry.load(name, version)?;
        let reference = registry.reference_path(&artifact.name, &artifact.version)?;
        let index = SimilarityIndex::read_reference(&reference)?;
        Self::from_artifact(artifact, index)
    }

    pub fn features(&self) -> &[String] {
        self.index.features()
    }

    pub fn defaults(&self) -> ComparisonDefaults {
        self.defaults
    }

    pub fn cached_comparisons(&self) -> usize {
        self.cache.len()
    }

    /// Builds a query vector from raw form text.
    pub fn parse_form(&self, form: &[(&str, &str)]) -> Result<ReducedFeatureVector, VectorError> {
        ReducedFeatureVector::from_form(self.features(), form, &self.schema)
    }

    fn check(&self, vector: &ReducedFeatureVector) -> Result<(), String> {
        if vector.features() != self.features() {
            return Err(format!(
                "expected inputs [{}], got [{}]",
                self.features().join(", "),
                vector.features().join(", ")
            ));
        }
        Ok(())
    }

    pub fn predict(&self, vector: &ReducedFeatureVector) -> Prediction {
        if let Err(reason) = self.check(vector) {
            return Prediction::Unavailable { reason };
        }
        match self.model.predict(vector.values()) {
            Ok(predicted_rate) => Prediction::Available { predicted_rate },
            Err(e) => {
                log::warn!("Prediction failed: {e}");
                Prediction::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Histogram of rates over the `k` most similar reference applicants
    /// (the artifact's default `k` when `None`).
    pub fn compare(&self, vector: &ReducedFeatureVector, k: Option<usize>) -> Comparison {
        if let Err(reason) = self.check(vector) {
            return Comparison::Unavailable { reason };
        }
        let k = k.unwrap_or(self.defaults.k);
        let key = vector.cache_key(k);
        if let Some(hit) = self.cache.get(&key) {
            return Comparison::Available(Arc::clone(hit.value()));
        }
        match self.index.compare(vector.values(), k, self.defaults.bin_width) {
            Ok(histogram) => {
                let histogram = Arc::new(histogram);
                if self.cache_capacity > 0 {
                    if self.cache.len() >= self.cache_capacity {
                        log::debug!(
                            "Comparison cache reached {} entries; clearing it.",
                            self.cache_capacity
                        );
                        self.cache.clear();
                    }
                    self.cache.insert(key, Arc::clone(&histogram));
                }
                Comparison::Available(histogram)
            }
            Err(e) => {
                log::warn!("Comparison failed: {e}");
                Comparison::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::table::ApplicantTable;

    fn features() -> Vec<String> {
        vec!["term".into(), "all_util".into()]
    }

    fn service() -> RateService {
        let term = [36.0, 36.0, 60.0, 60.0, 36.0, 60.0];
        let util = [10.0, 40.0, 20.0, 80.0, 60.0, 50.0];
        let rate: Vec<f64> = term
            .iter()
            .zip(&util)
            .map(|(t, u)| 2.0 + 0.1 * t + 0.05 * u)
            .collect();
        let table = ApplicantTable::new("interest_rate", rate)
            .with_numeric("term", term.iter().map(|v| Some(*v)).collect())
            .unwrap()
            .with_numeric("all_util", util.iter().map(|v| Some(*v)).collect())
            .unwrap();
        let model = ReducedModel::fit(&table, &features()).unwrap();
        let index = SimilarityIndex::build(&table, &features()).unwrap();
        RateService::new(model, index, ComparisonDefaults { k: 2, bin_width: 0.5 }).unwrap()
    }

    #[test]
    fn predictions_come_from_the_reduced_model() {
        let service = service();
        let vector = service.parse_form(&[("term", "36 months"), ("all_util", "30%")]).unwrap();
        match service.predict(&vector) {
            Prediction::Available { predicted_rate } => {
                approx::assert_abs_diff_eq!(predicted_rate, 7.1, epsilon = 1e-8)
            }
            other => panic!("Expected a prediction, got {:?}", other),
        }
    }

    #[test]
    fn comparisons_are_cached_and_shared() {
        let service = service();
        let vector = ReducedFeatureVector::new(&features(), vec![36.0, 30.0]).unwrap();
        let Comparison::Available(first) = service.compare(&vector, None) else {
            panic!("Expected a histogram");
        };
        let Comparison::Available(second) = service.compare(&vector, None) else {
            panic!("Expected a histogram");
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.total(), 2);
        assert_eq!(service.cached_comparisons(), 1);

        service.compare(&vector, Some(3));
        assert_eq!(service.cached_comparisons(), 2);
    }

    #[test]
    fn comparison_cache_never_exceeds_its_capacity() {
        let service = service().with_cache_capacity(2);
        for util in [10.0, 20.0, 30.0, 40.0, 50.0] {
            let vector = ReducedFeatureVector::new(&features(), vec![36.0, util]).unwrap();
            assert!(matches!(service.compare(&vector, None), Comparison::Available(_)));
            assert!(service.cached_comparisons() <= 2);
        }
        assert!(service.cached_comparisons() >= 1);

        let uncached = service.with_cache_capacity(0);
        let vector = ReducedFeatureVector::new(&features(), vec![60.0, 70.0]).unwrap();
        assert!(matches!(uncached.compare(&vector, None), Comparison::Available(_)));
        assert_eq!(uncached.cached_comparisons(), 0);
    }

    #[test]
    fn failures_are_reported_not_raised() {
        let service = service();
        let wrong = ReducedFeatureVector::new(&["term".to_string()], vec![36.0]).unwrap();
        assert!(matches!(service.predict(&wrong), Prediction::Unavailable { .. }));
        let vector = ReducedFeatureVector::new(&features(), vec![36.0, 30.0]).unwrap();
        assert!(matches!(service.compare(&vector, Some(0)), Comparison::Unavailable { .. }));
    }

    #[test]
    fn mismatched_reference_set_is_rejected() {
        let service = service();
        let table = ApplicantTable::new("interest_rate", vec![1.0, 2.0])
            .with_numeric("term", vec![Some(36.0), Some(60.0)])
            .unwrap();
        let index = SimilarityIndex::build(&table, &["term".to_string()]).unwrap();
        assert!(matches!(
            RateService::new(service.model.clone(), index, ComparisonDefaults::default()),
            Err(ServiceError::FeatureMismatch { .. })
        ));
    }
}
