use crate::prepare::schema::LoanSchema;
use thiserror::Error;

/// Query values are rounded to this many decimals before they key the cache.
pub const KEY_DECIMALS: i32 = 6;

#[derive(Error, Debug, PartialEq)]
pub enum VectorError {
    #[error("No value was given for '{0}'.")]
    Missing(String),
    #[error("'{text}' is not a usable value for '{feature}'.")]
    Unparseable { feature: String, text: String },
    #[error("'{0}' is not one of the model's inputs.")]
    Unknown(String),
    #[error("Expected {expected} values, got {found}.")]
    Length { expected: usize, found: usize },
}

/// One applicant's values for the reduced feature set, in model order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedFeatureVector {
    features: Vec<String>,
    values: Vec<f64>,
}

/// Hashable identity of a comparison request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    values: Vec<i64>,
    k: usize,
}

impl ReducedFeatureVector {
    pub fn new(features: &[String], values: Vec<f64>) -> Result<Self, VectorError> {
        if values.len() != features.len() {
            return Err(VectorError::Length {
                expected: features.len(),
                found: values.len(),
            });
        }
        if let Some(slot) = values.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::Unparseable {
                feature: features[slot].clone(),
                text: values[slot].to_string(),
            });
        }
        Ok(Self {
            features: features.to_vec(),
            values,
        })
    }

    /// Orders named numbers into model order. Every feature must be present
    /// exactly once and no extra names are accepted.
    pub fn from_pairs(features: &[String], pairs: &[(&str, f64)]) -> Result<Self, VectorError> {
        if let Some((name, _)) = pairs.iter().find(|(n, _)| !features.iter().any(|f| f == n)) {
            return Err(VectorError::Unknown(name.to_string()));
        }
        let values = features
            .iter()
            .map(|feature| {
                pairs
                    .iter()
                    .find(|(name, _)| name == feature)
                    .map(|(_, v)| *v)
                    .ok_or_else(|| VectorError::Missing(feature.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(features, values)
    }

    /// Parses raw form text such as `"36 months"` or `"55%"` with the same cell
    /// transforms the schema normalizer applies to warehouse rows.
    pub fn from_form(
        features: &[String],
        form: &[(&str, &str)],
        schema: &LoanSchema,
    ) -> Result<Self, VectorError> {
        let mut pairs = Vec::with_capacity(form.len());
        for &(name, text) in form {
            let value = schema.transform_for(name).apply(text).ok_or_else(|| {
                VectorError::Unparseable {
                    feature: name.to_string(),
                    text: text.to_string(),
                }
            })?;
            pairs.push((name, value));
        }
        Self::from_pairs(features, &pairs)
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, feature: &str) -> Option<f64> {
        self.features
            .iter()
            .position(|f| f == feature)
            .map(|slot| self.values[slot])
    }

    pub fn cache_key(&self, k: usize) -> QueryKey {
        let scale = 10f64.powi(KEY_DECIMALS);
        QueryKey {
            values: self
                .values
                .iter()
                .map(|v| (v * scale).round() as i64)
                .collect(),
            k,
        }
    }
}
