//! The global feature schema.
//!
//! All holders harmonize their rows against one schema document. The document comes in two
//! shapes which are told apart by their structure alone:
//!
//! - **hashed**: an object with numeric columns, categorical columns, a hash bucket width and a
//!   min/range scaler for the numeric columns,
//! - **enumerated**: the final, one-hot expanded feature names, either as a bare list or as an
//!   object with a feature list and an optional standard scaler.
//!
//! The shape is resolved once while loading into the closed [`FeatureSchema`] enum.

use std::{
    collections::HashSet,
    fs,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors related to loading a feature schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("feature schema {path} is not available: {source}")]
    SchemaNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unrecognized feature schema: {0}")]
    UnrecognizedSchema(String),
}

#[derive(Debug, Clone, PartialEq)]
/// The global feature contract.
pub enum FeatureSchema {
    Hashed(HashedSchema),
    Enumerated(EnumeratedSchema),
}

#[derive(Debug, Clone, PartialEq)]
/// Scaled numeric columns followed by hashed categorical columns.
pub struct HashedSchema {
    numeric: Vec<String>,
    categorical: Vec<String>,
    buckets: usize,
    min: Vec<f64>,
    range: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
/// A fixed list of one-hot expanded feature names.
pub struct EnumeratedSchema {
    features: Vec<String>,
    scaler: Option<StandardScaler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A standard scaler applied to the reindexed features: `(x - mean) / scale`.
pub struct StandardScaler {
    #[serde(alias = "mean_")]
    pub mean: Vec<f64>,
    #[serde(alias = "scale_")]
    pub scale: Vec<f64>,
}

impl HashedSchema {
    /// Creates a hashed schema.
    ///
    /// # Errors
    /// Fails if the scaler does not cover every numeric column or categorical columns are
    /// declared without hash buckets.
    pub fn new(
        numeric: Vec<String>,
        categorical: Vec<String>,
        buckets: usize,
        min: Vec<f64>,
        range: Vec<f64>,
    ) -> Result<Self, SchemaError> {
        if min.len() != numeric.len() || range.len() != numeric.len() {
            return Err(SchemaError::UnrecognizedSchema(format!(
                "the scaler covers {}/{} values but there are {} numeric columns",
                min.len(),
                range.len(),
                numeric.len()
            )));
        }
        if buckets == 0 && !categorical.is_empty() {
            return Err(SchemaError::UnrecognizedSchema(
                "categorical columns require a positive hash bucket width".to_string(),
            ));
        }
        ensure_unique(numeric.iter().chain(categorical.iter()))?;
        Ok(Self {
            numeric,
            categorical,
            buckets,
            min,
            range,
        })
    }

    pub fn numeric(&self) -> &[String] {
        &self.numeric
    }

    pub fn categorical(&self) -> &[String] {
        &self.categorical
    }

    /// The number of hash buckets per categorical column.
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Scales a numeric value of the given column. A zero range counts as one; any NaN result
    /// becomes zero.
    pub fn scale(&self, column: usize, value: f64) -> f64 {
        let range = if self.range[column] == 0.0 {
            1.0
        } else {
            self.range[column]
        };
        let scaled = (value - self.min[column]) / range;
        if scaled.is_nan() {
            0.0
        } else {
            scaled
        }
    }
}

impl EnumeratedSchema {
    /// Creates an enumerated schema.
    ///
    /// # Errors
    /// Fails on duplicate feature names or a scaler that does not cover every feature.
    pub fn new(features: Vec<String>, scaler: Option<StandardScaler>) -> Result<Self, SchemaError> {
        ensure_unique(features.iter())?;
        if let Some(scaler) = &scaler {
            if scaler.mean.len() != features.len() || scaler.scale.len() != features.len() {
                return Err(SchemaError::UnrecognizedSchema(format!(
                    "the standard scaler covers {}/{} values but there are {} features",
                    scaler.mean.len(),
                    scaler.scale.len(),
                    features.len()
                )));
            }
        }
        Ok(Self { features, scaler })
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn scaler(&self) -> Option<&StandardScaler> {
        self.scaler.as_ref()
    }
}

impl StandardScaler {
    /// Scales the value of the given feature. A zero scale counts as one.
    pub fn apply(&self, feature: usize, value: f64) -> f64 {
        let scale = if self.scale[feature] == 0.0 {
            1.0
        } else {
            self.scale[feature]
        };
        (value - self.mean[feature]) / scale
    }
}

fn ensure_unique<'a>(names: impl Iterator<Item = &'a String>) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(SchemaError::UnrecognizedSchema(format!(
                "feature `{}` is declared twice",
                name
            )));
        }
    }
    Ok(())
}

impl FeatureSchema {
    /// Loads a schema document from a json file.
    ///
    /// # Errors
    /// Fails with [`SchemaError::SchemaNotFound`] if the file can't be read and with
    /// [`SchemaError::UnrecognizedSchema`] if the document has neither shape.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| SchemaError::SchemaNotFound {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Parses a schema document.
    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let document: SchemaDocument = serde_json::from_str(json).map_err(|_| {
            SchemaError::UnrecognizedSchema(
                "expected a hashed schema object or a list of feature names".to_string(),
            )
        })?;
        Self::try_from(document)
    }

    /// Serializes the schema into its canonical document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&SchemaDocument::from(self))
    }

    /// The declared feature width.
    pub fn feature_dim(&self) -> usize {
        match self {
            FeatureSchema::Hashed(schema) => {
                schema.numeric.len() + schema.categorical.len() * schema.buckets
            }
            FeatureSchema::Enumerated(schema) => schema.features.len(),
        }
    }

    /// The output column names in feature order.
    pub fn feature_names(&self) -> Vec<String> {
        match self {
            FeatureSchema::Hashed(schema) => schema
                .numeric
                .iter()
                .cloned()
                .chain(schema.categorical.iter().flat_map(|column| {
                    (0..schema.buckets).map(move |bucket| format!("{}_hash{}", column, bucket))
                }))
                .collect(),
            FeatureSchema::Enumerated(schema) => schema.features.clone(),
        }
    }

    /// A short name of the schema shape.
    pub fn mode(&self) -> &'static str {
        match self {
            FeatureSchema::Hashed(_) => "hashed",
            FeatureSchema::Enumerated(_) => "enumerated",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum SchemaDocument {
    Hashed(HashedDocument),
    Enumerated(EnumeratedDocument),
    List(Vec<String>),
}

#[derive(Debug, Serialize, Deserialize)]
struct HashedDocument {
    #[serde(alias = "NUM_COLS", alias = "NUMERIC_COLS")]
    num_cols: Vec<String>,
    #[serde(alias = "CAT_COLS", alias = "CATEGORICAL_COLS", default)]
    cat_cols: Vec<String>,
    #[serde(alias = "HASHER_DIM", alias = "HASHED_SIZE", default)]
    hasher_dim: usize,
    #[serde(alias = "SCALER")]
    scaler: MinMaxDocument,
}

/// `null` entries stand for columns the scaler never saw a value for.
#[derive(Debug, Serialize, Deserialize)]
struct MinMaxDocument {
    #[serde(alias = "data_min_")]
    min: Vec<Option<f64>>,
    #[serde(alias = "data_range_")]
    range: Vec<Option<f64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnumeratedDocument {
    #[serde(alias = "FEATURE_COLS", alias = "FEATURE_LIST")]
    feature_cols: Vec<String>,
    #[serde(alias = "SCALER", default, skip_serializing_if = "Option::is_none")]
    scaler: Option<StandardScaler>,
}

impl TryFrom<SchemaDocument> for FeatureSchema {
    type Error = SchemaError;

    fn try_from(document: SchemaDocument) -> Result<Self, Self::Error> {
        let unset = |values: Vec<Option<f64>>| -> Vec<f64> {
            values
                .into_iter()
                .map(|value| value.unwrap_or(f64::NAN))
                .collect()
        };
        match document {
            SchemaDocument::Hashed(doc) => HashedSchema::new(
                doc.num_cols,
                doc.cat_cols,
                doc.hasher_dim,
                unset(doc.scaler.min),
                unset(doc.scaler.range),
            )
            .map(FeatureSchema::Hashed),
            SchemaDocument::Enumerated(doc) => {
                EnumeratedSchema::new(doc.feature_cols, doc.scaler).map(FeatureSchema::Enumerated)
            }
            SchemaDocument::List(features) => {
                EnumeratedSchema::new(features, None).map(FeatureSchema::Enumerated)
            }
        }
    }
}

impl From<&FeatureSchema> for SchemaDocument {
    fn from(schema: &FeatureSchema) -> Self {
        let set = |values: &[f64]| -> Vec<Option<f64>> {
            values
                .iter()
                .map(|value| if value.is_nan() { None } else { Some(*value) })
                .collect()
        };
        match schema {
            FeatureSchema::Hashed(schema) => SchemaDocument::Hashed(HashedDocument {
                num_cols: schema.numeric.clone(),
                cat_cols: schema.categorical.clone(),
                hasher_dim: schema.buckets,
                scaler: MinMaxDocument {
                    min: set(&schema.min),
                    range: set(&schema.range),
                },
            }),
            FeatureSchema::Enumerated(schema) => match &schema.scaler {
                None => SchemaDocument::List(schema.features.clone()),
                Some(scaler) => SchemaDocument::Enumerated(EnumeratedDocument {
                    feature_cols: schema.features.clone(),
                    scaler: Some(scaler.clone()),
                }),
            },
        }
    }
}
