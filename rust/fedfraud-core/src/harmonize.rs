//! Harmonization of raw rows onto the global feature schema.
//!
//! The output column order is always the schema's, never the holder's, and the output width is
//! always the schema's declared width. Rows are never dropped: absent columns are zero filled
//! and unknown columns are ignored.

use std::collections::HashMap;

use ndarray::{Array1, Array2, Axis};
use thiserror::Error;

use crate::{
    hashing,
    schema::{EnumeratedSchema, FeatureSchema, HashedSchema},
    table::{RawTable, RawValue},
};

/// Errors related to building a harmonized dataset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HarmonizeError {
    #[error("the feature matrix has {features} rows but there are {labels} labels")]
    RowMismatch { features: usize, labels: usize },
}

#[derive(Debug, Clone, PartialEq)]
/// A feature matrix of the schema's width and the matching labels.
pub struct HarmonizedDataset {
    features: Array2<f32>,
    labels: Array1<f32>,
}

impl HarmonizedDataset {
    /// Creates a dataset.
    ///
    /// # Errors
    /// Fails if the number of rows and labels differ.
    pub fn new(features: Array2<f32>, labels: Array1<f32>) -> Result<Self, HarmonizeError> {
        if features.nrows() != labels.len() {
            return Err(HarmonizeError::RowMismatch {
                features: features.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self { features, labels })
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &Array1<f32> {
        &self.labels
    }

    pub fn rows(&self) -> usize {
        self.labels.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn into_parts(self) -> (Array2<f32>, Array1<f32>) {
        (self.features, self.labels)
    }

    /// Copies the given rows in the given order.
    ///
    /// # Panics
    /// Panics if an index is out of bounds.
    pub fn select(&self, rows: &[usize]) -> HarmonizedDataset {
        Self {
            features: self.features.select(Axis(0), rows),
            labels: self.labels.select(Axis(0), rows),
        }
    }
}

/// Harmonizes the rows of a table and pairs them with their labels.
pub fn harmonize_dataset(
    table: &RawTable,
    labels: Vec<f32>,
    schema: &FeatureSchema,
) -> Result<HarmonizedDataset, HarmonizeError> {
    HarmonizedDataset::new(harmonize(table, schema), Array1::from(labels))
}

/// Maps the rows of a table onto the schema's feature vector.
pub fn harmonize(table: &RawTable, schema: &FeatureSchema) -> Array2<f32> {
    match schema {
        FeatureSchema::Hashed(schema) => harmonize_hashed(table, schema),
        FeatureSchema::Enumerated(schema) => harmonize_enumerated(table, schema),
    }
}

fn harmonize_hashed(table: &RawTable, schema: &HashedSchema) -> Array2<f32> {
    let rows = table.rows();
    let numeric = schema.numeric().len();
    let buckets = schema.buckets();
    let mut features = Array2::zeros((rows, numeric + schema.categorical().len() * buckets));

    for (index, name) in schema.numeric().iter().enumerate() {
        let column = table.column(name);
        for row in 0..rows {
            // absent columns are substituted with zero before scaling
            let value = column.map(|cells| clean_numeric(&cells[row])).unwrap_or(0.0);
            features[[row, index]] = schema.scale(index, value) as f32;
        }
    }

    for (index, name) in schema.categorical().iter().enumerate() {
        let offset = numeric + index * buckets;
        let column = table.column(name);
        for row in 0..rows {
            let category = match column.map(|cells| &cells[row]) {
                Some(RawValue::Missing) | None => MISSING_CATEGORY.to_string(),
                Some(value) => value.to_string(),
            };
            features[[row, offset + hashing::bucket(&category, buckets)]] += 1.0;
        }
    }

    features
}

/// The category of missing categorical cells in hashed mode.
pub const MISSING_CATEGORY: &str = "NA";

fn harmonize_enumerated(table: &RawTable, schema: &EnumeratedSchema) -> Array2<f32> {
    let rows = table.rows();
    let positions: HashMap<&str, usize> = schema
        .features()
        .iter()
        .enumerate()
        .map(|(position, name)| (name.as_str(), position))
        .collect();
    let mut features = Array2::zeros((rows, positions.len()));

    for name in table.column_names() {
        let cells = match table.column(name) {
            Some(cells) => cells,
            None => continue,
        };
        if table.is_categorical(name) {
            // one-hot expansion as `<column>_<value>`, missing cells set no indicator
            for (row, cell) in cells.iter().enumerate() {
                if cell.is_missing() {
                    continue;
                }
                let dummy = format!("{}_{}", name, cell);
                if let Some(&position) = positions.get(dummy.as_str()) {
                    features[[row, position]] = 1.0;
                }
            }
        } else if let Some(&position) = positions.get(name) {
            for (row, cell) in cells.iter().enumerate() {
                features[[row, position]] = clean_numeric(cell) as f32;
            }
        }
    }

    if let Some(scaler) = schema.scaler() {
        for (position, mut column) in features.columns_mut().into_iter().enumerate() {
            column.mapv_inplace(|value| scaler.apply(position, f64::from(value)) as f32);
        }
    }

    features
}

/// Coerces a raw cell into a number.
///
/// Text is stripped down to digits, dots and dashes. Runs of two or more dashes are separators
/// left over from legacy exports and are removed, so `"_--_500000"` becomes `500000`. Anything
/// that still does not parse, missing cells and non-finite numbers become `0`.
pub fn clean_numeric(value: &RawValue) -> f64 {
    match value {
        RawValue::Missing => 0.0,
        RawValue::Number { value, .. } if value.is_finite() => *value,
        RawValue::Number { .. } => 0.0,
        RawValue::Text(text) => parse_dirty_number(text),
    }
}

fn parse_dirty_number(text: &str) -> f64 {
    let kept: Vec<char> = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    let mut cleaned = String::with_capacity(kept.len());
    let mut index = 0;
    while index < kept.len() {
        if kept[index] == '-' {
            let run = kept[index..].iter().take_while(|&&c| c == '-').count();
            if run == 1 {
                cleaned.push('-');
            }
            index += run;
        } else {
            cleaned.push(kept[index]);
            index += 1;
        }
    }

    cleaned
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
        .unwrap_or(0.0)
}
