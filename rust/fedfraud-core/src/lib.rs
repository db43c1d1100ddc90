//! # FedFraud core
//!
//! Domain logic for training a shared fraud classifier across data holders that cannot pool
//! their raw records.
//!
//! Every holder exports its transactions in its own schema. Before any aggregation makes sense,
//! the rows of all holders have to be mapped onto one global feature contract, the
//! [`FeatureSchema`]. This crate provides the building blocks of a training run, leaf first:
//!
//! - [`table`]: loading of raw, holder specific rows.
//! - [`schema`]: the global feature contract in its hashed or enumerated shape.
//! - [`harmonize`]: mapping raw rows onto the fixed width feature matrix.
//! - [`partition`]: deterministic splitting of a holder's rows into simulated clients.
//! - [`archive`]: the ordered tensor archive used for checkpoints and model export.
//! - [`model`]: the weight set, the network architecture, the optimizers and the metrics.
//! - [`calibration`] and [`evaluation`]: decision threshold selection and scoring of held-out
//!   cases.
//!
//! The round loop itself lives in the `fedfraud-coordinator` crate.
//!
//! [`FeatureSchema`]: crate::schema::FeatureSchema

pub mod archive;
pub mod calibration;
pub mod evaluation;
pub mod harmonize;
pub mod hashing;
pub mod model;
pub mod partition;
pub mod schema;
pub mod table;

pub use self::{
    archive::ArchiveError,
    calibration::ThresholdMode,
    evaluation::EvaluationError,
    harmonize::{HarmonizeError, HarmonizedDataset},
    model::{DimensionMismatch, WeightSet},
    partition::{ClientDataset, PartitionError},
    schema::{FeatureSchema, SchemaError},
    table::{RawTable, RawValue, TableError},
};

/// A dynamically shaped tensor of model weights.
pub type Tensor = ndarray::ArrayD<f32>;
