//! Model architectures, weight sets, optimizers and metrics.
//!
//! The round loop never touches a network directly. It exchanges [`WeightSet`]s with the
//! codec and the aggregation and only converts them into a live [`Model`] through
//! [`Architecture::instantiate`] when a client trains or a case is scored. This keeps the
//! orchestration independent of the concrete network.

pub mod metrics;
pub mod mlp;
pub mod optimizer;
pub mod weights;

use std::fmt::Debug;

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

pub use self::{
    metrics::{MetricAccumulator, RoundMetrics},
    mlp::{Mlp, MlpSpec},
    optimizer::{Adam, AdamState},
    weights::{federated_average, WeightSet},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// A feature width or weight layout does not fit the architecture.
pub enum DimensionMismatch {
    #[error("feature width {found} does not match the architecture input width {expected}")]
    InputWidth { expected: usize, found: usize },
    #[error("weight set has {found} tensors but the architecture declares {expected} slots")]
    SlotCount { expected: usize, found: usize },
    #[error("slot {slot} expects shape {expected:?} but the tensor has shape {found:?}")]
    SlotShape {
        slot: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// The outcome of a forward and backward pass over one batch.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// The regularized mean loss of the batch.
    pub loss: f32,
    /// The gradients in slot order.
    pub gradients: WeightSet,
    /// The predicted probabilities of the batch rows.
    pub probabilities: Array1<f32>,
}

/// The declaration of a network: its input width and the shapes of its trainable slots.
pub trait Architecture: Debug + Send + Sync {
    /// The feature width the network consumes.
    fn input_dim(&self) -> usize;

    /// The shapes of the trainable tensors in declaration order.
    fn slot_shapes(&self) -> Vec<Vec<usize>>;

    /// Creates freshly initialized weights.
    fn initialize(&self, rng: &mut ChaCha20Rng) -> WeightSet;

    /// Binds a weight set to a live model instance.
    ///
    /// # Errors
    /// Fails if the tensor count or any tensor shape differs from the declared slots.
    fn instantiate(&self, weights: WeightSet) -> Result<Box<dyn Model>, DimensionMismatch>;

    /// Checks a weight set against the declared slots.
    fn check(&self, weights: &WeightSet) -> Result<(), DimensionMismatch> {
        let expected = self.slot_shapes();
        if expected.len() != weights.len() {
            return Err(DimensionMismatch::SlotCount {
                expected: expected.len(),
                found: weights.len(),
            });
        }
        for (slot, (shape, tensor)) in expected.into_iter().zip(weights.iter()).enumerate() {
            if tensor.shape() != shape.as_slice() {
                return Err(DimensionMismatch::SlotShape {
                    slot,
                    expected: shape,
                    found: tensor.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

/// A live model instance.
pub trait Model: Send {
    /// The feature width the model consumes.
    fn input_dim(&self) -> usize;

    /// Predicts the fraud probability of every row.
    fn predict(&self, features: ArrayView2<f32>) -> Array1<f32>;

    /// Runs a forward and backward pass over a batch.
    fn loss_and_gradients(&self, features: ArrayView2<f32>, labels: ArrayView1<f32>)
        -> ForwardPass;

    /// Adds an update, given in slot order, to the weights.
    ///
    /// # Panics
    /// Panics if the update does not have the slot shapes of the model.
    fn apply_update(&mut self, update: &WeightSet);

    /// Gets a copy of the current weights.
    fn weights(&self) -> WeightSet;

    /// Converts the model back into its weight set.
    fn into_weights(self: Box<Self>) -> WeightSet;
}
