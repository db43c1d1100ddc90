//! A fully connected binary classifier.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2, Zip};
use rand::distributions::{Distribution, Uniform};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::model::{Architecture, DimensionMismatch, ForwardPass, Model, WeightSet};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logarithms.
const EPSILON: f32 = 1e-7;

/// The default hidden layer widths.
pub const DEFAULT_HIDDEN_UNITS: [usize; 2] = [128, 64];

/// The default L2 penalty of the kernels.
pub const DEFAULT_L2: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A multilayer perceptron with ReLU hidden layers and a sigmoid output unit.
///
/// The slots are the kernel and the bias of every dense layer, in that order.
pub struct MlpSpec {
    input_dim: usize,
    hidden_units: Vec<usize>,
    l2: f32,
}

impl MlpSpec {
    pub fn new(input_dim: usize, hidden_units: Vec<usize>, l2: f32) -> Self {
        Self {
            input_dim,
            hidden_units,
            l2,
        }
    }

    /// Creates the default network for the given feature width.
    pub fn with_input_dim(input_dim: usize) -> Self {
        Self::new(input_dim, DEFAULT_HIDDEN_UNITS.to_vec(), DEFAULT_L2)
    }

    /// The `(fan_in, fan_out)` of every dense layer.
    fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut widths = Vec::with_capacity(self.hidden_units.len() + 2);
        widths.push(self.input_dim);
        widths.extend(self.hidden_units.iter().copied());
        widths.push(1);
        widths.windows(2).map(|pair| (pair[0], pair[1])).collect()
    }
}

impl Architecture for MlpSpec {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn slot_shapes(&self) -> Vec<Vec<usize>> {
        self.layer_dims()
            .into_iter()
            .flat_map(|(fan_in, fan_out)| vec![vec![fan_in, fan_out], vec![fan_out]])
            .collect()
    }

    /// Glorot uniform kernels and zero biases.
    fn initialize(&self, rng: &mut ChaCha20Rng) -> WeightSet {
        let mut tensors = Vec::new();
        for (fan_in, fan_out) in self.layer_dims() {
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            let uniform = Uniform::new_inclusive(-limit, limit);
            let kernel = Array2::from_shape_fn((fan_in, fan_out), |_| uniform.sample(rng));
            tensors.push(kernel.into_dyn());
            tensors.push(Array1::<f32>::zeros(fan_out).into_dyn());
        }
        tensors.into()
    }

    fn instantiate(&self, weights: WeightSet) -> Result<Box<dyn Model>, DimensionMismatch> {
        self.check(&weights)?;

        let shapes = self.slot_shapes();
        let mismatch = |slot: usize, found: &[usize]| DimensionMismatch::SlotShape {
            slot,
            expected: shapes[slot].clone(),
            found: found.to_vec(),
        };

        let mut layers = Vec::new();
        let mut tensors = weights.into_iter().enumerate();
        while let (Some((k_slot, kernel)), Some((b_slot, bias))) = (tensors.next(), tensors.next())
        {
            let kernel_shape = kernel.shape().to_vec();
            let bias_shape = bias.shape().to_vec();
            let kernel = kernel
                .into_dimensionality::<Ix2>()
                .map_err(|_| mismatch(k_slot, &kernel_shape))?;
            let bias = bias
                .into_dimensionality::<Ix1>()
                .map_err(|_| mismatch(b_slot, &bias_shape))?;
            layers.push(Dense { kernel, bias });
        }

        Ok(Box::new(Mlp {
            layers,
            l2: self.l2,
        }))
    }
}

#[derive(Debug, Clone)]
struct Dense {
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

#[derive(Debug, Clone)]
/// A live [`MlpSpec`] network.
pub struct Mlp {
    layers: Vec<Dense>,
    l2: f32,
}

impl Mlp {
    /// Runs the forward pass and keeps the input of every layer.
    fn forward(&self, features: ArrayView2<f32>) -> (Vec<Array2<f32>>, Array1<f32>) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut activation = features.to_owned();
        let last = self.layers.len() - 1;
        for (index, layer) in self.layers.iter().enumerate() {
            let mut z = activation.dot(&layer.kernel) + &layer.bias;
            inputs.push(activation);
            if index == last {
                let probabilities = z.column(0).mapv(sigmoid);
                return (inputs, probabilities);
            }
            z.mapv_inplace(|value| value.max(0.0));
            activation = z;
        }
        // a network always has an output layer
        (inputs, Array1::zeros(features.nrows()))
    }

    fn penalty(&self) -> f32 {
        self.layers
            .iter()
            .map(|layer| layer.kernel.iter().map(|w| w * w).sum::<f32>())
            .sum::<f32>()
            * self.l2
    }
}

impl Model for Mlp {
    fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.kernel.nrows())
    }

    fn predict(&self, features: ArrayView2<f32>) -> Array1<f32> {
        self.forward(features).1
    }

    fn loss_and_gradients(
        &self,
        features: ArrayView2<f32>,
        labels: ArrayView1<f32>,
    ) -> ForwardPass {
        let rows = features.nrows().max(1) as f32;
        let (inputs, probabilities) = self.forward(features);
        let loss = binary_cross_entropy(probabilities.view(), labels) + self.penalty();

        // d(loss)/dz of the sigmoid output under cross-entropy
        let mut delta = (&probabilities - &labels)
            .mapv(|value| value / rows)
            .insert_axis(Axis(1));

        let mut gradients = Vec::with_capacity(self.layers.len());
        for (index, (layer, input)) in self.layers.iter().zip(inputs.iter()).enumerate().rev() {
            let kernel_grad = input.t().dot(&delta) + &layer.kernel.mapv(|w| 2.0 * self.l2 * w);
            let bias_grad = delta.sum_axis(Axis(0));
            gradients.push((kernel_grad, bias_grad));

            if index > 0 {
                let mut upstream = delta.dot(&layer.kernel.t());
                // the input of this layer is the ReLU output of the previous one
                Zip::from(&mut upstream)
                    .and(input)
                    .for_each(|grad, &activation| {
                        if activation <= 0.0 {
                            *grad = 0.0;
                        }
                    });
                delta = upstream;
            }
        }

        let gradients = gradients
            .into_iter()
            .rev()
            .flat_map(|(kernel, bias)| vec![kernel.into_dyn(), bias.into_dyn()])
            .collect();

        ForwardPass {
            loss,
            gradients,
            probabilities,
        }
    }

    fn apply_update(&mut self, update: &WeightSet) {
        assert_eq!(update.len(), 2 * self.layers.len(), "update of wrong length");
        let mut tensors = update.iter();
        for layer in self.layers.iter_mut() {
            if let (Some(kernel), Some(bias)) = (tensors.next(), tensors.next()) {
                assert_eq!(kernel.shape(), layer.kernel.shape(), "kernel update of wrong shape");
                assert_eq!(bias.shape(), layer.bias.shape(), "bias update of wrong shape");
                // both sides are iterated in logical row-major order
                for (weight, step) in layer.kernel.iter_mut().zip(kernel.iter()) {
                    *weight += step;
                }
                for (weight, step) in layer.bias.iter_mut().zip(bias.iter()) {
                    *weight += step;
                }
            }
        }
    }

    fn weights(&self) -> WeightSet {
        self.layers
            .iter()
            .flat_map(|layer| vec![layer.kernel.clone().into_dyn(), layer.bias.clone().into_dyn()])
            .collect()
    }

    fn into_weights(self: Box<Self>) -> WeightSet {
        self.layers
            .into_iter()
            .flat_map(|layer| vec![layer.kernel.into_dyn(), layer.bias.into_dyn()])
            .collect()
    }
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// The mean binary cross-entropy of the probabilities.
pub fn binary_cross_entropy(probabilities: ArrayView1<f32>, labels: ArrayView1<f32>) -> f32 {
    if probabilities.is_empty() {
        return 0.0;
    }
    let total: f32 = probabilities
        .iter()
        .zip(labels.iter())
        .map(|(&p, &y)| {
            let p = p.clamp(EPSILON, 1.0 - EPSILON);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    total / probabilities.len() as f32
}
