//! The Adam optimizer.

use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::model::WeightSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Adam hyperparameters.
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The moment estimates of an [`Adam`] optimizer.
pub struct AdamState {
    /// The number of steps taken so far.
    pub step: u64,
    /// The first moment estimates in slot order.
    pub m: WeightSet,
    /// The second moment estimates in slot order.
    pub v: WeightSet,
}

impl AdamState {
    /// Creates a fresh state for weights of the given shapes.
    pub fn new(shapes: &[Vec<usize>]) -> Self {
        Self {
            step: 0,
            m: WeightSet::zeros(shapes),
            v: WeightSet::zeros(shapes),
        }
    }
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }

    /// Advances the state by one step and returns the update to add to the weights.
    ///
    /// # Panics
    /// Panics if the gradients do not have the shapes of the state.
    pub fn step(&self, state: &mut AdamState, gradients: &WeightSet) -> WeightSet {
        assert_eq!(state.m.shapes(), gradients.shapes(), "gradients of wrong shape");
        state.step += 1;
        let t = state.step as i32;
        let lr = self.learning_rate * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));

        let mut update = gradients.zeros_like();
        for (((u, m), v), g) in update
            .iter_mut()
            .zip(state.m.iter_mut())
            .zip(state.v.iter_mut())
            .zip(gradients.iter())
        {
            Zip::from(u)
                .and(m)
                .and(v)
                .and(g)
                .for_each(|u, m, v, &g| {
                    *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                    *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                    *u = -lr * *m / (v.sqrt() + self.epsilon);
                });
        }
        update
    }
}
