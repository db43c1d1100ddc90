//! Weight set representation and federated averaging.

use std::{
    iter::{FromIterator, IntoIterator},
    slice::{Iter, IterMut},
};

use derive_more::{From, Index, IndexMut, Into};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::Tensor;

#[derive(Debug, Clone, Default, PartialEq, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// The ordered trainable tensors of a model, one per architecture slot.
///
/// Tensors are matched to slots by position, never by name.
pub struct WeightSet(Vec<Tensor>);

#[allow(clippy::len_without_is_empty)]
impl WeightSet {
    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.0.iter().map(|tensor| tensor.len()).sum()
    }

    pub fn iter(&self) -> Iter<Tensor> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> IterMut<Tensor> {
        self.0.iter_mut()
    }

    /// Gets the shape of every tensor.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.0.iter().map(|tensor| tensor.shape().to_vec()).collect()
    }

    /// Creates zero tensors of the given shapes.
    pub fn zeros(shapes: &[Vec<usize>]) -> Self {
        shapes
            .iter()
            .map(|shape| ArrayD::zeros(IxDyn(shape)))
            .collect()
    }

    /// Creates zero tensors with the shapes of this weight set.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.shapes())
    }

    /// Computes `self - other` tensor by tensor.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    pub fn difference(&self, other: &WeightSet) -> WeightSet {
        assert_eq!(self.len(), other.len(), "weight sets of different length");
        self.iter().zip(other.iter()).map(|(a, b)| a - b).collect()
    }

    /// Adds `factor * other` to this weight set in place.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    pub fn scaled_add(&mut self, factor: f32, other: &WeightSet) {
        assert_eq!(self.len(), other.len(), "weight sets of different length");
        for (tensor, addend) in self.iter_mut().zip(other.iter()) {
            tensor.scaled_add(factor, addend);
        }
    }

    /// Checks whether all parameters are finite.
    pub fn is_finite(&self) -> bool {
        self.iter().all(|tensor| tensor.iter().all(|value| value.is_finite()))
    }
}

impl FromIterator<Tensor> for WeightSet {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        WeightSet(iter.into_iter().collect())
    }
}

impl IntoIterator for WeightSet {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WeightSet {
    type Item = &'a Tensor;
    type IntoIter = Iter<'a, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Averages the weight sets, weighting each one by its example count.
///
/// Sets with zero examples contribute nothing. Returns `None` if there is nothing to average.
///
/// # Panics
/// Panics if the sets have different shapes or `sets` and `counts` differ in length.
pub fn federated_average(sets: &[WeightSet], counts: &[u64]) -> Option<WeightSet> {
    assert_eq!(sets.len(), counts.len());
    let total: u64 = counts.iter().sum();
    let first = sets.first()?;
    if total == 0 {
        return None;
    }

    let mut average = first.zeros_like();
    for (set, &count) in sets.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        let factor = (count as f64 / total as f64) as f32;
        for (acc, tensor) in average.iter_mut().zip(set.iter()) {
            Zip::from(acc)
                .and(tensor)
                .for_each(|acc, &value| *acc += factor * value);
        }
    }
    Some(average)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_federated_average_smoke() {
        let set1: WeightSet = vec![array![3.0_f32, 1.0, 0.0].into_dyn()].into();
        let set2: WeightSet = vec![array![0.0_f32, 1.0, 3.0].into_dyn()].into();

        let average = federated_average(&[set1, set2], &[1, 2]).unwrap();

        let expected = array![1.0_f32, 1.0, 2.0].into_dyn();
        for (a, b) in average[0].iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_federated_average_ignores_empty_clients() {
        let set1: WeightSet = vec![array![2.0_f32].into_dyn()].into();
        let set2: WeightSet = vec![array![100.0_f32].into_dyn()].into();

        let average = federated_average(&[set1, set2], &[5, 0]).unwrap();
        assert_eq!(average[0], array![2.0_f32].into_dyn());

        assert!(federated_average(&[], &[]).is_none());
        assert!(federated_average(&[average.clone()], &[0]).is_none());
    }

    #[test]
    fn test_difference_and_scaled_add() {
        let a: WeightSet = vec![array![[1.0_f32, 2.0]].into_dyn(), array![1.0_f32].into_dyn()].into();
        let b: WeightSet = vec![array![[0.5_f32, 0.5]].into_dyn(), array![2.0_f32].into_dyn()].into();

        let mut delta = a.difference(&b);
        assert_eq!(delta[0], array![[0.5_f32, 1.5]].into_dyn());
        assert_eq!(delta[1], array![-1.0_f32].into_dyn());

        delta.scaled_add(2.0, &b);
        assert_eq!(delta[0], array![[1.5_f32, 2.5]].into_dyn());
        assert_eq!(delta.shapes(), vec![vec![1, 2], vec![1]]);
        assert_eq!(delta.parameter_count(), 3);
        assert!(delta.is_finite());
    }
}
