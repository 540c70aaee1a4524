//! L2 weight regularization

use ndarray::{Array, ArrayView, Dimension, IxDyn};

/// Penalty `λ/2 · Σ w²` over a set of weight tensors.
///
/// Only weights are passed in; biases and batch-norm scale/shift are never
/// regularized. With `λ = 0` both the loss and the gradient vanish.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2RegularizationLoss;

impl L2RegularizationLoss {
    pub fn new() -> Self {
        Self
    }

    /// `λ/2` times the sum of squares of every value in every weight tensor.
    pub fn forward<'a, I>(&self, weights: I, lambda: f32) -> f32
    where
        I: IntoIterator<Item = ArrayView<'a, f32, IxDyn>>,
    {
        if lambda == 0.0 {
            return 0.0;
        }
        let sum_sq: f32 = weights
            .into_iter()
            .map(|w| w.iter().map(|v| v * v).sum::<f32>())
            .sum();
        0.5 * lambda * sum_sq
    }

    /// Gradient of the penalty for one weight tensor, `λ · w`.
    pub fn backward<D: Dimension>(&self, weights: &ArrayView<'_, f32, D>, lambda: f32) -> Array<f32, D> {
        weights.mapv(|w| lambda * w)
    }
}
