//! Activation functions for the network
//!
//! - ReLU and its backward mask (any dimensionality)
//! - Column-wise softmax for (classes, batch) logits

use crate::error::{NetworkError, Result};
use ndarray::{Array, Array2, Dimension};

/// ReLU activation: negative values become 0.0, positive values pass through.
pub fn relu<D: Dimension>(x: &Array<f32, D>) -> Array<f32, D> {
    x.mapv(|v| if v > 0.0 { v } else { 0.0 })
}

/// ReLU backward.
///
/// `activation` is the post-ReLU output cached by the forward pass. The
/// gradient passes only where that activation is strictly positive, so an
/// input of exactly zero receives zero gradient.
pub fn relu_backward<D: Dimension>(
    grad_output: &Array<f32, D>,
    activation: &Array<f32, D>,
) -> Result<Array<f32, D>> {
    if grad_output.shape() != activation.shape() {
        return Err(NetworkError::shape(
            "relu backward",
            activation.shape(),
            grad_output.shape(),
        ));
    }
    let mut grad = grad_output.clone();
    grad.zip_mut_with(activation, |g, &a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
    Ok(grad)
}

/// Softmax over each column of a (classes, batch) matrix.
///
/// Subtracts the per-column maximum before exponentiating so large logits do
/// not overflow.
pub fn softmax_columns(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut column in probs.columns_mut() {
        let max_value = column.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        column.mapv_inplace(|v| (v - max_value).exp());
        let sum = column.sum();
        column /= sum;
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    const EPSILON_F32: f32 = 1e-6;

    #[test]
    fn test_relu_mixed() {
        let data = array![-2.0f32, -1.0, 0.0, 1.0, 2.0];
        assert_eq!(relu(&data), array![0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_relu_backward_masks_zero_activation() {
        let activation = array![[0.0f32, 3.0], [0.5, 0.0]];
        let grad = array![[1.0f32, 1.0], [2.0, 2.0]];
        let out = relu_backward(&grad, &activation).unwrap();
        assert_eq!(out, array![[0.0, 1.0], [2.0, 0.0]]);
    }

    #[test]
    fn test_relu_backward_shape_mismatch() {
        let activation = Array1::<f32>::zeros(3);
        let grad = Array1::<f32>::zeros(4);
        assert!(relu_backward(&grad, &activation).is_err());
    }

    #[test]
    fn test_softmax_columns_sum_to_one() {
        let logits = array![[1.0f32, 0.0], [2.0, 0.0], [3.0, 0.0]];
        let probs = softmax_columns(&logits);
        for column in probs.columns() {
            assert!((column.sum() - 1.0).abs() < EPSILON_F32);
        }
        assert!((probs[[0, 1]] - 1.0 / 3.0).abs() < EPSILON_F32);
    }

    #[test]
    fn test_softmax_numerical_stability() {
        let logits = array![[1000.0f32], [1001.0], [1002.0]];
        let probs = softmax_columns(&logits);
        assert!((probs.sum() - 1.0).abs() < EPSILON_F32);
        assert!(!probs.iter().any(|x| x.is_nan() || x.is_infinite()));
    }
}
