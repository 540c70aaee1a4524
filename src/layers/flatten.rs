//! Flatten layer: the boundary between image tensors and feature matrices
//!
//! Forward turns a (batch, C, H, W) tensor into a (C·H·W, batch) matrix,
//! one column per sample with features in channel-major order. Backward
//! undoes the transpose and the reshape.

use crate::error::{NetworkError, Result};
use crate::layers::Layer;
use ndarray::{Array2, Array4};

/// Parameter-free reshape that only remembers the input shape.
#[derive(Debug, Clone, Default)]
pub struct Flatten {
    input_dim: Option<(usize, usize, usize, usize)>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Flatten {
    type Input = Array4<f32>;
    type Output = Array2<f32>;

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let (n, c, h, w) = input.dim();
        let rows = input
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n, c * h * w))?;
        self.input_dim = Some((n, c, h, w));
        Ok(rows.t().as_standard_layout().into_owned())
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = self.input_dim.ok_or(NetworkError::StaleCache(
            "flatten backward called without a preceding forward",
        ))?;
        if grad_output.dim() != (c * h * w, n) {
            return Err(NetworkError::shape(
                "flatten backward",
                &[c * h * w, n],
                grad_output.shape(),
            ));
        }
        self.input_dim = None;
        let rows = grad_output.t().as_standard_layout().into_owned();
        Ok(rows.into_shape_with_order((n, c, h, w))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_orders_features_per_sample() {
        let mut flatten = Flatten::new();
        let input = Array4::from_shape_fn((2, 2, 2, 3), |(b, c, i, j)| {
            (b * 100 + c * 10 + i * 3 + j) as f32
        });

        let output = flatten.forward(&input).unwrap();

        assert_eq!(output.dim(), (12, 2));
        // Column b holds sample b in (c, h, w) order
        assert_eq!(output[[0, 1]], 100.0);
        assert_eq!(output[[5, 0]], 5.0);
        assert_eq!(output[[6, 0]], 10.0);
        assert_eq!(output[[11, 1]], 115.0);
    }

    #[test]
    fn test_flatten_backward_restores_layout() {
        let mut flatten = Flatten::new();
        let input = Array4::from_shape_fn((3, 2, 2, 2), |(b, c, i, j)| {
            (b * 8 + c * 4 + i * 2 + j) as f32
        });
        let output = flatten.forward(&input).unwrap();
        let restored = flatten.backward(&output).unwrap();
        assert_eq!(restored, input);
    }

    #[test]
    fn test_flatten_backward_twice_is_stale() {
        let mut flatten = Flatten::new();
        let output = flatten.forward(&Array4::zeros((1, 1, 2, 2))).unwrap();
        flatten.backward(&output).unwrap();
        assert!(matches!(
            flatten.backward(&output),
            Err(NetworkError::StaleCache(_))
        ));
    }

    #[test]
    fn test_flatten_backward_shape_checked() {
        let mut flatten = Flatten::new();
        flatten.forward(&Array4::zeros((2, 1, 2, 2))).unwrap();
        assert!(flatten.backward(&Array2::zeros((4, 3))).is_err());
    }

    #[test]
    fn test_flatten_shape_error_keeps_cache() {
        let mut flatten = Flatten::new();
        let input = Array4::<f32>::zeros((2, 1, 2, 2));
        let output = flatten.forward(&input).unwrap();

        assert!(matches!(
            flatten.backward(&Array2::zeros((3, 2))),
            Err(NetworkError::ShapeMismatch { .. })
        ));
        assert_eq!(flatten.backward(&output).unwrap().dim(), (2, 1, 2, 2));
    }
}
