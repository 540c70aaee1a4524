//! Cross-entropy loss over softmax probabilities

use crate::error::{NetworkError, Result};
use ndarray::Array2;

/// Cross-entropy between (classes, batch) probabilities and one-hot targets.
///
/// The loss does not apply softmax itself. Its backward is the gradient with
/// respect to the logits of a softmax that immediately preceded it, so it is
/// only correct when `probs` came straight out of a softmax.
///
/// # Example
///
/// ```
/// use cnn_sgd::losses::CrossEntropyLoss;
/// use ndarray::array;
///
/// let loss = CrossEntropyLoss::default();
/// let probs = array![[0.5f32], [0.5]];
/// let targets = array![[1.0f32], [0.0]];
/// let value = loss.forward(&probs, &targets).unwrap();
/// assert!((value - 0.5f32.ln().abs()).abs() < 1e-5);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyLoss {
    epsilon: f32,
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self { epsilon: 1e-8 }
    }
}

impl CrossEntropyLoss {
    /// `epsilon` is added inside the logarithm so a zero probability stays finite.
    pub fn new(epsilon: f32) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    fn check(context: &'static str, probs: &Array2<f32>, targets: &Array2<f32>) -> Result<usize> {
        if probs.shape() != targets.shape() {
            return Err(NetworkError::shape(context, probs.shape(), targets.shape()));
        }
        let batch = probs.ncols();
        if batch == 0 {
            return Err(NetworkError::InvalidData(format!("{context}: empty batch")));
        }
        Ok(batch)
    }

    /// Mean over the batch of `-Σ_c y_c · ln(p_c + ε)`.
    pub fn forward(&self, probs: &Array2<f32>, targets: &Array2<f32>) -> Result<f32> {
        let batch = Self::check("cross-entropy forward", probs, targets)?;
        let eps = self.epsilon;
        let total: f32 = probs
            .iter()
            .zip(targets.iter())
            .map(|(&p, &y)| -y * (p + eps).ln())
            .sum();
        Ok(total / batch as f32)
    }

    /// Gradient with respect to the pre-softmax logits: `(probs - targets) / batch`.
    pub fn backward(&self, probs: &Array2<f32>, targets: &Array2<f32>) -> Result<Array2<f32>> {
        let batch = Self::check("cross-entropy backward", probs, targets)?;
        Ok((probs - targets) / batch as f32)
    }
}
