//! Layer trait definition for neural network layers
//!
//! This module defines the core Layer trait that all layer types implement.
//! The trait provides a common interface for forward propagation, backward
//! propagation and access to the learnable parameters and their gradients.

use crate::error::Result;
use ndarray::{ArrayViewD, ArrayViewMutD};

/// Core trait for neural network layers.
///
/// A layer caches whatever its backward pass needs during `forward`, and
/// `backward` consumes that cache. Exactly one backward may follow each
/// forward; a second call returns [`crate::NetworkError::StaleCache`].
///
/// # Example
///
/// ```ignore
/// let output = layer.forward(&input)?;
/// let grad_input = layer.backward(&grad_output)?;
/// let grads = layer.gradients(); // weight and bias gradients, if any
/// ```
pub trait Layer {
    /// Array type the layer consumes (and whose gradient `backward` returns).
    type Input;
    /// Array type the layer produces (and whose gradient `backward` receives).
    type Output;

    /// Forward propagation through the layer.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the input disagrees with the layer's
    /// configured channel or feature count.
    fn forward(&mut self, input: &Self::Input) -> Result<Self::Output>;

    /// Backward propagation through the layer.
    ///
    /// Computes the gradient with respect to the layer input from the gradient
    /// with respect to its output, and stores the parameter gradients on the
    /// layer (see [`Layer::gradients`]).
    ///
    /// # Errors
    ///
    /// Returns `StaleCache` when no forward pass preceded this call, and
    /// `ShapeMismatch` when `grad_output` does not match the forward output.
    fn backward(&mut self, grad_output: &Self::Output) -> Result<Self::Input>;

    /// Views of the learnable parameters, in a fixed per-layer order.
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        Vec::new()
    }

    /// Mutable views of the learnable parameters, same order as `parameters`.
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        Vec::new()
    }

    /// Parameter gradients from the most recent backward pass, same order as
    /// `parameters`. `None` until a backward pass has run.
    fn gradients(&self) -> Option<Vec<ArrayViewD<'_, f32>>> {
        None
    }

    /// Get the number of trainable parameters in the layer.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}
