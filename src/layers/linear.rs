//! Linear (fully connected) layer implementation
//!
//! Works in (features, batch) orientation: each column is one sample.
//! The transformation is `output = W · input + b`.

use crate::error::{NetworkError, Result};
use crate::layers::Layer;
use crate::utils::init::he_normal;
use ndarray::{Array2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;

/// Linear layer with weights and biases.
///
/// # Fields
///
/// * `weights` - Weight matrix (out_features × in_features)
/// * `biases` - Bias column (out_features × 1), broadcast across the batch
///
/// # Example
///
/// ```
/// use cnn_sgd::layers::{Layer, LinearLayer};
/// use ndarray::Array2;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let mut rng = StdRng::seed_from_u64(42);
/// let mut layer = LinearLayer::new(1024, 512, &mut rng).unwrap();
/// let output = layer.forward(&Array2::zeros((1024, 8))).unwrap();
/// assert_eq!(output.dim(), (512, 8));
/// ```
#[derive(Debug, Clone)]
pub struct LinearLayer {
    in_features: usize,
    out_features: usize,
    weights: Array2<f32>,
    biases: Array2<f32>,
    grad_weights: Option<Array2<f32>>,
    grad_biases: Option<Array2<f32>>,
    cached_input: Option<Array2<f32>>,
}

impl LinearLayer {
    /// Create a new LinearLayer with He initialization and zero biases.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if out_features == 0 {
            return Err(NetworkError::InvalidConfig(
                "linear out_features must be positive".to_string(),
            ));
        }
        let weights = he_normal((out_features, in_features), in_features, rng)?;
        Self::from_parameters(weights, Array2::zeros((out_features, 1)))
    }

    /// Create a layer from an explicit (out, in) weight matrix and (out, 1) bias.
    pub fn from_parameters(weights: Array2<f32>, biases: Array2<f32>) -> Result<Self> {
        let (out_features, in_features) = weights.dim();
        if biases.dim() != (out_features, 1) {
            return Err(NetworkError::shape(
                "linear bias",
                &[out_features, 1],
                biases.shape(),
            ));
        }
        Ok(Self {
            in_features,
            out_features,
            weights,
            biases,
            grad_weights: None,
            grad_biases: None,
            cached_input: None,
        })
    }

    /// Get the input size of the layer.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Get the output size of the layer.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn biases(&self) -> &Array2<f32> {
        &self.biases
    }

    pub fn grad_weights(&self) -> Option<&Array2<f32>> {
        self.grad_weights.as_ref()
    }

    pub fn grad_biases(&self) -> Option<&Array2<f32>> {
        self.grad_biases.as_ref()
    }
}

impl Layer for LinearLayer {
    type Input = Array2<f32>;
    type Output = Array2<f32>;

    /// `input` is (in_features, batch); returns (out_features, batch).
    fn forward(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        let (features, batch) = input.dim();
        if features != self.in_features {
            return Err(NetworkError::shape(
                "linear forward",
                &[self.in_features, batch],
                input.shape(),
            ));
        }
        let output = self.weights.dot(input) + &self.biases;
        self.cached_input = Some(input.clone());
        Ok(output)
    }

    /// dW = dout·xᵀ, db = row sums of dout, dx = Wᵀ·dout.
    fn backward(&mut self, grad_output: &Array2<f32>) -> Result<Array2<f32>> {
        let input = self.cached_input.take().ok_or(NetworkError::StaleCache(
            "linear backward called without a preceding forward",
        ))?;
        let expected = [self.out_features, input.ncols()];
        if grad_output.shape() != expected {
            self.cached_input = Some(input);
            return Err(NetworkError::shape(
                "linear backward",
                &expected,
                grad_output.shape(),
            ));
        }

        self.grad_weights = Some(grad_output.dot(&input.t()));
        self.grad_biases = Some(grad_output.sum_axis(Axis(1)).insert_axis(Axis(1)));
        Ok(self.weights.t().dot(grad_output))
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.weights.view().into_dyn(), self.biases.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![
            self.weights.view_mut().into_dyn(),
            self.biases.view_mut().into_dyn(),
        ]
    }

    fn gradients(&self) -> Option<Vec<ArrayViewD<'_, f32>>> {
        match (&self.grad_weights, &self.grad_biases) {
            (Some(w), Some(b)) => Some(vec![w.view().into_dyn(), b.view().into_dyn()]),
            _ => None,
        }
    }
}
