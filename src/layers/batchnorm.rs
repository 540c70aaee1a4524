//! Batch normalization layer for convolutional feature maps
//!
//! This module provides a BatchNorm2D layer that normalizes every channel over
//! the batch and spatial axes, improving training stability and enabling
//! higher learning rates.
//!
//! # Batch Normalization Theory
//!
//! For each channel, over all N × H × W values of the mini-batch:
//!
//! 1. Compute batch statistics: mean μ and (biased) variance σ²
//! 2. Normalize: x_norm = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ * x_norm + β
//!
//! During training, the layer uses batch statistics and updates running
//! statistics via exponential moving average. During inference, it uses the
//! running statistics and leaves them untouched.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::error::{NetworkError, Result};
use crate::layers::Layer;
use crate::utils::stats::{broadcast_channel, sum_per_channel, values_per_channel};
use ndarray::{Array1, Array4, ArrayViewD, ArrayViewMutD};

/// Per-channel batch normalization with learnable scale and shift.
///
/// # Fields
///
/// * `channels` - Number of channels normalized independently
/// * `epsilon` - Small constant added to the variance (prevents division by zero)
/// * `momentum` - Momentum for updating running statistics (typical: 0.9)
/// * `training` - Whether the layer is in training mode (true) or inference mode (false)
/// * `gamma` - Learnable scale parameter (initialized to 1.0)
/// * `beta` - Learnable shift parameter (initialized to 0.0)
/// * `running_mean` - Running average of batch means (for inference)
/// * `running_var` - Running average of batch variances (for inference)
///
/// # Example
///
/// ```
/// use cnn_sgd::layers::BatchNorm2D;
///
/// let layer = BatchNorm2D::new(16, 1e-5, 0.9).unwrap();
/// assert!(layer.is_training());
/// assert_eq!(layer.channels(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct BatchNorm2D {
    channels: usize,
    epsilon: f32,
    momentum: f32,
    training: bool,

    gamma: Array1<f32>,
    beta: Array1<f32>,

    grad_gamma: Option<Array1<f32>>,
    grad_beta: Option<Array1<f32>>,

    running_mean: Array1<f32>,
    running_var: Array1<f32>,

    cache: Option<BatchNormCache>,
}

// Values from a training-mode forward pass needed by backward.
#[derive(Debug, Clone)]
struct BatchNormCache {
    mean: Array1<f32>,
    var: Array1<f32>,
    std: Array1<f32>,
    normalized: Array4<f32>,
}

impl BatchNorm2D {
    /// Creates a batch-norm layer in training mode.
    ///
    /// Gamma starts at 1.0 and beta at 0.0. The running mean starts at 0.0 and
    /// the running variance at 1.0, so inference before any training step is
    /// the identity transform up to epsilon.
    pub fn new(channels: usize, epsilon: f32, momentum: f32) -> Result<Self> {
        if channels == 0 {
            return Err(NetworkError::InvalidConfig(
                "batch-norm channels must be positive".to_string(),
            ));
        }
        if !(epsilon > 0.0) {
            return Err(NetworkError::InvalidConfig(
                "epsilon must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&momentum) {
            return Err(NetworkError::InvalidConfig(
                "momentum must be in range [0.0, 1.0]".to_string(),
            ));
        }

        Ok(Self {
            channels,
            epsilon,
            momentum,
            training: true,
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            grad_gamma: None,
            grad_beta: None,
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            cache: None,
        })
    }

    /// Set whether the layer is in training mode.
    ///
    /// When `training` is true, forward uses batch statistics and updates the
    /// running statistics. When false, forward normalizes with the running
    /// statistics and does not modify them.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn gamma(&self) -> &Array1<f32> {
        &self.gamma
    }

    pub fn beta(&self) -> &Array1<f32> {
        &self.beta
    }

    pub fn running_mean(&self) -> &Array1<f32> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array1<f32> {
        &self.running_var
    }

    /// Batch mean of the last training-mode forward pass.
    pub fn batch_mean(&self) -> Option<&Array1<f32>> {
        self.cache.as_ref().map(|c| &c.mean)
    }

    /// Batch variance of the last training-mode forward pass.
    pub fn batch_var(&self) -> Option<&Array1<f32>> {
        self.cache.as_ref().map(|c| &c.var)
    }

    /// Gamma gradient stored by the last backward pass.
    pub fn grad_gamma(&self) -> Option<&Array1<f32>> {
        self.grad_gamma.as_ref()
    }

    /// Beta gradient stored by the last backward pass.
    pub fn grad_beta(&self) -> Option<&Array1<f32>> {
        self.grad_beta.as_ref()
    }

    fn check_channels(&self, context: &'static str, x: &Array4<f32>) -> Result<()> {
        let (n, c, h, w) = x.dim();
        if c != self.channels {
            return Err(NetworkError::shape(context, &[n, self.channels, h, w], x.shape()));
        }
        Ok(())
    }

    /// Backward pass returning `(grad_input, grad_gamma, grad_beta)`.
    ///
    /// With m = N·H·W values per channel and x̂ the cached normalized input:
    ///
    /// ```text
    /// dβ = Σ dout
    /// dγ = Σ dout · x̂
    /// dx̂ = dout · γ
    /// dx = (m·dx̂ − Σ dx̂ − x̂ · Σ(dx̂ · x̂)) / (m · sqrt(σ² + ε))
    /// ```
    ///
    /// The parameter gradients are also stored on the layer; both copies are
    /// identical.
    pub fn backward_full(
        &mut self,
        grad_output: &Array4<f32>,
    ) -> Result<(Array4<f32>, Array1<f32>, Array1<f32>)> {
        let cache = self.cache.take().ok_or(NetworkError::StaleCache(
            "batch-norm backward requires a preceding training-mode forward",
        ))?;
        if grad_output.shape() != cache.normalized.shape() {
            let err = NetworkError::shape(
                "batch-norm backward",
                cache.normalized.shape(),
                grad_output.shape(),
            );
            self.cache = Some(cache);
            return Err(err);
        }
        let m = values_per_channel(grad_output) as f32;
        let normalized = &cache.normalized;

        let grad_beta = sum_per_channel(grad_output);
        let grad_gamma = sum_per_channel(&(grad_output * normalized));

        let grad_normalized = grad_output * &broadcast_channel(&self.gamma);
        let sum_grad = sum_per_channel(&grad_normalized);
        let sum_grad_dot = sum_per_channel(&(&grad_normalized * normalized));
        let scale = cache.std.mapv(|s| 1.0 / (m * s));

        let grad_input = (&grad_normalized * m
            - &broadcast_channel(&sum_grad)
            - normalized * &broadcast_channel(&sum_grad_dot))
            * &broadcast_channel(&scale);

        self.grad_gamma = Some(grad_gamma.clone());
        self.grad_beta = Some(grad_beta.clone());
        Ok((grad_input, grad_gamma, grad_beta))
    }
}

impl Layer for BatchNorm2D {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.check_channels("batch-norm forward", input)?;

        if !self.training {
            let std = self.running_var.mapv(|v| (v + self.epsilon).sqrt());
            let normalized = (input - &broadcast_channel(&self.running_mean))
                / &broadcast_channel(&std);
            // Inference leaves nothing for backward to consume
            self.cache = None;
            return Ok(normalized * &broadcast_channel(&self.gamma)
                + &broadcast_channel(&self.beta));
        }

        let count = values_per_channel(input);
        if count == 0 {
            return Err(NetworkError::InvalidData(
                "batch-norm forward on an empty batch".to_string(),
            ));
        }
        let count = count as f32;
        let mean = sum_per_channel(input) / count;
        let centered = input - &broadcast_channel(&mean);
        let var = sum_per_channel(&centered.mapv(|v| v * v)) / count;
        let std = var.mapv(|v| (v + self.epsilon).sqrt());
        let normalized = centered / &broadcast_channel(&std);

        let output =
            &normalized * &broadcast_channel(&self.gamma) + &broadcast_channel(&self.beta);

        // running = momentum * running + (1 - momentum) * batch
        self.running_mean = &self.running_mean * self.momentum + &mean * (1.0 - self.momentum);
        self.running_var = &self.running_var * self.momentum + &var * (1.0 - self.momentum);

        self.cache = Some(BatchNormCache {
            mean,
            var,
            std,
            normalized,
        });
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        self.backward_full(grad_output).map(|(grad_input, _, _)| grad_input)
    }

    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.gamma.view().into_dyn(), self.beta.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.gamma.view_mut().into_dyn(), self.beta.view_mut().into_dyn()]
    }

    fn gradients(&self) -> Option<Vec<ArrayViewD<'_, f32>>> {
        match (&self.grad_gamma, &self.grad_beta) {
            (Some(g), Some(b)) => Some(vec![g.view().into_dyn(), b.view().into_dyn()]),
            _ => None,
        }
    }
}
