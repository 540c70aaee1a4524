//! 2D Convolutional layer implementation
//!
//! This module provides a Conv2DLayer that performs stride-1 2D cross-correlation
//! with symmetric zero-padding. Both passes are lowered to matrix products over
//! an im2col buffer: every column holds one receptive field of the padded input.

use crate::error::{NetworkError, Result};
use crate::layers::Layer;
use crate::utils::init::he_normal;
use crate::utils::stats::{broadcast_channel, sum_per_channel};
use ndarray::{s, Array1, Array2, Array4, ArrayViewD, ArrayViewMutD};
use rand::Rng;

/// 2D Convolutional layer with learnable filters.
///
/// # Fields
///
/// * `in_channels` - Number of input channels (e.g., 3 for RGB)
/// * `out_channels` - Number of output feature maps (number of filters)
/// * `kernel_size` - Size of the square kernel
/// * `padding` - Zero-padding applied on every side of the input
/// * `weights` - Filters shaped (out_channels, in_channels, kernel_size, kernel_size)
/// * `biases` - One bias per output channel
///
/// # Example
///
/// ```
/// use cnn_sgd::layers::{Conv2DLayer, Layer};
/// use ndarray::Array4;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let mut rng = StdRng::seed_from_u64(42);
/// let mut layer = Conv2DLayer::new(3, 16, 3, 1, &mut rng).unwrap();
/// let output = layer.forward(&Array4::zeros((2, 3, 32, 32))).unwrap();
/// assert_eq!(output.dim(), (2, 16, 32, 32));
/// ```
#[derive(Debug, Clone)]
pub struct Conv2DLayer {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    padding: usize,
    weights: Array4<f32>,
    biases: Array1<f32>,
    grad_weights: Option<Array4<f32>>,
    grad_biases: Option<Array1<f32>>,
    // Zero-padded input of the last forward pass
    cached_padded: Option<Array4<f32>>,
}

impl Conv2DLayer {
    /// Create a new Conv2DLayer with He initialization.
    ///
    /// Weights are drawn from N(0, sqrt(2 / (in_channels × kernel_size²))).
    /// Biases are initialized to zero.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if out_channels == 0 {
            return Err(NetworkError::InvalidConfig(
                "conv2d out_channels must be positive".to_string(),
            ));
        }
        let fan_in = in_channels * kernel_size * kernel_size;
        let weights = he_normal(
            (out_channels, in_channels, kernel_size, kernel_size),
            fan_in,
            rng,
        )?;
        Self::from_parameters(weights, Array1::zeros(out_channels), padding)
    }

    /// Create a layer from explicit weights and biases.
    ///
    /// `weights` must be (out_channels, in_channels, k, k) with a square kernel
    /// and `biases` must hold one value per output channel.
    pub fn from_parameters(
        weights: Array4<f32>,
        biases: Array1<f32>,
        padding: usize,
    ) -> Result<Self> {
        let (out_channels, in_channels, kh, kw) = weights.dim();
        if kh != kw || kh == 0 || in_channels == 0 {
            return Err(NetworkError::InvalidConfig(format!(
                "conv2d kernel must be square and non-empty, got {:?}",
                weights.shape()
            )));
        }
        if biases.len() != out_channels {
            return Err(NetworkError::shape(
                "conv2d bias",
                &[out_channels],
                biases.shape(),
            ));
        }
        Ok(Self {
            in_channels,
            out_channels,
            kernel_size: kh,
            padding,
            weights: weights.as_standard_layout().into_owned(),
            biases,
            grad_weights: None,
            grad_biases: None,
            cached_padded: None,
        })
    }

    /// Get the number of input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Get the number of output channels (filters).
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Get the kernel size.
    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Get the padding amount.
    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn weights(&self) -> &Array4<f32> {
        &self.weights
    }

    pub fn biases(&self) -> &Array1<f32> {
        &self.biases
    }

    /// Weight gradient from the last backward pass.
    pub fn grad_weights(&self) -> Option<&Array4<f32>> {
        self.grad_weights.as_ref()
    }

    /// Bias gradient from the last backward pass.
    pub fn grad_biases(&self) -> Option<&Array1<f32>> {
        self.grad_biases.as_ref()
    }

    /// Output spatial size for an input of `height` × `width`.
    ///
    /// Calculated as: size + 2*padding - kernel_size + 1
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let padded_h = height + 2 * self.padding;
        let padded_w = width + 2 * self.padding;
        if padded_h < self.kernel_size || padded_w < self.kernel_size {
            return Err(NetworkError::shape(
                "conv2d input smaller than kernel",
                &[self.kernel_size, self.kernel_size],
                &[padded_h, padded_w],
            ));
        }
        Ok((
            padded_h - self.kernel_size + 1,
            padded_w - self.kernel_size + 1,
        ))
    }

    fn weight_matrix(&self) -> Result<ndarray::ArrayView2<'_, f32>> {
        let k = self.kernel_size;
        Ok(self
            .weights
            .view()
            .into_shape_with_order((self.out_channels, self.in_channels * k * k))?)
    }
}

fn pad(input: &Array4<f32>, padding: usize) -> Array4<f32> {
    if padding == 0 {
        return input.clone();
    }
    let (n, c, h, w) = input.dim();
    let mut padded = Array4::zeros((n, c, h + 2 * padding, w + 2 * padding));
    padded
        .slice_mut(s![.., .., padding..padding + h, padding..padding + w])
        .assign(input);
    padded
}

// Row index: (channel, ki, kj); column index: (sample, oy, ox).
fn im2col(padded: &Array4<f32>, k: usize, out_h: usize, out_w: usize) -> Array2<f32> {
    let (n, c, _, _) = padded.dim();
    let mut cols = Array2::zeros((c * k * k, n * out_h * out_w));
    for b in 0..n {
        for ch in 0..c {
            for ky in 0..k {
                for kx in 0..k {
                    let row = (ch * k + ky) * k + kx;
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            cols[[row, (b * out_h + oy) * out_w + ox]] =
                                padded[[b, ch, oy + ky, ox + kx]];
                        }
                    }
                }
            }
        }
    }
    cols
}

// Inverse scatter of im2col: overlapping receptive fields accumulate.
fn col2im(
    cols: &Array2<f32>,
    padded_dim: (usize, usize, usize, usize),
    k: usize,
    out_h: usize,
    out_w: usize,
) -> Array4<f32> {
    let (n, c, _, _) = padded_dim;
    let mut padded = Array4::zeros(padded_dim);
    for b in 0..n {
        for ch in 0..c {
            for ky in 0..k {
                for kx in 0..k {
                    let row = (ch * k + ky) * k + kx;
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            padded[[b, ch, oy + ky, ox + kx]] +=
                                cols[[row, (b * out_h + oy) * out_w + ox]];
                        }
                    }
                }
            }
        }
    }
    padded
}

impl Layer for Conv2DLayer {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    /// Pads the input, correlates it with every filter and adds the bias.
    ///
    /// Input is (batch, in_channels, H, W); output is (batch, out_channels,
    /// H + 2·pad − k + 1, W + 2·pad − k + 1).
    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        if c != self.in_channels {
            return Err(NetworkError::shape(
                "conv2d forward",
                &[n, self.in_channels, h, w],
                input.shape(),
            ));
        }
        let (out_h, out_w) = self.output_size(h, w)?;

        let padded = pad(input, self.padding);
        let cols = im2col(&padded, self.kernel_size, out_h, out_w);
        let out_mat = self.weight_matrix()?.dot(&cols);
        let mut output = out_mat
            .into_shape_with_order((self.out_channels, n, out_h, out_w))?
            .permuted_axes([1, 0, 2, 3])
            .as_standard_layout()
            .into_owned();
        output += &broadcast_channel(&self.biases);

        self.cached_padded = Some(padded);
        Ok(output)
    }

    /// Computes weight, bias and input gradients.
    ///
    /// The weight gradient correlates the padded input with `grad_output`;
    /// the input gradient is the full correlation of `grad_output` with the
    /// spatially flipped filters (computed as a col2im scatter of Wᵀ·dout),
    /// cropped back to the unpadded input size.
    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let padded = self.cached_padded.take().ok_or(NetworkError::StaleCache(
            "conv2d backward called without a preceding forward",
        ))?;
        let (n, c, padded_h, padded_w) = padded.dim();
        let k = self.kernel_size;
        let (out_h, out_w) = (padded_h - k + 1, padded_w - k + 1);
        let expected = [n, self.out_channels, out_h, out_w];
        if grad_output.shape() != expected {
            self.cached_padded = Some(padded);
            return Err(NetworkError::shape(
                "conv2d backward",
                &expected,
                grad_output.shape(),
            ));
        }

        let grad_mat = grad_output
            .view()
            .permuted_axes([1, 0, 2, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((self.out_channels, n * out_h * out_w))?;
        let cols = im2col(&padded, k, out_h, out_w);

        let grad_weights = grad_mat
            .dot(&cols.t())
            .into_shape_with_order((self.out_channels, c, k, k))?;
        let grad_biases = sum_per_channel(grad_output);

        let grad_cols = self.weight_matrix()?.t().dot(&grad_mat);
        let grad_padded = col2im(&grad_cols, padded.dim(), k, out_h, out_w);
        let p = self.padding;
        let grad_input = grad_padded
            .slice(s![.., .., p..padded_h - p, p..padded_w - p])
            .to_owned();

        self.grad_weights = Some(grad_weights);
        self.grad_biases = Some(grad_biases);
        Ok(grad_input)
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv2d_initialization() {
        let mut rng = StdRng::seed_from_u64(42);
        let layer = Conv2DLayer::new(3, 8, 3, 1, &mut rng).unwrap();

        assert_eq!(layer.in_channels(), 3);
        assert_eq!(layer.out_channels(), 8);
        assert_eq!(layer.kernel_size(), 3);
        assert_eq!(layer.padding(), 1);
        assert_eq!(layer.weights().dim(), (8, 3, 3, 3));
        assert!(layer.biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_conv2d_parameter_count() {
        let mut rng = StdRng::seed_from_u64(42);
        let layer = Conv2DLayer::new(1, 8, 3, 1, &mut rng).unwrap();

        // weights: 8 * 1 * 3 * 3 = 72, biases: 8
        assert_eq!(layer.parameter_count(), 80);
    }

    #[test]
    fn test_conv2d_output_dimensions() {
        let mut rng = StdRng::seed_from_u64(42);
        let same = Conv2DLayer::new(1, 8, 3, 1, &mut rng).unwrap();
        assert_eq!(same.output_size(28, 28).unwrap(), (28, 28));

        let valid = Conv2DLayer::new(1, 8, 3, 0, &mut rng).unwrap();
        assert_eq!(valid.output_size(28, 28).unwrap(), (26, 26));
        assert!(valid.output_size(2, 2).is_err());
    }

    #[test]
    fn test_conv2d_known_correlation() {
        // Single 2x2 filter of ones over a 3x3 ramp, no padding.
        let weights = Array4::from_elem((1, 1, 2, 2), 1.0f32);
        let mut layer =
            Conv2DLayer::from_parameters(weights, Array1::from_elem(1, 0.5), 0).unwrap();
        let input = Array4::from_shape_fn((1, 1, 3, 3), |(_, _, i, j)| (i * 3 + j) as f32);

        let output = layer.forward(&input).unwrap();

        // Window sums: 0+1+3+4=8, 1+2+4+5=12, 3+4+6+7=20, 4+5+7+8=24
        assert_eq!(output.dim(), (1, 1, 2, 2));
        assert_eq!(output[[0, 0, 0, 0]], 8.5);
        assert_eq!(output[[0, 0, 0, 1]], 12.5);
        assert_eq!(output[[0, 0, 1, 0]], 20.5);
        assert_eq!(output[[0, 0, 1, 1]], 24.5);
    }

    #[test]
    fn test_conv2d_backward_shapes() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Conv2DLayer::new(2, 4, 3, 1, &mut rng).unwrap();
        let input = Array4::from_elem((3, 2, 5, 6), 0.25f32);

        let output = layer.forward(&input).unwrap();
        let grad_input = layer.backward(&Array4::ones(output.dim())).unwrap();

        assert_eq!(grad_input.dim(), input.dim());
        assert_eq!(layer.grad_weights().unwrap().dim(), layer.weights().dim());
        assert_eq!(layer.grad_biases().unwrap().len(), 4);
        // Bias gradient sums dout over batch and spatial axes
        assert_eq!(layer.grad_biases().unwrap()[0], (3 * 5 * 6) as f32);
    }

    #[test]
    fn test_conv2d_channel_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Conv2DLayer::new(3, 4, 3, 1, &mut rng).unwrap();
        let err = layer.forward(&Array4::zeros((1, 2, 8, 8))).unwrap_err();
        assert!(matches!(err, NetworkError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_conv2d_backward_twice_is_stale() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Conv2DLayer::new(1, 1, 3, 1, &mut rng).unwrap();
        let output = layer.forward(&Array4::ones((1, 1, 4, 4))).unwrap();
        let grad = Array4::ones(output.dim());
        layer.backward(&grad).unwrap();
        assert!(matches!(
            layer.backward(&grad),
            Err(NetworkError::StaleCache(_))
        ));
    }

    #[test]
    fn test_conv2d_deterministic_initialization() {
        let layer1 = Conv2DLayer::new(3, 16, 5, 2, &mut StdRng::seed_from_u64(12345)).unwrap();
        let layer2 = Conv2DLayer::new(3, 16, 5, 2, &mut StdRng::seed_from_u64(12345)).unwrap();
        assert_eq!(layer1.weights(), layer2.weights());
    }

    #[test]
    fn test_conv2d_shape_error_keeps_cache() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut layer = Conv2DLayer::new(1, 2, 3, 1, &mut rng).unwrap();
        layer.forward(&Array4::ones((1, 1, 4, 4))).unwrap();

        assert!(matches!(
            layer.backward(&Array4::ones((1, 3, 4, 4))),
            Err(NetworkError::ShapeMismatch { .. })
        ));
        assert_eq!(
            layer.backward(&Array4::ones((1, 2, 4, 4))).unwrap().dim(),
            (1, 1, 4, 4)
        );
    }
}
