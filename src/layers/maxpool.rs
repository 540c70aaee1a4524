//! 2D max-pooling layer
//!
//! Non-learnable downsampling. Each output value is the maximum of one
//! kernel × kernel window; the position of that maximum is kept so backward
//! can route the gradient to it.

use crate::error::{NetworkError, Result};
use crate::layers::Layer;
use ndarray::Array4;

/// Max-pooling over (batch, channel, H, W) tensors.
///
/// Output size per spatial axis is `(size - kernel) / stride + 1`, which is
/// `floor(size / stride)` for the non-overlapping case `kernel == stride`.
/// Remainder rows and columns are dropped; there is no padding.
///
/// Windows are scanned row-major and a later value replaces the current
/// maximum only when strictly greater, so ties resolve to the first position.
#[derive(Debug, Clone)]
pub struct MaxPool2D {
    kernel_size: usize,
    stride: usize,
    cache: Option<PoolCache>,
}

#[derive(Debug, Clone)]
struct PoolCache {
    input_dim: (usize, usize, usize, usize),
    // Row-major offset (ky * kernel + kx) of the maximum within each window
    argmax: Array4<usize>,
}

impl MaxPool2D {
    pub fn new(kernel_size: usize, stride: usize) -> Result<Self> {
        if kernel_size == 0 || stride == 0 {
            return Err(NetworkError::InvalidConfig(
                "max-pool kernel_size and stride must be positive".to_string(),
            ));
        }
        Ok(Self {
            kernel_size,
            stride,
            cache: None,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Output spatial size for an input of `height` × `width`.
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        if height < self.kernel_size || width < self.kernel_size {
            return Err(NetworkError::shape(
                "max-pool input smaller than window",
                &[self.kernel_size, self.kernel_size],
                &[height, width],
            ));
        }
        Ok((
            (height - self.kernel_size) / self.stride + 1,
            (width - self.kernel_size) / self.stride + 1,
        ))
    }

    /// Window offsets of the maxima found by the last forward pass.
    pub fn argmax(&self) -> Option<&Array4<usize>> {
        self.cache.as_ref().map(|c| &c.argmax)
    }
}

impl Layer for MaxPool2D {
    type Input = Array4<f32>;
    type Output = Array4<f32>;

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        let (out_h, out_w) = self.output_size(h, w)?;
        let k = self.kernel_size;

        let mut output = Array4::zeros((n, c, out_h, out_w));
        let mut argmax = Array4::zeros((n, c, out_h, out_w));

        for b in 0..n {
            for ch in 0..c {
                for py in 0..out_h {
                    for px in 0..out_w {
                        let iy0 = py * self.stride;
                        let ix0 = px * self.stride;

                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = 0usize;
                        for dy in 0..k {
                            for dx in 0..k {
                                let v = input[[b, ch, iy0 + dy, ix0 + dx]];
                                if v > best {
                                    best = v;
                                    best_idx = dy * k + dx;
                                }
                            }
                        }

                        output[[b, ch, py, px]] = best;
                        argmax[[b, ch, py, px]] = best_idx;
                    }
                }
            }
        }

        self.cache = Some(PoolCache {
            input_dim: (n, c, h, w),
            argmax,
        });
        Ok(output)
    }

    /// Scatters each upstream gradient to the window position that held the
    /// maximum; every other position receives zero.
    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let cache = self.cache.take().ok_or(NetworkError::StaleCache(
            "max-pool backward called without a preceding forward",
        ))?;
        if grad_output.shape() != cache.argmax.shape() {
            let err = NetworkError::shape(
                "max-pool backward",
                cache.argmax.shape(),
                grad_output.shape(),
            );
            self.cache = Some(cache);
            return Err(err);
        }
        let k = self.kernel_size;
        let mut grad_input = Array4::zeros(cache.input_dim);

        for ((b, ch, py, px), &offset) in cache.argmax.indexed_iter() {
            let iy = py * self.stride + offset / k;
            let ix = px * self.stride + offset % k;
            grad_input[[b, ch, iy, ix]] += grad_output[[b, ch, py, px]];
        }
        Ok(grad_input)
    }
}
