//! Per-channel statistics over the batch and spatial axes of (N, C, H, W) tensors.

use crate::error::{NetworkError, Result};
use ndarray::{Array1, Array4, ArrayView4, Axis};

/// Sums a (N, C, H, W) tensor over every axis except the channel axis.
pub(crate) fn sum_per_channel(x: &Array4<f32>) -> Array1<f32> {
    x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

/// Views a per-channel vector as (1, C, 1, 1) so it broadcasts against (N, C, H, W).
pub(crate) fn broadcast_channel(values: &Array1<f32>) -> ArrayView4<'_, f32> {
    values
        .view()
        .insert_axis(Axis(0))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

/// Number of values per channel, N * H * W.
pub(crate) fn values_per_channel(x: &Array4<f32>) -> usize {
    let (n, _, h, w) = x.dim();
    n * h * w
}

/// Per-channel mean and standard deviation of an image batch.
///
/// The standard deviation is the population std plus [`ChannelStats::STD_EPSILON`],
/// so dividing by it never divides by zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    mean: Array1<f32>,
    std: Array1<f32>,
}

impl ChannelStats {
    /// Added to the standard deviation before dividing.
    pub const STD_EPSILON: f32 = 1e-5;

    /// Computes mean and std per channel over the batch, height and width axes.
    pub fn from_batch(x: &Array4<f32>) -> Result<Self> {
        let count = values_per_channel(x);
        if count == 0 {
            return Err(NetworkError::InvalidData(
                "cannot compute channel statistics of an empty batch".to_string(),
            ));
        }
        let mean = sum_per_channel(x) / count as f32;
        let centered = x - &broadcast_channel(&mean);
        let var = sum_per_channel(&centered.mapv(|v| v * v)) / count as f32;
        let std = var.mapv(|v| v.sqrt() + Self::STD_EPSILON);
        Ok(Self { mean, std })
    }

    /// Returns `(x - mean) / std` per channel.
    pub fn normalize(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let channels = x.dim().1;
        if channels != self.mean.len() {
            return Err(NetworkError::shape(
                "channel normalization",
                &[self.mean.len()],
                &[channels],
            ));
        }
        Ok((x - &broadcast_channel(&self.mean)) / &broadcast_channel(&self.std))
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn std(&self) -> &Array1<f32> {
        &self.std
    }
}
