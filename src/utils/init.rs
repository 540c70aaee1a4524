//! Weight initializers.

use crate::error::{NetworkError, Result};
use ndarray::{Array, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Kaiming/He normal initialization.
///
/// Samples from N(0, std) with std = sqrt(2 / fan_in), suited to layers
/// followed by ReLU.
pub fn he_normal<D, Sh, R>(shape: Sh, fan_in: usize, rng: &mut R) -> Result<Array<f32, D>>
where
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
    R: Rng + ?Sized,
{
    if fan_in == 0 {
        return Err(NetworkError::InvalidConfig(
            "fan_in must be positive for He initialization".to_string(),
        ));
    }
    let std = (2.0f32 / fan_in as f32).sqrt();
    let normal = Normal::new(0.0f32, std)
        .map_err(|e| NetworkError::InvalidConfig(format!("He initialization: {e}")))?;
    Ok(Array::from_shape_simple_fn(shape, || normal.sample(&mut *rng)))
}
