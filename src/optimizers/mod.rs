//! Optimizer abstractions for parameter updates
//!
//! Optimizers never own parameters. The model hands them named mutable views
//! into its own storage for the duration of one update call; the optimizer
//! only owns its per-parameter state (for momentum SGD, the velocity buffers).
//!
//! # Example
//!
//! ```
//! use cnn_sgd::optimizers::{MomentumSgd, Optimizer};
//! use ndarray::{ArrayD, IxDyn};
//! use std::collections::BTreeMap;
//!
//! let mut weights = ArrayD::<f32>::ones(IxDyn(&[2, 2]));
//! let mut optimizer = MomentumSgd::new(0.9);
//! optimizer.initialize(&[("w", weights.view())]).unwrap();
//!
//! let mut grads = BTreeMap::new();
//! grads.insert("w", ArrayD::<f32>::from_elem(IxDyn(&[2, 2]), 0.5));
//! optimizer
//!     .update(&mut [("w", weights.view_mut())], &grads, 0.1)
//!     .unwrap();
//! assert!((weights[[0, 0]] - 0.95).abs() < 1e-6);
//! ```

pub mod momentum_sgd;

pub use momentum_sgd::MomentumSgd;

use crate::error::Result;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};
use std::collections::BTreeMap;

/// Core trait for optimizers keyed by parameter name `K`.
///
/// # State Management
///
/// `initialize` registers every parameter once and allocates the optimizer
/// state. `update` then applies one step per call. `reset` drops all state so
/// the optimizer can be initialized again for a new run.
pub trait Optimizer<K> {
    /// Registers the full named parameter set and allocates per-parameter state.
    ///
    /// Fails with `OptimizerAlreadyInitialized` when called twice without a
    /// `reset` in between.
    fn initialize(&mut self, parameters: &[(K, ArrayViewD<'_, f32>)]) -> Result<()>;

    /// Applies one update step in place.
    ///
    /// Every name in `gradients` must have been registered by `initialize`.
    /// Parameters without a gradient in this call are left untouched.
    fn update(
        &mut self,
        parameters: &mut [(K, ArrayViewMutD<'_, f32>)],
        gradients: &BTreeMap<K, ArrayD<f32>>,
        learning_rate: f32,
    ) -> Result<()>;

    /// Clears all optimizer state.
    fn reset(&mut self);
}
