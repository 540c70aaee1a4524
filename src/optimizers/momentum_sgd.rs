//! Stochastic gradient descent with momentum
//!
//! Per parameter the update is
//!
//! ```text
//! v = μ · v − η · g
//! w = w + v
//! ```
//!
//! where μ is the momentum, η the learning rate of the current step and `v`
//! the velocity buffer, which starts at zero and persists across the run.

use crate::error::{NetworkError, Result};
use crate::optimizers::Optimizer;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Momentum SGD holding one velocity buffer per registered parameter.
///
/// # Example
///
/// ```
/// use cnn_sgd::optimizers::MomentumSgd;
///
/// let optimizer: MomentumSgd<&str> = MomentumSgd::new(0.9);
/// assert_eq!(optimizer.momentum(), 0.9);
/// assert!(!optimizer.is_initialized());
/// ```
#[derive(Debug, Clone)]
pub struct MomentumSgd<K> {
    momentum: f32,
    velocities: Option<BTreeMap<K, ArrayD<f32>>>,
}

impl<K: Ord + Copy + Display> MomentumSgd<K> {
    pub fn new(momentum: f32) -> Self {
        Self {
            momentum,
            velocities: None,
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn is_initialized(&self) -> bool {
        self.velocities.is_some()
    }

    /// Current velocity buffer of `name`, if registered.
    pub fn velocity(&self, name: &K) -> Option<&ArrayD<f32>> {
        self.velocities.as_ref().and_then(|v| v.get(name))
    }

    // Everything is checked before any buffer is touched, so a rejected
    // update leaves both parameters and velocities unchanged.
    fn validate(
        velocities: &BTreeMap<K, ArrayD<f32>>,
        parameters: &[(K, ArrayViewMutD<'_, f32>)],
        gradients: &BTreeMap<K, ArrayD<f32>>,
    ) -> Result<()> {
        for (name, param) in parameters {
            let velocity = velocities
                .get(name)
                .ok_or_else(|| NetworkError::UnknownParameter(name.to_string()))?;
            if param.shape() != velocity.shape() {
                return Err(NetworkError::shape(
                    "momentum sgd parameter",
                    velocity.shape(),
                    param.shape(),
                ));
            }
        }
        for (name, grad) in gradients {
            let velocity = velocities
                .get(name)
                .ok_or_else(|| NetworkError::UnknownParameter(name.to_string()))?;
            if !parameters.iter().any(|(p, _)| p == name) {
                return Err(NetworkError::UnknownParameter(name.to_string()));
            }
            if grad.shape() != velocity.shape() {
                return Err(NetworkError::shape(
                    "momentum sgd gradient",
                    velocity.shape(),
                    grad.shape(),
                ));
            }
        }
        Ok(())
    }
}

impl<K: Ord + Copy + Display> Optimizer<K> for MomentumSgd<K> {
    fn initialize(&mut self, parameters: &[(K, ArrayViewD<'_, f32>)]) -> Result<()> {
        if self.velocities.is_some() {
            return Err(NetworkError::OptimizerAlreadyInitialized);
        }
        let mut velocities = BTreeMap::new();
        for (name, param) in parameters {
            if velocities
                .insert(*name, ArrayD::zeros(param.raw_dim()))
                .is_some()
            {
                return Err(NetworkError::InvalidConfig(format!(
                    "parameter '{name}' registered twice"
                )));
            }
        }
        log::debug!("momentum sgd initialized with {} parameters", velocities.len());
        self.velocities = Some(velocities);
        Ok(())
    }

    fn update(
        &mut self,
        parameters: &mut [(K, ArrayViewMutD<'_, f32>)],
        gradients: &BTreeMap<K, ArrayD<f32>>,
        learning_rate: f32,
    ) -> Result<()> {
        let velocities = self
            .velocities
            .as_mut()
            .ok_or(NetworkError::UninitializedOptimizer)?;
        Self::validate(velocities, parameters, gradients)?;

        let momentum = self.momentum;
        for (name, param) in parameters.iter_mut() {
            let Some(grad) = gradients.get(&*name) else {
                continue;
            };
            let Some(velocity) = velocities.get_mut(&*name) else {
                continue;
            };
            velocity.zip_mut_with(grad, |v, &g| *v = momentum * *v - learning_rate * g);
            param.zip_mut_with(&*velocity, |p, &v| *p += v);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.velocities = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    fn grads(name: &'static str, value: ArrayD<f32>) -> BTreeMap<&'static str, ArrayD<f32>> {
        let mut map = BTreeMap::new();
        map.insert(name, value);
        map
    }

    #[test]
    fn test_first_step_moves_by_lr_times_gradient() {
        let mut w = array![1.0f32, 2.0, 3.0].into_dyn();
        let mut opt = MomentumSgd::new(0.9);
        opt.initialize(&[("w", w.view())]).unwrap();

        let g = array![0.1f32, -0.2, 0.0].into_dyn();
        opt.update(&mut [("w", w.view_mut())], &grads("w", g), 0.5)
            .unwrap();

        let expected = [0.95f32, 2.1, 3.0];
        for (a, e) in w.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_velocity_accumulates() {
        let mut w = array![0.0f32].into_dyn();
        let mut opt = MomentumSgd::new(0.5);
        opt.initialize(&[("w", w.view())]).unwrap();
        let g = array![1.0f32].into_dyn();
        for _ in 0..2 {
            opt.update(&mut [("w", w.view_mut())], &grads("w", g.clone()), 1.0)
                .unwrap();
        }
        // v1 = -1, v2 = 0.5 * -1 - 1 = -1.5, w = -2.5
        assert!((w[[0]] + 2.5).abs() < 1e-6);
        assert!((opt.velocity(&"w").unwrap()[[0]] + 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_update_before_initialize_fails() {
        let mut w = ArrayD::<f32>::zeros(IxDyn(&[2]));
        let mut opt = MomentumSgd::new(0.9);
        let result = opt.update(
            &mut [("w", w.view_mut())],
            &grads("w", ArrayD::zeros(IxDyn(&[2]))),
            0.1,
        );
        assert!(matches!(result, Err(NetworkError::UninitializedOptimizer)));
    }

    #[test]
    fn test_double_initialize_fails_until_reset() {
        let w = ArrayD::<f32>::zeros(IxDyn(&[2]));
        let mut opt = MomentumSgd::new(0.9);
        opt.initialize(&[("w", w.view())]).unwrap();
        assert!(matches!(
            opt.initialize(&[("w", w.view())]),
            Err(NetworkError::OptimizerAlreadyInitialized)
        ));
        opt.reset();
        assert!(opt.initialize(&[("w", w.view())]).is_ok());
    }

    #[test]
    fn test_unknown_gradient_name_rejected_without_side_effects() {
        let mut w = array![1.0f32].into_dyn();
        let mut opt = MomentumSgd::new(0.9);
        opt.initialize(&[("w", w.view())]).unwrap();

        let mut g = grads("w", array![1.0f32].into_dyn());
        g.insert("bias", array![1.0f32].into_dyn());
        let result = opt.update(&mut [("w", w.view_mut())], &g, 0.1);

        assert!(matches!(result, Err(NetworkError::UnknownParameter(ref n)) if n == "bias"));
        assert_eq!(w[[0]], 1.0);
        assert_eq!(opt.velocity(&"w").unwrap()[[0]], 0.0);
    }

    #[test]
    fn test_parameter_without_gradient_untouched() {
        let mut a = array![1.0f32].into_dyn();
        let mut b = array![1.0f32].into_dyn();
        let mut opt = MomentumSgd::new(0.9);
        opt.initialize(&[("a", a.view()), ("b", b.view())]).unwrap();
        opt.update(
            &mut [("a", a.view_mut()), ("b", b.view_mut())],
            &grads("a", array![1.0f32].into_dyn()),
            0.1,
        )
        .unwrap();
        assert!((a[[0]] - 0.9).abs() < 1e-6);
        assert_eq!(b[[0]], 1.0);
    }

    #[test]
    fn test_gradient_shape_mismatch_rejected() {
        let mut w = ArrayD::<f32>::zeros(IxDyn(&[2, 2]));
        let mut opt = MomentumSgd::new(0.9);
        opt.initialize(&[("w", w.view())]).unwrap();
        let result = opt.update(
            &mut [("w", w.view_mut())],
            &grads("w", ArrayD::zeros(IxDyn(&[4]))),
            0.1,
        );
        assert!(matches!(result, Err(NetworkError::ShapeMismatch { .. })));
    }
}
