//! Configuration structures for the model and the training run
//!
//! Both structures deserialize from JSON. Every field carries a default, so an
//! empty object `{}` describes the CIFAR-10 network trained with the default
//! three-phase learning-rate schedule.
//!
//! # Example
//!
//! ```json
//! {
//!   "initial_lr": 0.001,
//!   "batch_size": 64,
//!   "lr_schedule": [
//!     { "epochs": 50, "multiplier": 1.0 },
//!     { "epochs": 30, "multiplier": 0.1 },
//!     { "epochs": 20, "multiplier": 0.01 }
//!   ],
//!   "model": { "lambda_reg": 0.0001, "momentum": 0.9 }
//! }
//! ```

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// Number of conv → batch-norm → ReLU → max-pool blocks in the network.
pub const CONV_BLOCKS: usize = 3;

/// Architecture and optimizer hyperparameters of [`crate::model::Cnn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Channels of the input images (3 for RGB)
    pub in_channels: usize,
    /// Height and width of the (square) input images
    pub image_size: usize,
    /// Output channels of the three convolution blocks
    pub conv_channels: [usize; CONV_BLOCKS],
    /// Square kernel size of every convolution
    pub kernel_size: usize,
    /// Symmetric zero-padding of every convolution
    pub padding: usize,
    /// Kernel size and stride of every max-pool stage
    pub pool_size: usize,
    /// Width of the hidden fully-connected layer
    pub hidden_units: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// L2 regularization strength (0 disables it)
    pub lambda_reg: f32,
    /// Momentum of the SGD optimizer
    pub momentum: f32,
    /// Variance epsilon of the batch-norm layers
    pub bn_epsilon: f32,
    /// Momentum of the batch-norm running statistics
    pub bn_momentum: f32,
    /// Seed for weight initialization (None draws from the OS)
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            image_size: 32,
            conv_channels: [16, 32, 64],
            kernel_size: 3,
            padding: 1,
            pool_size: 2,
            hidden_units: 512,
            num_classes: 10,
            lambda_reg: 0.0,
            momentum: 0.9,
            bn_epsilon: 1e-5,
            bn_momentum: 0.9,
            seed: None,
        }
    }
}

impl ModelConfig {
    /// Spatial size after each of the three blocks.
    ///
    /// Convolution maps `s` to `s + 2*padding - kernel_size + 1`; pooling maps
    /// `s` to `(s - pool_size) / pool_size + 1`, dropping remainder rows.
    pub fn block_output_sizes(&self) -> Result<[usize; CONV_BLOCKS]> {
        let mut sizes = [0usize; CONV_BLOCKS];
        let mut size = self.image_size;
        for (block, out) in sizes.iter_mut().enumerate() {
            let padded = size + 2 * self.padding;
            if padded < self.kernel_size {
                return Err(NetworkError::InvalidConfig(format!(
                    "block {}: padded size {} is smaller than kernel {}",
                    block + 1,
                    padded,
                    self.kernel_size
                )));
            }
            let conv = padded - self.kernel_size + 1;
            if conv < self.pool_size {
                return Err(NetworkError::InvalidConfig(format!(
                    "block {}: feature map {} is smaller than pool window {}",
                    block + 1,
                    conv,
                    self.pool_size
                )));
            }
            size = (conv - self.pool_size) / self.pool_size + 1;
            *out = size;
        }
        Ok(sizes)
    }

    /// Number of features entering the first fully-connected layer.
    pub fn flattened_features(&self) -> Result<usize> {
        let sizes = self.block_output_sizes()?;
        let last = sizes[CONV_BLOCKS - 1];
        Ok(self.conv_channels[CONV_BLOCKS - 1] * last * last)
    }

    /// Checks every field against its valid range.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("image_size", self.image_size),
            ("kernel_size", self.kernel_size),
            ("pool_size", self.pool_size),
            ("hidden_units", self.hidden_units),
            ("num_classes", self.num_classes),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(NetworkError::InvalidConfig(format!(
                    "{name} must be positive"
                )));
            }
        }
        if self.conv_channels.contains(&0) {
            return Err(NetworkError::InvalidConfig(
                "conv_channels must all be positive".to_string(),
            ));
        }
        if !(self.lambda_reg >= 0.0 && self.lambda_reg.is_finite()) {
            return Err(NetworkError::InvalidConfig(
                "lambda_reg must be non-negative".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(NetworkError::InvalidConfig(
                "momentum must be in range [0.0, 1.0)".to_string(),
            ));
        }
        if !(self.bn_epsilon > 0.0) {
            return Err(NetworkError::InvalidConfig(
                "bn_epsilon must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(NetworkError::InvalidConfig(
                "bn_momentum must be in range [0.0, 1.0]".to_string(),
            ));
        }
        self.block_output_sizes()?;
        Ok(())
    }
}

/// One phase of the piecewise learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulePhase {
    /// Number of epochs trained in this phase
    pub epochs: usize,
    /// Factor applied to the initial learning rate during this phase
    pub multiplier: f32,
}

impl SchedulePhase {
    pub fn new(epochs: usize, multiplier: f32) -> Self {
        Self { epochs, multiplier }
    }
}

/// Settings of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Base learning rate; each phase scales it by its multiplier
    pub initial_lr: f32,
    /// Mini-batch size (a trailing partial batch is dropped)
    pub batch_size: usize,
    /// Ordered (epochs, multiplier) phases
    pub lr_schedule: Vec<SchedulePhase>,
    /// Log batch progress every `log_every` batches (0 disables it)
    pub log_every: usize,
    /// Seed for the per-epoch shuffle (None draws from the OS)
    pub seed: Option<u64>,
    /// Network configuration
    pub model: ModelConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            initial_lr: 1e-3,
            batch_size: 64,
            lr_schedule: vec![
                SchedulePhase::new(50, 1.0),
                SchedulePhase::new(30, 0.1),
                SchedulePhase::new(20, 0.01),
            ],
            log_every: 10,
            seed: None,
            model: ModelConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Checks the run settings and the nested model configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_lr > 0.0 && self.initial_lr.is_finite()) {
            return Err(NetworkError::InvalidConfig(
                "initial_lr must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(NetworkError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.lr_schedule.is_empty() {
            return Err(NetworkError::InvalidConfig(
                "lr_schedule must have at least one phase".to_string(),
            ));
        }
        for (i, phase) in self.lr_schedule.iter().enumerate() {
            if !(phase.multiplier >= 0.0 && phase.multiplier.is_finite()) {
                return Err(NetworkError::InvalidConfig(format!(
                    "phase {i}: multiplier must be finite and non-negative"
                )));
            }
        }
        if self.lr_schedule.iter().all(|phase| phase.epochs == 0) {
            return Err(NetworkError::InvalidConfig(
                "lr_schedule must train for at least one epoch".to_string(),
            ));
        }
        self.model.validate()
    }
}

/// Loads a training configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it into a `TrainingConfig` and
/// validates the result.
///
/// # Examples
///
/// ```no_run
/// use cnn_sgd::config::load_config;
///
/// let cfg = load_config("config/cifar10.json").unwrap();
/// assert!(cfg.batch_size > 0);
/// ```
pub fn load_config(path: &str) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_matches_cifar_architecture() {
        let config = ModelConfig::default();
        assert_eq!(config.block_output_sizes().unwrap(), [16, 8, 4]);
        assert_eq!(config.flattened_features().unwrap(), 64 * 4 * 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: TrainingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.lr_schedule.len(), 3);
        assert_eq!(config.model.lambda_reg, 0.0);
    }

    #[test]
    fn test_image_too_small_for_three_pools() {
        let config = ModelConfig {
            image_size: 4,
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pool_drops_remainder() {
        let config = ModelConfig {
            image_size: 9,
            ..ModelConfig::default()
        };
        // 9 -> 4 -> 2 -> 1
        assert_eq!(config.block_output_sizes().unwrap(), [4, 2, 1]);
    }

    #[test]
    fn test_rejects_momentum_of_one() {
        let config = ModelConfig {
            momentum: 1.0,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_multiplier() {
        let config = TrainingConfig {
            lr_schedule: vec![SchedulePhase::new(1, -0.1)],
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_schedule_without_epochs() {
        let config = TrainingConfig {
            lr_schedule: vec![SchedulePhase::new(0, 1.0), SchedulePhase::new(0, 0.1)],
            ..TrainingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetworkError::InvalidConfig(_))
        ));
    }
}
