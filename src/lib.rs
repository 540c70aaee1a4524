//! Convolutional neural network training engine
//!
//! This library implements the forward and backward passes of a small image
//! classifier by hand (no automatic differentiation), together with the
//! momentum SGD optimizer and the epoch/mini-batch training loop that drive it.
//!
//! # Modules
//!
//! - `layers`: Layer trait and implementations (Conv2D, BatchNorm2D, MaxPool2D, Linear, Flatten)
//! - `losses`: Cross-entropy (paired with softmax) and L2 weight regularization
//! - `optimizers`: Optimizer trait and momentum SGD
//! - `model`: The fixed three-block CNN composing the layers above
//! - `trainer`: Epoch/batch orchestration, learning-rate phases and metric history
//! - `utils`: Activations, per-channel statistics and the learning-rate schedule
//! - `config`: JSON-backed model and training configuration
//! - `error`: Crate error type

pub mod config;
pub mod error;
pub mod layers;
pub mod losses;
pub mod model;
pub mod optimizers;
pub mod trainer;
pub mod utils;

pub use error::{NetworkError, Result};
pub use model::{Cnn, Gradients, ParamName};
pub use trainer::{DataSplits, MetricsHistory, Trainer};
