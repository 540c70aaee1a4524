//! Shared utilities for the network
//!
//! Activation functions, per-channel statistics used for input and batch
//! normalization, and the learning-rate schedule.

pub mod activations;
pub mod init;
pub mod lr_scheduler;
pub mod stats;

pub use activations::{relu, relu_backward, softmax_columns};
pub use lr_scheduler::{LRScheduler, PiecewiseSchedule};
pub use stats::ChannelStats;
