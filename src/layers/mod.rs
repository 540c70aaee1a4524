//! Layer abstractions for the network
//!
//! This module provides the Layer trait and the layer types the CNN is built
//! from. Image layers work on (batch, channel, height, width) tensors; the
//! fully-connected layer works on (features, batch) matrices. [`Flatten`] is
//! the single place where one orientation is turned into the other.

mod r#trait;
pub mod batchnorm;
pub mod conv2d;
pub mod flatten;
pub mod linear;
pub mod maxpool;

// Re-export the Layer trait for convenience
pub use r#trait::Layer;
pub use batchnorm::BatchNorm2D;
pub use conv2d::Conv2DLayer;
pub use flatten::Flatten;
pub use linear::LinearLayer;
pub use maxpool::MaxPool2D;
