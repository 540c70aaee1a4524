//! Loss functions
//!
//! - [`CrossEntropyLoss`]: negative log-likelihood of softmax probabilities,
//!   with the fused softmax + cross-entropy gradient
//! - [`L2RegularizationLoss`]: weight-decay penalty over the weight tensors

pub mod cross_entropy;
pub mod l2;

pub use cross_entropy::CrossEntropyLoss;
pub use l2::L2RegularizationLoss;
