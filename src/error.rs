//! Error type shared by every layer, loss, optimizer and the trainer.

use std::fmt;

/// Errors raised while building, running or training the network.
///
/// All of them are contract violations: nothing in the crate retries, so a
/// failed batch aborts the training run.
#[derive(Debug)]
pub enum NetworkError {
    /// An array reached a component with a shape it was not configured for.
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// `update` was called before `initialize`.
    UninitializedOptimizer,
    /// `initialize` was called twice without a `reset` in between.
    OptimizerAlreadyInitialized,
    /// A gradient was supplied for a parameter the optimizer never registered.
    UnknownParameter(String),
    /// `backward` ran without a matching `forward` (or ran twice for one forward).
    StaleCache(&'static str),
    /// A loss or activation became NaN or infinite.
    NumericInstability(String),
    /// Configuration values outside their valid range.
    InvalidConfig(String),
    /// Dataset arrays that disagree with each other or with the model.
    InvalidData(String),
    /// Config file could not be read.
    Io(std::io::Error),
    /// Config file is not valid JSON for the expected structure.
    Json(serde_json::Error),
    /// An ndarray reshape failed because of the memory layout.
    Layout(ndarray::ShapeError),
}

impl NetworkError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                context,
                expected,
                got,
            } => write!(f, "{context}: expected shape {expected:?}, got {got:?}"),
            Self::UninitializedOptimizer => {
                write!(f, "optimizer update called before initialize")
            }
            Self::OptimizerAlreadyInitialized => {
                write!(f, "optimizer already initialized; call reset first")
            }
            Self::UnknownParameter(name) => {
                write!(f, "gradient supplied for unregistered parameter '{name}'")
            }
            Self::StaleCache(msg) => write!(f, "stale forward cache: {msg}"),
            Self::NumericInstability(msg) => write!(f, "numeric instability: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Json(err) => write!(f, "config parse error: {err}"),
            Self::Layout(err) => write!(f, "array layout error: {err}"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Layout(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<ndarray::ShapeError> for NetworkError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Layout(err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = NetworkError::shape("conv2d forward", &[2, 3, 8, 8], &[2, 1, 8, 8]);
        let msg = err.to_string();
        assert!(msg.contains("conv2d forward"));
        assert!(msg.contains("[2, 3, 8, 8]"));
        assert!(msg.contains("[2, 1, 8, 8]"));
    }

    #[test]
    fn test_io_error_has_source() {
        let err: NetworkError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}
