//! Error enum for [`super::Tensor`] construction and its related operations

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    /// The arguments passed to a tensor method are malformed, i.e. data length
    /// does not line up with the shape or a stride of zero was requested.
    #[error("Parameters to Tensor method were incorrect: {0}")]
    ParameterError(String),
    /// The shapes of two operands cannot be combined.
    #[error("Incompatible tensor shapes: {0}")]
    ShapeError(String),
}
