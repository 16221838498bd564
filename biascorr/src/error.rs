//! Error types for biascorr

use thiserror::Error;

use crate::tensor::TensorError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A structural path segment or a named parameter does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Captured outputs, parameters or layer kinds that cannot be reconciled.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Arguments passed to an operation are invalid.
    #[error("Incorrect parameters: {0}")]
    ParameterError(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, Error>;
