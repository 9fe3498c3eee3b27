use thiserror::Error;

use crate::model::ModelError;
use crate::topology::Cell;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("invalid connection: {0}")]
    InvalidConnection(String),
    #[error("duplicate connection: {0}")]
    DuplicateConnection(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("missing right-hand side: {0}")]
    MissingRhs(String),
    #[error("model has interdependent components: {0}")]
    CoupledComponents(String),
    #[error("numerical divergence in cell {cell} at t = {time}")]
    NumericalDivergence { cell: Cell, time: f64 },
    #[error("simulation cancelled")]
    Cancelled,
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}
