//! Engine error types.

use thiserror::Error;

use crate::errors::{FlowStoreError, RunStoreError, ValidationError};
use crate::executor::ExecutorError;

/// Errors from [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The requested flow was not found.
    #[error("flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },
    /// A flow with this id already exists.
    #[error("flow already exists: {flow_id}")]
    FlowExists { flow_id: String },
    /// The requested run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
    /// The flow failed validation where a valid flow is required.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// An executor error occurred.
    #[error("executor error: {0}")]
    Executor(ExecutorError),
    /// A flow store error occurred.
    #[error("flow store error: {0}")]
    FlowStore(#[from] FlowStoreError),
    /// A run store error occurred.
    #[error("run store error: {0}")]
    RunStore(#[from] RunStoreError),
    /// An error during engine construction.
    #[error("build error: {message}")]
    Build { message: String },
}

impl From<ExecutorError> for EngineError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::RunNotFound { run_id } => Self::RunNotFound { run_id },
            ExecutorError::Invalid(v) => Self::Invalid(v),
            other => Self::Executor(other),
        }
    }
}
