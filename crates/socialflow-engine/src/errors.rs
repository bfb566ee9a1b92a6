//! Error types for the engine's trait operations.

use thiserror::Error;

/// Errors from [`FlowStore`](super::traits::FlowStore).
#[derive(Debug, Error)]
pub enum FlowStoreError {
    #[error("flow not found: {id}")]
    NotFound { id: String },
    #[error("flow store error: {message}")]
    Store { message: String },
}

/// Errors from [`RunStore`](super::traits::RunStore).
#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("run not found: {id}")]
    NotFound { id: String },
    #[error("run store error: {message}")]
    Store { message: String },
    /// Another writer already appended a different event at `seq`, or the
    /// batch does not continue the run's ledger.
    #[error("ledger conflict on run {run_id}: got seq {seq}, next is {expected}")]
    Conflict {
        run_id: String,
        seq: u64,
        expected: u64,
    },
}

/// Errors from the action adapters. Recorded in the run trail, never shown
/// to the contact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdapterError {
    /// The platform refused the action (blocked user, policy, bad input).
    #[error("rejected: {message}")]
    Rejected { message: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("adapter panicked: {message}")]
    Panicked { message: String },
}

/// Trigger evaluation errors. Logged and the flow is skipped for that event.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid pattern '{pattern}' in flow {flow_id}: {message}")]
    InvalidPattern {
        flow_id: String,
        pattern: String,
        message: String,
    },
}

/// Every structural problem found in a flow, in discovery order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid flow: {}", problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }

    /// `Ok(())` when `problems` is empty.
    pub fn check(problems: Vec<String>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}
