//! Engine error types.

use thiserror::Error;

/// Errors returned by remote fleet and instance APIs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("fleet not found: {0}")]
    NotFound(String),
}

/// Errors returned by the node registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node already registered: {0}")]
    AlreadyRegistered(String),
}

/// Errors that abort a reconciliation tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to read fleet state: {0}")]
    ReadState(#[source] BackendError),

    #[error("failed to resize fleet to {target}: {source}")]
    Modify {
        target: u32,
        #[source]
        source: BackendError,
    },

    #[error("failed to terminate {count} instance(s): {source}")]
    Terminate {
        count: usize,
        #[source]
        source: BackendError,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
