// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for command processing
//!
//! Errors are classified by kind inside the crate so they can be logged with
//! full detail, then collapsed into a single `UNKNOWN` failure at the
//! processor boundary.

use thiserror::Error;

use crate::upcasting::UpcastError;

/// Errors raised by an aggregate store or its backing collection
#[derive(Debug, Error)]
pub enum StoreError {
    /// A raw document is missing a structural field or carries a malformed one
    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    /// A loaded aggregate does not match what was asked for
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The upcasting chain could not bring a document to the current version
    #[error("Upcast error: {0}")]
    Upcast(#[from] UpcastError),

    /// A store precondition was violated by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backing storage technology failed
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Short, stable name of the error kind for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::StorageCorruption(_) => "storage_corruption",
            StoreError::ConsistencyViolation(_) => "consistency_violation",
            StoreError::Upcast(UpcastError::LoopLimitExceeded { .. }) => "upcast_loop",
            StoreError::Upcast(_) => "upcast",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::Serialization(_) => "serialization",
            StoreError::Backend(_) => "backend",
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors that terminate a single command's unit of work
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Load or store failed for a reason other than a lost race
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The handler refused to produce a next aggregate
    #[error("Handler error: {0:#}")]
    Handler(anyhow::Error),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// The configured retry cap was reached under contention
    #[error("Gave up after {attempts} attempts lost the compare-and-swap race")]
    MaxRetriesExceeded { attempts: u32 },
}

impl ProcessError {
    /// Short, stable name of the error kind for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::Store(e) => e.kind(),
            ProcessError::Handler(_) => "handler",
            ProcessError::Panicked(_) => "panic",
            ProcessError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
        }
    }
}

/// Synchronous submission failures, observed at the call site
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The bounded backlog is full
    #[error("Command rejected: backlog of {capacity} commands is full")]
    Rejected { capacity: usize },

    /// The processor no longer accepts commands
    #[error("Command rejected: processor is shut down")]
    ShutDown,
}

/// Invalid store, processor or server configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Configuration error: {0}")]
pub struct ConfigurationError(pub String);
