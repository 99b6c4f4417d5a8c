//! Error types for the policy distillation engine

use thiserror::Error;

/// Errors that can occur while distilling, serving, or persisting rules
#[derive(Error, Debug)]
pub enum DistillError {
    /// The injected policy oracle failed while being sampled
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// No samples were available to grow a tree from
    #[error("Empty training set")]
    EmptyTrainingSet,

    /// Configuration rejected before any work started
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure surfaced by a persistence collaborator
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Another distillation cycle is already running
    #[error("Distillation already in progress")]
    DistillationInProgress,

    /// A state vector did not match the run's dimensionality
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for distillation operations
pub type Result<T> = std::result::Result<T, DistillError>;
