//! Error types for the belief and planning engine.

use thiserror::Error;

/// Errors that can occur while constructing, loading, or stepping agents.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
///
/// Numerical degeneracy while scoring data (a judgement with zero posterior
/// mass) is not reported here: it surfaces as a `-inf`/NaN log-probability so
/// that fitting code can decide whether to exclude the trial.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Supplied data disagrees with the trial shape `(N, K)` or the hypothesis space.
    #[error("shape error: {0}")]
    Shape(String),

    /// Invalid configuration or argument (e.g. non-positive noise, empty link set).
    #[error("validation error: {0}")]
    Validation(String),

    /// Flat action index or intervened variable outside the discretized action grid.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Non-finite values where finite ones are required.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Internal invariant violation (programmer error, not user error).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn shape(context: &str, expected: impl std::fmt::Display, got: impl std::fmt::Display) -> Self {
        CoreError::Shape(format!("{}: expected {}, got {}", context, expected, got))
    }
}
