//! Error taxonomy for the issue sink.
//!
//! Every fallible operation in the workspace bubbles up a [`SinkError`].
//! The daemon translates these into HTTP status codes at a single
//! boundary; library code never maps to transport concerns itself.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Errors that can occur while admitting, mutating, or querying issues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    /// A required field is missing or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The request carried no valid API key.
    #[error("unauthorized")]
    Unauthenticated,

    /// The admission was blocked by a blacklist pattern.
    #[error("log entry blocked by blacklist pattern: {pattern}")]
    Blocked {
        /// The pattern that matched the message.
        pattern: String,
        /// Operator-supplied reason attached to the pattern, if any.
        reason: Option<String>,
    },

    /// The referenced issue or pattern does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The issue is not in a state from which the requested transition
    /// is allowed.
    #[error("log is not in {requested} state (current: {current})")]
    Precondition {
        /// The state the issue is currently in.
        current: String,
        /// The state (or state set) the operation requires.
        requested: String,
    },

    /// A unique-key violation, e.g. a duplicate blacklist pattern.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A singleton worker is already running.
    #[error("{0} is already running")]
    Busy(&'static str),

    /// The embedding or LLM feature is disabled or the provider is
    /// failing.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The persistent store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The external embedding/LLM provider failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SinkError {
    /// Shorthand for an invalid-input error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Shorthand for a not-found error naming the missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Builds the invalid-transition error from current and requested
    /// state names.
    pub fn precondition(current: impl Into<String>, requested: impl Into<String>) -> Self {
        Self::Precondition {
            current: current.into(),
            requested: requested.into(),
        }
    }

    /// Returns `true` when the error indicates a missing entity rather
    /// than a wrong-state entity. Callers use this to distinguish 404
    /// from 400 without matching on variants.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
