// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for the tree, its sessions, and its backends.

use thiserror::Error;

/// Root error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Insert of a point whose coordinates are not within the root bound.
    #[error("point {point:?} is outside the tree's bound")]
    OutOfBounds {
        /// The offending point, for diagnostics.
        point: Vec<f64>,
    },

    /// A point or bound's dimensionality disagrees with the tree's `d`.
    #[error("dimensionality mismatch: tree has {expected} dims, got {actual}")]
    DimensionMismatch {
        /// The tree's dimensionality.
        expected: usize,
        /// The dimensionality actually supplied.
        actual: usize,
    },

    /// A wrapped storage error (I/O, SQL error, constraint violation). The
    /// core never retries; it surfaces the failure to the caller.
    #[error("storage backend failure: {0}")]
    BackendFailure(String),

    /// The backend reported a node/row state that breaks a stated tree
    /// invariant (e.g. `distribute_points` found the node already
    /// internal). Fatal; signals corruption.
    #[error("tree invariant violated: {0}")]
    InvariantViolation(String),

    /// Operation aborted via a cancellation signal. The session becomes
    /// rollback-only.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation attempted after `finish` or after scope exit.
    #[error("session already closed")]
    SessionClosed,
}

impl From<rusqlite::Error> for TreeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::BackendFailure(err.to_string())
    }
}

impl From<r2d2::Error> for TreeError {
    fn from(err: r2d2::Error) -> Self {
        Self::BackendFailure(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TreeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::BackendFailure(err.to_string())
    }
}

impl TreeError {
    /// `true` for failures where retrying the same operation might
    /// succeed (backend hiccups), `false` for caller errors and
    /// corruption.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendFailure(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;
