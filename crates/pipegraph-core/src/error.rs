//! Error types for pipegraph.

use thiserror::Error;

use crate::model::EntityKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed {kind} '{id}': {reason}")]
    MalformedEntity {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn malformed(
        kind: EntityKind,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::MalformedEntity {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
