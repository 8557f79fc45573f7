//! Configuration loading and resolution errors.

use pipegraph_core::EntityKind;
use thiserror::Error;

use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("malformed {kind} '{id}': {reason}")]
    MalformedEntity {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    #[error("build type '{build_type}' uses unknown template '{template}'")]
    UnknownTemplate {
        build_type: String,
        template: String,
    },

    #[error("{owner} refers to missing {kind} '{target}'")]
    DanglingReference {
        owner: String,
        kind: EntityKind,
        target: String,
    },

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: EntityKind, id: String },

    #[error("cyclic parameter reference: {chain}")]
    CyclicParameter { chain: String },

    #[error("patch on {target}: expected {field} to be '{expected}', found '{actual}'")]
    AssertionMismatch {
        target: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("{target} has no patchable field '{field}'")]
    UnsupportedField { target: String, field: String },

    #[error("validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<pipegraph_core::Error> for ConfigError {
    fn from(err: pipegraph_core::Error) -> Self {
        match err {
            pipegraph_core::Error::MalformedEntity { kind, id, reason } => {
                ConfigError::MalformedEntity { kind, id, reason }
            }
            pipegraph_core::Error::Io(e) => ConfigError::Io(e),
            other => ConfigError::InvalidValue {
                field: "entity".to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
