//! Entity and invocation identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::EntityKind;
use crate::{Error, Result};

/// Declares a string identifier for one entity kind.
///
/// Ids are opaque, case-sensitive and never empty. Deserialization goes
/// through the same check as [`new`](ProjectId::new).
macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident => $kind:expr) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[serde(try_from = "String", into = "String")]
        #[display("{_0}")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(Error::malformed($kind, id, "id must not be empty"));
                }
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(id: String) -> Result<Self> {
                Self::new(id)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }
    };
}

entity_id!(
    /// Identifies a project in the project tree.
    ProjectId => EntityKind::Project
);
entity_id!(
    /// Identifies a build configuration.
    BuildTypeId => EntityKind::BuildType
);
entity_id!(
    /// Identifies a build configuration template.
    TemplateId => EntityKind::Template
);
entity_id!(
    /// Identifies a VCS root.
    VcsRootId => EntityKind::VcsRoot
);
entity_id!(
    /// Identifies a step within its owning build type or template.
    StepId => EntityKind::Step
);

/// A unique identifier for one dispatched step invocation.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for InvocationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
