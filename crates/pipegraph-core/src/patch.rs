//! Patch records: assertion-guarded edits applied on top of declarations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::ProjectId;
use crate::model::{BuildType, EntityKind, Project, Template, VcsRoot};

/// Points at one entity of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

/// An entity created by a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "definition", rename_all = "kebab-case")]
pub enum Definition {
    Project(Project),
    BuildType(BuildType),
    Template(Template),
    VcsRoot(VcsRoot),
}

impl Definition {
    pub fn target(&self) -> EntityRef {
        match self {
            Definition::Project(p) => EntityRef::new(EntityKind::Project, p.id.as_str()),
            Definition::BuildType(b) => EntityRef::new(EntityKind::BuildType, b.id.as_str()),
            Definition::Template(t) => EntityRef::new(EntityKind::Template, t.id.as_str()),
            Definition::VcsRoot(v) => EntityRef::new(EntityKind::VcsRoot, v.id.as_str()),
        }
    }
}

/// Adds a new entity under `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePatch {
    pub parent: ProjectId,
    pub definition: Definition,
}

/// `field` must currently equal `expected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAssertion {
    pub field: String,
    pub expected: String,
}

/// Sets `field` to `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMutation {
    pub field: String,
    pub value: String,
}

/// Changes an existing entity, provided every assertion holds first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutatePatch {
    pub target: EntityRef,
    #[serde(default)]
    pub assertions: Vec<FieldAssertion>,
    #[serde(default)]
    pub mutations: Vec<FieldMutation>,
}

impl MutatePatch {
    pub fn new(target: EntityRef) -> Self {
        Self {
            target,
            assertions: Vec::new(),
            mutations: Vec::new(),
        }
    }

    pub fn expect(mut self, field: impl Into<String>, expected: impl Into<String>) -> Self {
        self.assertions.push(FieldAssertion {
            field: field.into(),
            expected: expected.into(),
        });
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.mutations.push(FieldMutation {
            field: field.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Patch {
    Create(CreatePatch),
    Mutate(MutatePatch),
}

impl Patch {
    /// The entity this patch creates or changes.
    pub fn target(&self) -> EntityRef {
        match self {
            Patch::Create(create) => create.definition.target(),
            Patch::Mutate(mutate) => mutate.target.clone(),
        }
    }
}
