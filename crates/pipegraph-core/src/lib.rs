//! Core domain types and traits for pipegraph.
//!
//! This crate contains:
//! - Entity identifiers
//! - The declared configuration model (projects, build types, templates,
//!   VCS roots, steps, triggers, features, parameters)
//! - Patch records
//! - The resolved execution graph
//! - The executor boundary trait

pub mod error;
pub mod executor;
pub mod id;
pub mod model;
pub mod patch;
pub mod resolved;

pub use error::{Error, Result};
pub use id::{BuildTypeId, InvocationId, ProjectId, StepId, TemplateId, VcsRootId};
pub use model::EntityKind;
