//! Declarations, patches, template resolution and validation for pipegraph.
//!
//! This crate handles:
//! - Parsing KDL declarations and the system configuration
//! - Applying patches to the declared tree
//! - Merging templates into build types
//! - `%name%` parameter substitution
//! - Validating the resolved graph

pub mod declaration;
pub mod error;
pub mod loader;
pub mod parameters;
pub mod patch;
pub mod resolve;
pub mod system;
pub mod template;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{Loader, Registry};
pub use parameters::{ScopeChain, ScopeLevel};
pub use patch::PatchApplier;
pub use resolve::Resolver;
pub use system::SystemConfig;
pub use template::TemplateResolver;
pub use validate::{ValidatedProject, ValidationError, Validator};
