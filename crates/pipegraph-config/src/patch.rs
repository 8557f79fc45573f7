//! Applying patches to a declared project tree.
//!
//! Patches run in order on a copy of the tree, so later patches see what
//! earlier ones did. A change patch first checks every `expect` against the
//! current values and only then applies its `set`s. The `set`s go to a copy
//! that replaces the tree only when all of them succeed.
//!
//! Addressable fields:
//!
//! | field                      | project | build type | template | VCS root |
//! |----------------------------|---------|------------|----------|----------|
//! | `name`                     | x       | x          | x        | x        |
//! | `description`              | x       | x          |          |          |
//! | `params.<key>`             | x       | x          | x        |          |
//! | `rootless`                 |         | x          |          |          |
//! | `steps.<id>.name`          |         | x          | x        |          |
//! | `steps.<id>.enabled`       |         | x          | x        |          |
//! | `steps.<id>.config.<key>`  |         | x          | x        |          |
//! | `url`, `branch`, `branch-spec` |     |            |          | x        |

use pipegraph_core::model::{BuildSettings, BuildType, Parameters, Project, Step, Template, VcsRoot};
use pipegraph_core::patch::{CreatePatch, Definition, EntityRef, MutatePatch, Patch};
use pipegraph_core::{BuildTypeId, EntityKind, ProjectId, TemplateId, VcsRootId};
use tracing::{debug, info};

use crate::{ConfigError, ConfigResult};

/// Shown as the actual value of a field that is not set.
const UNSET: &str = "<unset>";

pub struct PatchApplier;

impl PatchApplier {
    /// Apply `patches` in order to a copy of `root`.
    pub fn apply(root: &Project, patches: &[Patch]) -> ConfigResult<Project> {
        let mut graph = root.clone();
        for patch in patches {
            Self::apply_one(&mut graph, patch)?;
        }
        Ok(graph)
    }

    /// Apply a single patch in place.
    pub fn apply_one(graph: &mut Project, patch: &Patch) -> ConfigResult<()> {
        match patch {
            Patch::Create(create) => apply_create(graph, create)?,
            Patch::Mutate(mutate) => apply_mutate(graph, mutate)?,
        }
        info!(target_entity = %patch.target(), "Applied patch");
        Ok(())
    }
}

fn apply_create(graph: &mut Project, create: &CreatePatch) -> ConfigResult<()> {
    for entity in defined_entities(&create.definition) {
        if graph.contains(entity.kind, &entity.id) {
            return Err(ConfigError::DuplicateId {
                kind: entity.kind,
                id: entity.id,
            });
        }
    }

    let target = create.definition.target();
    let parent = graph
        .find_project_mut(&create.parent)
        .ok_or_else(|| ConfigError::DanglingReference {
            owner: format!("patch creating {target}"),
            kind: EntityKind::Project,
            target: create.parent.to_string(),
        })?;

    match create.definition.clone() {
        Definition::Project(p) => parent.sub_projects.push(p),
        Definition::BuildType(b) => parent.build_types.push(b),
        Definition::Template(t) => parent.templates.push(t),
        Definition::VcsRoot(v) => parent.vcs_roots.push(v),
    }
    Ok(())
}

/// Every id-carrying entity a definition introduces, including nested ones.
fn defined_entities(definition: &Definition) -> Vec<EntityRef> {
    let Definition::Project(project) = definition else {
        return vec![definition.target()];
    };

    let mut out = Vec::new();
    project.walk(&mut |p, _| {
        out.push(EntityRef::new(EntityKind::Project, p.id.as_str()));
        out.extend(p.build_types.iter().map(|b| EntityRef::new(EntityKind::BuildType, b.id.as_str())));
        out.extend(p.templates.iter().map(|t| EntityRef::new(EntityKind::Template, t.id.as_str())));
        out.extend(p.vcs_roots.iter().map(|v| EntityRef::new(EntityKind::VcsRoot, v.id.as_str())));
    });
    out
}

fn apply_mutate(graph: &mut Project, patch: &MutatePatch) -> ConfigResult<()> {
    let target = &patch.target;

    let assertions = patch
        .assertions
        .iter()
        .map(|a| parse_field(target, &a.field).map(|f| (f, a)))
        .collect::<ConfigResult<Vec<_>>>()?;
    let mutations = patch
        .mutations
        .iter()
        .map(|m| parse_field(target, &m.field).map(|f| (f, m)))
        .collect::<ConfigResult<Vec<_>>>()?;

    let entity = Entity::find(graph, target)?;
    for (field, assertion) in &assertions {
        let actual = entity.get(target, field)?;
        if actual.as_deref() != Some(assertion.expected.as_str()) {
            return Err(ConfigError::AssertionMismatch {
                target: target.to_string(),
                field: assertion.field.clone(),
                expected: assertion.expected.clone(),
                actual: actual.unwrap_or_else(|| UNSET.to_string()),
            });
        }
    }

    let mut scratch = graph.clone();
    let mut entity = Entity::find(&mut scratch, target)?;
    for (field, mutation) in &mutations {
        debug!(target_entity = %target, field = %mutation.field, "Setting field");
        entity.set(target, field, &mutation.value)?;
    }

    *graph = scratch;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field<'f> {
    Name,
    Description,
    Rootless,
    Param(&'f str),
    StepName(&'f str),
    StepEnabled(&'f str),
    StepConfig(&'f str, &'f str),
    Url,
    Branch,
    BranchSpec,
}

fn parse_field<'f>(target: &EntityRef, field: &'f str) -> ConfigResult<Field<'f>> {
    let parsed = match field {
        "name" => Some(Field::Name),
        "description" => Some(Field::Description),
        "rootless" => Some(Field::Rootless),
        "url" => Some(Field::Url),
        "branch" => Some(Field::Branch),
        "branch-spec" => Some(Field::BranchSpec),
        _ => {
            if let Some(key) = field.strip_prefix("params.") {
                (!key.is_empty()).then_some(Field::Param(key))
            } else if let Some(rest) = field.strip_prefix("steps.") {
                match rest.split_once('.') {
                    Some((step, "name")) => Some(Field::StepName(step)),
                    Some((step, "enabled")) => Some(Field::StepEnabled(step)),
                    Some((step, rest)) => rest
                        .strip_prefix("config.")
                        .filter(|key| !key.is_empty())
                        .map(|key| Field::StepConfig(step, key)),
                    None => None,
                }
            } else {
                None
            }
        }
    };

    let supported = parsed.filter(|f| {
        matches!(
            (target.kind, f),
            (_, Field::Name)
                | (EntityKind::Project | EntityKind::BuildType, Field::Description)
                | (
                    EntityKind::Project | EntityKind::BuildType | EntityKind::Template,
                    Field::Param(_)
                )
                | (EntityKind::BuildType, Field::Rootless)
                | (
                    EntityKind::BuildType | EntityKind::Template,
                    Field::StepName(_) | Field::StepEnabled(_) | Field::StepConfig(..)
                )
                | (
                    EntityKind::VcsRoot,
                    Field::Url | Field::Branch | Field::BranchSpec
                )
        )
    });

    supported.ok_or_else(|| unsupported(target, field))
}

fn unsupported(target: &EntityRef, field: &str) -> ConfigError {
    ConfigError::UnsupportedField {
        target: target.to_string(),
        field: field.to_string(),
    }
}

/// Mutable view of the entity a patch addresses.
enum Entity<'g> {
    Project(&'g mut Project),
    BuildType(&'g mut BuildType),
    Template(&'g mut Template),
    VcsRoot(&'g mut VcsRoot),
}

impl<'g> Entity<'g> {
    fn find(graph: &'g mut Project, target: &EntityRef) -> ConfigResult<Self> {
        let id = target.id.clone();
        let found = match target.kind {
            EntityKind::Project => graph
                .find_project_mut(&ProjectId::new(id)?)
                .map(Entity::Project),
            EntityKind::BuildType => graph
                .find_build_type_mut(&BuildTypeId::new(id)?)
                .map(Entity::BuildType),
            EntityKind::Template => graph
                .find_template_mut(&TemplateId::new(id)?)
                .map(Entity::Template),
            EntityKind::VcsRoot => graph
                .find_vcs_root_mut(&VcsRootId::new(id)?)
                .map(Entity::VcsRoot),
            _ => None,
        };

        found.ok_or_else(|| ConfigError::DanglingReference {
            owner: "patch".to_string(),
            kind: target.kind,
            target: target.id.clone(),
        })
    }

    fn settings(&self) -> Option<&BuildSettings> {
        match self {
            Entity::BuildType(b) => Some(&b.settings),
            Entity::Template(t) => Some(&t.settings),
            _ => None,
        }
    }

    fn settings_mut(&mut self) -> Option<&mut BuildSettings> {
        match self {
            Entity::BuildType(b) => Some(&mut b.settings),
            Entity::Template(t) => Some(&mut t.settings),
            _ => None,
        }
    }

    fn params(&self) -> Option<&Parameters> {
        match self {
            Entity::Project(p) => Some(&p.params),
            _ => self.settings().map(|s| &s.params),
        }
    }

    fn params_mut(&mut self) -> Option<&mut Parameters> {
        match self {
            Entity::Project(p) => Some(&mut p.params),
            _ => self.settings_mut().map(|s| &mut s.params),
        }
    }

    fn step(&self, target: &EntityRef, id: &str) -> ConfigResult<&Step> {
        self.settings()
            .and_then(|s| s.steps.iter().find(|step| step.id.as_str() == id))
            .ok_or_else(|| missing_step(target, id))
    }

    fn step_mut(&mut self, target: &EntityRef, id: &str) -> ConfigResult<&mut Step> {
        self.settings_mut()
            .and_then(|s| s.steps.iter_mut().find(|step| step.id.as_str() == id))
            .ok_or_else(|| missing_step(target, id))
    }

    fn get(&self, target: &EntityRef, field: &Field<'_>) -> ConfigResult<Option<String>> {
        let value = match (self, field) {
            (Entity::Project(p), Field::Name) => Some(p.name.clone()),
            (Entity::BuildType(b), Field::Name) => Some(b.name.clone()),
            (Entity::Template(t), Field::Name) => Some(t.name.clone()),
            (Entity::VcsRoot(v), Field::Name) => Some(v.name.clone()),
            (Entity::Project(p), Field::Description) => p.description.clone(),
            (Entity::BuildType(b), Field::Description) => b.description.clone(),
            (Entity::BuildType(b), Field::Rootless) => Some(b.rootless.to_string()),
            (Entity::VcsRoot(v), Field::Url) => Some(v.url.clone()),
            (Entity::VcsRoot(v), Field::Branch) => v.branch.clone(),
            (Entity::VcsRoot(v), Field::BranchSpec) => v.branch_spec.clone(),
            (_, Field::Param(key)) => self
                .params()
                .and_then(|params| params.get(key))
                .map(str::to_string),
            (_, Field::StepName(step)) => self.step(target, step)?.name.clone(),
            (_, Field::StepEnabled(step)) => Some(self.step(target, step)?.enabled.to_string()),
            (_, Field::StepConfig(step, key)) => self.step(target, step)?.config.get(*key).cloned(),
            _ => return Err(unsupported(target, &format!("{field:?}"))),
        };
        Ok(value)
    }

    fn set(&mut self, target: &EntityRef, field: &Field<'_>, value: &str) -> ConfigResult<()> {
        match field {
            Field::Param(key) => {
                let params = self
                    .params_mut()
                    .ok_or_else(|| unsupported(target, &format!("params.{key}")))?;
                params.set(*key, value);
                return Ok(());
            }
            Field::StepName(step) => {
                self.step_mut(target, step)?.name = Some(value.to_string());
                return Ok(());
            }
            Field::StepEnabled(step) => {
                let enabled = parse_bool("enabled", value)?;
                self.step_mut(target, step)?.enabled = enabled;
                return Ok(());
            }
            Field::StepConfig(step, key) => {
                self.step_mut(target, step)?
                    .config
                    .insert(key.to_string(), value.to_string());
                return Ok(());
            }
            _ => {}
        }

        match (self, field) {
            (Entity::Project(p), Field::Name) => p.name = value.to_string(),
            (Entity::BuildType(b), Field::Name) => b.name = value.to_string(),
            (Entity::Template(t), Field::Name) => t.name = value.to_string(),
            (Entity::VcsRoot(v), Field::Name) => v.name = value.to_string(),
            (Entity::Project(p), Field::Description) => p.description = Some(value.to_string()),
            (Entity::BuildType(b), Field::Description) => b.description = Some(value.to_string()),
            (Entity::BuildType(b), Field::Rootless) => b.rootless = parse_bool("rootless", value)?,
            (Entity::VcsRoot(v), Field::Url) => v.set_url(value)?,
            (Entity::VcsRoot(v), Field::Branch) => v.branch = Some(value.to_string()),
            (Entity::VcsRoot(v), Field::BranchSpec) => v.branch_spec = Some(value.to_string()),
            _ => return Err(unsupported(target, &format!("{field:?}"))),
        }
        Ok(())
    }
}

fn missing_step(target: &EntityRef, id: &str) -> ConfigError {
    ConfigError::DanglingReference {
        owner: format!("patch on {target}"),
        kind: EntityKind::Step,
        target: id.to_string(),
    }
}

fn parse_bool(field: &str, value: &str) -> ConfigResult<bool> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected true or false, got '{value}'"),
    })
}
