//! Declared configuration entities: projects, build types, templates, VCS
//! roots, steps, triggers, features and parameters.
//!
//! Entities are built once from declarations and never shared by value:
//! build types and templates refer to VCS roots and templates by id. A
//! [`Project`] owns everything declared inside it, including sub-projects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::id::{BuildTypeId, ProjectId, StepId, TemplateId, VcsRootId};
use crate::{Error, Result};

/// The kinds of entity that carry an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Project,
    BuildType,
    Template,
    VcsRoot,
    Step,
    Trigger,
    Feature,
    Parameter,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Project => "project",
            EntityKind::BuildType => "build type",
            EntityKind::Template => "template",
            EntityKind::VcsRoot => "VCS root",
            EntityKind::Step => "step",
            EntityKind::Trigger => "trigger",
            EntityKind::Feature => "feature",
            EntityKind::Parameter => "parameter",
        };
        f.write_str(name)
    }
}

/// A set of `key = value` parameters belonging to one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter. Declaring the same key twice in one scope is an error.
    pub fn declare(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::malformed(
                EntityKind::Parameter,
                key,
                "parameter name must not be empty",
            ));
        }
        if self.0.contains_key(&key) {
            return Err(Error::malformed(
                EntityKind::Parameter,
                key,
                "declared twice in the same scope",
            ));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Set a parameter, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Layer `other` over this scope; keys in `other` win.
    pub fn overlay(&mut self, other: &Parameters) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Parameters {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Declares a kind enum with a fixed set of supported values. Values outside
/// the set are kept as `Unsupported` so validation can report them.
macro_rules! settings_kind {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Unsupported(String),
        }

        impl $name {
            /// Names of all supported kinds.
            pub const SUPPORTED: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Unsupported(other) => other.as_str(),
                }
            }

            pub fn is_supported(&self) -> bool {
                !matches!(self, $name::Unsupported(_))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $($text => $name::$variant,)+
                    other => $name::Unsupported(other.to_string()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name::from(s.as_str())
            }
        }

        impl From<$name> for String {
            fn from(kind: $name) -> Self {
                kind.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

settings_kind!(
    /// Executor type a step is dispatched to.
    StepKind {
        Restore => "restore",
        Build => "build",
        TestRun => "test-run",
        ShellScript => "shell-script",
        GenericProcess => "generic-process",
    }
);

settings_kind!(
    /// External event that starts a build.
    TriggerKind {
        Vcs => "vcs",
        Schedule => "schedule",
    }
);

settings_kind!(
    /// Cross-cutting augmentation attached to a build.
    FeatureKind {
        Perfmon => "perfmon",
        CommitStatus => "commit-status",
        XmlReport => "xml-report",
    }
);

/// A single build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: StepKind,
    pub enabled: bool,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Result<Self> {
        Ok(Self {
            id: StepId::new(id)?,
            name: None,
            kind,
            enabled: true,
            config: BTreeMap::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Merge key for triggers and features: kind plus optional id.
pub type SettingKey = (String, Option<String>);

/// Starts a build on an external event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: TriggerKind,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Trigger {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            id: None,
            kind,
            config: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> SettingKey {
        (self.kind.as_str().to_string(), self.id.clone())
    }
}

/// Build feature, e.g. performance monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: FeatureKind,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Feature {
    pub fn new(kind: FeatureKind) -> Self {
        Self {
            id: None,
            kind,
            config: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> SettingKey {
        (self.kind.as_str().to_string(), self.id.clone())
    }
}

/// How the VCS root authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthMethod {
    #[default]
    Anonymous,
    Password { username: String, password: String },
    SshKey { key: String },
}

/// A source-control location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsRoot {
    pub id: VcsRootId,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_spec: Option<String>,
    #[serde(default)]
    pub auth: AuthMethod,
}

impl VcsRoot {
    /// Create a VCS root. The url is required; `scheme://` urls must parse.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let id = VcsRootId::new(id)?;
        let url = url.into();
        Self::check_url(&id, &url)?;
        Ok(Self {
            name: id.to_string(),
            id,
            url,
            branch: None,
            branch_spec: None,
            auth: AuthMethod::Anonymous,
        })
    }

    /// Replace the url, applying the same checks as [`VcsRoot::new`].
    pub fn set_url(&mut self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        Self::check_url(&self.id, &url)?;
        self.url = url;
        Ok(())
    }

    fn check_url(id: &VcsRootId, url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(Error::malformed(
                EntityKind::VcsRoot,
                id.as_str(),
                "url must not be empty",
            ));
        }
        // Placeholders are substituted later, so only literal urls are parsed.
        if url.contains("://") && !url.contains('%') {
            url::Url::parse(url).map_err(|e| {
                Error::malformed(EntityKind::VcsRoot, id.as_str(), format!("invalid url: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_branch_spec(mut self, spec: impl Into<String>) -> Self {
        self.branch_spec = Some(spec.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }
}

/// Steps, triggers, features, VCS attachments and parameters shared by
/// templates and build types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub vcs_roots: Vec<VcsRootId>,
}

impl BuildSettings {
    pub fn add_step(&mut self, step: Step) -> Result<()> {
        if self.step(&step.id).is_some() {
            return Err(Error::malformed(
                EntityKind::Step,
                step.id.as_str(),
                "step id declared twice",
            ));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn add_trigger(&mut self, trigger: Trigger) -> Result<()> {
        let key = trigger.key();
        if self.triggers.iter().any(|t| t.key() == key && key.1.is_some()) {
            return Err(Error::malformed(
                EntityKind::Trigger,
                key.1.unwrap_or_default(),
                "trigger id declared twice",
            ));
        }
        self.triggers.push(trigger);
        Ok(())
    }

    pub fn add_feature(&mut self, feature: Feature) -> Result<()> {
        let key = feature.key();
        if self.features.iter().any(|f| f.key() == key && key.1.is_some()) {
            return Err(Error::malformed(
                EntityKind::Feature,
                key.1.unwrap_or_default(),
                "feature id declared twice",
            ));
        }
        self.features.push(feature);
        Ok(())
    }

    /// Attach a VCS root by id. Attaching the same root twice is a no-op.
    pub fn attach_vcs_root(&mut self, id: VcsRootId) {
        if !self.vcs_roots.contains(&id) {
            self.vcs_roots.push(id);
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| &s.id == id)
    }
}

/// A reusable base for build types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    #[serde(flatten)]
    pub settings: BuildSettings,
}

impl Template {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = TemplateId::new(id)?;
        Ok(Self {
            name: id.to_string(),
            id,
            settings: BuildSettings::default(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// An executable build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildType {
    pub id: BuildTypeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Templates in layering order; later templates override earlier ones.
    #[serde(default)]
    pub templates: Vec<TemplateId>,
    #[serde(flatten)]
    pub settings: BuildSettings,
    /// Explicitly allowed to run without any VCS root.
    #[serde(default)]
    pub rootless: bool,
}

impl BuildType {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = BuildTypeId::new(id)?;
        Ok(Self {
            name: id.to_string(),
            id,
            description: None,
            templates: Vec::new(),
            settings: BuildSettings::default(),
            rootless: false,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_template(mut self, template: TemplateId) -> Self {
        self.templates.push(template);
        self
    }
}

/// A node of the project tree. Owns its VCS roots, templates, build types
/// and sub-projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub vcs_roots: Vec<VcsRoot>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub build_types: Vec<BuildType>,
    #[serde(default)]
    pub sub_projects: Vec<Project>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = ProjectId::new(id)?;
        Ok(Self {
            name: id.to_string(),
            id,
            description: None,
            params: Parameters::new(),
            vcs_roots: Vec::new(),
            templates: Vec::new(),
            build_types: Vec::new(),
            sub_projects: Vec::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Visit this project and every descendant, depth first, together with
    /// the chain of ancestors (nearest last).
    pub fn walk<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a Project, &[&'a Project]),
    {
        let mut ancestors = Vec::new();
        self.walk_inner(&mut ancestors, f);
    }

    fn walk_inner<'a, F>(&'a self, ancestors: &mut Vec<&'a Project>, f: &mut F)
    where
        F: FnMut(&'a Project, &[&'a Project]),
    {
        f(self, ancestors);
        ancestors.push(self);
        for sub in &self.sub_projects {
            sub.walk_inner(ancestors, f);
        }
        ancestors.pop();
    }

    pub fn find_project(&self, id: &ProjectId) -> Option<&Project> {
        if &self.id == id {
            return Some(self);
        }
        self.sub_projects.iter().find_map(|p| p.find_project(id))
    }

    pub fn find_project_mut(&mut self, id: &ProjectId) -> Option<&mut Project> {
        if &self.id == id {
            return Some(self);
        }
        self.sub_projects
            .iter_mut()
            .find_map(|p| p.find_project_mut(id))
    }

    pub fn find_build_type_mut(&mut self, id: &BuildTypeId) -> Option<&mut BuildType> {
        if let Some(pos) = self.build_types.iter().position(|b| &b.id == id) {
            return self.build_types.get_mut(pos);
        }
        self.sub_projects
            .iter_mut()
            .find_map(|p| p.find_build_type_mut(id))
    }

    pub fn find_template_mut(&mut self, id: &TemplateId) -> Option<&mut Template> {
        if let Some(pos) = self.templates.iter().position(|t| &t.id == id) {
            return self.templates.get_mut(pos);
        }
        self.sub_projects
            .iter_mut()
            .find_map(|p| p.find_template_mut(id))
    }

    pub fn find_vcs_root_mut(&mut self, id: &VcsRootId) -> Option<&mut VcsRoot> {
        if let Some(pos) = self.vcs_roots.iter().position(|v| &v.id == id) {
            return self.vcs_roots.get_mut(pos);
        }
        self.sub_projects
            .iter_mut()
            .find_map(|p| p.find_vcs_root_mut(id))
    }

    /// Whether an entity of `kind` with `id` exists anywhere in this tree.
    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        let mut found = false;
        self.walk(&mut |project, _| {
            found |= match kind {
                EntityKind::Project => project.id.as_str() == id,
                EntityKind::BuildType => project.build_types.iter().any(|b| b.id.as_str() == id),
                EntityKind::Template => project.templates.iter().any(|t| t.id.as_str() == id),
                EntityKind::VcsRoot => project.vcs_roots.iter().any(|v| v.id.as_str() == id),
                _ => false,
            };
        });
        found
    }

    /// Rewrite every VCS root reference in this tree.
    pub fn rewrite_vcs_references<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&VcsRootId) -> Result<VcsRootId>,
    {
        for template in &mut self.templates {
            rewrite_refs(&mut template.settings.vcs_roots, f)?;
        }
        for build_type in &mut self.build_types {
            rewrite_refs(&mut build_type.settings.vcs_roots, f)?;
        }
        for sub in &mut self.sub_projects {
            sub.rewrite_vcs_references(f)?;
        }
        Ok(())
    }
}

fn rewrite_refs<F>(refs: &mut [VcsRootId], f: &mut F) -> Result<()>
where
    F: FnMut(&VcsRootId) -> Result<VcsRootId>,
{
    for r in refs.iter_mut() {
        *r = f(r)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcs_root_requires_url() {
        let err = VcsRoot::new("Loader", "").unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedEntity {
                kind: EntityKind::VcsRoot,
                ..
            }
        ));
    }

    #[test]
    fn test_vcs_root_rejects_broken_url() {
        assert!(VcsRoot::new("Loader", "https://").is_err());
        assert!(VcsRoot::new("Loader", "git@github.com:nunit/loader.git").is_ok());
        assert!(VcsRoot::new("Loader", "%repo.url%").is_ok());
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let mut settings = BuildSettings::default();
        settings
            .add_step(Step::new("NUnit", StepKind::TestRun).unwrap())
            .unwrap();
        let err = settings
            .add_step(Step::new("NUnit", StepKind::Build).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedEntity { kind: EntityKind::Step, .. }));
    }

    #[test]
    fn test_triggers_without_id_may_repeat() {
        let mut settings = BuildSettings::default();
        settings.add_trigger(Trigger::new(TriggerKind::Vcs)).unwrap();
        settings.add_trigger(Trigger::new(TriggerKind::Vcs)).unwrap();
        settings
            .add_trigger(Trigger::new(TriggerKind::Vcs).with_id("TRIGGER_1"))
            .unwrap();
        assert!(
            settings
                .add_trigger(Trigger::new(TriggerKind::Vcs).with_id("TRIGGER_1"))
                .is_err()
        );
    }

    #[test]
    fn test_duplicate_parameter_in_scope() {
        let mut params = Parameters::new();
        params.declare("env.CI", "true").unwrap();
        assert!(params.declare("env.CI", "false").is_err());
        params.set("env.CI", "false");
        assert_eq!(params.get("env.CI"), Some("false"));
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let kind = StepKind::from("powershell");
        assert!(!kind.is_supported());
        assert_eq!(kind.to_string(), "powershell");
        assert_eq!(StepKind::from("test-run"), StepKind::TestRun);
    }

    #[test]
    fn test_walk_reports_ancestors() {
        let mut root = Project::new("Root").unwrap();
        let mut sub = Project::new("Sub").unwrap();
        sub.sub_projects.push(Project::new("Leaf").unwrap());
        root.sub_projects.push(sub);

        let mut seen = Vec::new();
        root.walk(&mut |project, ancestors| {
            seen.push((project.id.to_string(), ancestors.len()));
        });
        assert_eq!(
            seen,
            vec![
                ("Root".to_string(), 0),
                ("Sub".to_string(), 1),
                ("Leaf".to_string(), 2)
            ]
        );
        assert!(root.contains(EntityKind::Project, "Leaf"));
        assert!(!root.contains(EntityKind::BuildType, "Leaf"));
    }
}
