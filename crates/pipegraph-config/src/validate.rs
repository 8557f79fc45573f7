//! Consistency checks over a resolved project tree.
//!
//! Unlike the rest of resolution, validation does not stop at the first
//! problem: every error is collected so a single run reports all of them.

use std::collections::{HashMap, HashSet};

use pipegraph_core::model::{Feature, Step, Template, Trigger};
use pipegraph_core::resolved::{ResolvedBuildType, ResolvedProject};
use pipegraph_core::{BuildTypeId, EntityKind, VcsRootId};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ValidationError {
    #[error("{owner} refers to missing {kind} '{target}'")]
    DanglingReference {
        owner: String,
        kind: EntityKind,
        target: String,
    },

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: EntityKind, id: String },

    #[error("build type '{build_type}' has no VCS root and is not marked rootless")]
    MissingVcsRoot { build_type: String },

    #[error("{owner} uses unsupported {category} kind '{kind}'")]
    UnsupportedKind {
        owner: String,
        category: EntityKind,
        kind: String,
    },
}

/// A resolved tree that passed validation. Only this crate can make one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidatedProject(ResolvedProject);

impl ValidatedProject {
    pub fn project(&self) -> &ResolvedProject {
        &self.0
    }

    pub fn into_inner(self) -> ResolvedProject {
        self.0
    }

    pub fn find_build_type(&self, id: &BuildTypeId) -> Option<&ResolvedBuildType> {
        self.0.find_build_type(id)
    }

    pub fn build_types(&self) -> Vec<&ResolvedBuildType> {
        self.0.all_build_types()
    }
}

pub struct Validator;

impl Validator {
    /// Collect every problem in `root`.
    pub fn validate(root: &ResolvedProject) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        check_unique_ids(root, &mut errors);

        let mut known_roots = HashSet::new();
        root.walk(&mut |project| {
            known_roots.extend(project.vcs_roots.iter().map(|v| v.id.as_str()));
        });

        for build in root.all_build_types() {
            check_build_type(build, &known_roots, &mut errors);
        }
        root.walk(&mut |project| {
            for template in &project.templates {
                check_template(template, &known_roots, &mut errors);
            }
        });

        for error in &errors {
            warn!(%error, "Validation error");
        }
        errors
    }

    /// Validate `root`, failing with every collected error.
    pub fn check(root: ResolvedProject) -> ConfigResult<ValidatedProject> {
        let errors = Self::validate(&root);
        if errors.is_empty() {
            Ok(ValidatedProject(root))
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn check_unique_ids(root: &ResolvedProject, errors: &mut Vec<ValidationError>) {
    let mut ids: Vec<(EntityKind, &str)> = Vec::new();
    root.walk(&mut |project| {
        ids.push((EntityKind::Project, project.id.as_str()));
        ids.extend(project.vcs_roots.iter().map(|v| (EntityKind::VcsRoot, v.id.as_str())));
        ids.extend(project.templates.iter().map(|t| (EntityKind::Template, t.id.as_str())));
        ids.extend(project.build_types.iter().map(|b| (EntityKind::BuildType, b.id.as_str())));
    });
    report_duplicates(ids, errors);
}

fn report_duplicates(ids: Vec<(EntityKind, &str)>, errors: &mut Vec<ValidationError>) {
    let mut counts: HashMap<(EntityKind, &str), usize> = HashMap::new();
    for key in &ids {
        *counts.entry(*key).or_default() += 1;
    }

    let mut reported = HashSet::new();
    for key @ (kind, id) in ids {
        if counts[&key] > 1 && reported.insert(key) {
            errors.push(ValidationError::DuplicateId {
                kind,
                id: id.to_string(),
            });
        }
    }
}

fn check_build_type(
    build: &ResolvedBuildType,
    known_roots: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let owner = format!("build type '{}'", build.id);
    check_settings(
        &owner,
        SettingsView {
            vcs_roots: &build.vcs_roots,
            steps: &build.steps,
            triggers: &build.triggers,
            features: &build.features,
        },
        known_roots,
        errors,
    );

    if build.vcs_roots.is_empty() && !build.rootless {
        errors.push(ValidationError::MissingVcsRoot {
            build_type: build.id.to_string(),
        });
    }
}

/// Templates are checked on their own so a broken template is reported even
/// when no build type uses it.
fn check_template(
    template: &Template,
    known_roots: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let settings = &template.settings;
    check_settings(
        &format!("template '{}'", template.id),
        SettingsView {
            vcs_roots: &settings.vcs_roots,
            steps: &settings.steps,
            triggers: &settings.triggers,
            features: &settings.features,
        },
        known_roots,
        errors,
    );
}

struct SettingsView<'s> {
    vcs_roots: &'s [VcsRootId],
    steps: &'s [Step],
    triggers: &'s [Trigger],
    features: &'s [Feature],
}

fn check_settings(
    owner: &str,
    settings: SettingsView<'_>,
    known_roots: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    for root in settings.vcs_roots {
        if !known_roots.contains(root.as_str()) {
            errors.push(ValidationError::DanglingReference {
                owner: owner.to_string(),
                kind: EntityKind::VcsRoot,
                target: root.to_string(),
            });
        }
    }

    report_duplicates(
        settings
            .steps
            .iter()
            .map(|s| (EntityKind::Step, s.id.as_str()))
            .collect(),
        errors,
    );

    for step in settings.steps {
        if !step.kind.is_supported() {
            errors.push(ValidationError::UnsupportedKind {
                owner: format!("step '{}' of {owner}", step.id),
                category: EntityKind::Step,
                kind: step.kind.to_string(),
            });
        }
    }
    for trigger in settings.triggers {
        if !trigger.kind.is_supported() {
            errors.push(ValidationError::UnsupportedKind {
                owner: owner.to_string(),
                category: EntityKind::Trigger,
                kind: trigger.kind.to_string(),
            });
        }
    }
    for feature in settings.features {
        if !feature.kind.is_supported() {
            errors.push(ValidationError::UnsupportedKind {
                owner: owner.to_string(),
                category: EntityKind::Feature,
                kind: feature.kind.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipegraph_core::ProjectId;
    use pipegraph_core::model::{FeatureKind, Parameters, StepKind, TriggerKind, VcsRoot};

    fn build(id: &str, roots: &[&str]) -> ResolvedBuildType {
        ResolvedBuildType {
            id: BuildTypeId::new(id).unwrap(),
            name: id.to_string(),
            description: None,
            params: Parameters::new(),
            steps: vec![Step::new("dotnet", StepKind::Build).unwrap()],
            triggers: vec![Trigger::new(TriggerKind::Vcs)],
            features: vec![Feature::new(FeatureKind::Perfmon)],
            vcs_roots: roots.iter().map(|r| VcsRootId::new(*r).unwrap()).collect(),
            rootless: false,
        }
    }

    fn project(id: &str, builds: Vec<ResolvedBuildType>) -> ResolvedProject {
        ResolvedProject {
            id: ProjectId::new(id).unwrap(),
            name: id.to_string(),
            description: None,
            params: Parameters::new(),
            vcs_roots: vec![
                VcsRoot::new("NunitLoader", "https://github.com/nunit/nunit-project-loader.git")
                    .unwrap(),
            ],
            templates: Vec::new(),
            build_types: builds,
            sub_projects: Vec::new(),
        }
    }

    #[test]
    fn test_valid_project() {
        let root = project("Root", vec![build("Build", &["NunitLoader"])]);
        assert!(Validator::validate(&root).is_empty());
        assert!(Validator::check(root).is_ok());
    }

    #[test]
    fn test_single_dangling_reference() {
        let root = project(
            "Root",
            vec![
                build("Broken", &["ghost"]),
                build("Fine", &["NunitLoader"]),
            ],
        );

        let errors = Validator::validate(&root);
        assert_eq!(
            errors,
            vec![ValidationError::DanglingReference {
                owner: "build type 'Broken'".to_string(),
                kind: EntityKind::VcsRoot,
                target: "ghost".to_string(),
            }]
        );
    }

    #[test]
    fn test_collects_every_error() {
        let mut weird = build("Weird", &["ghost"]);
        weird.steps.push(Step::new("dotnet", StepKind::from("powershell")).unwrap());
        weird.triggers.push(Trigger::new(TriggerKind::from("retry")));

        let mut sub = project("Sub", vec![build("Rootless", &[])]);
        sub.vcs_roots.clear();
        let mut root = project("Root", vec![weird]);
        root.sub_projects.push(sub);

        let errors = Validator::validate(&root);
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::MissingVcsRoot {
            build_type: "Rootless".to_string()
        }));
        assert!(errors.contains(&ValidationError::DuplicateId {
            kind: EntityKind::Step,
            id: "dotnet".to_string()
        }));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::UnsupportedKind {
                category: EntityKind::Trigger,
                ..
            }
        )));

        match Validator::check(root).unwrap_err() {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 5),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rootless_build_type() {
        let mut build = build("Docs", &[]);
        build.rootless = true;
        let root = project("Root", vec![build]);
        assert!(Validator::validate(&root).is_empty());
    }

    #[test]
    fn test_duplicate_ids_reported_once() {
        let mut root = project(
            "Root",
            vec![build("Build", &["NunitLoader"]), build("Build", &["NunitLoader"])],
        );
        root.sub_projects.push(project("Sub", vec![build("Build", &["NunitLoader"])]));

        let errors = Validator::validate(&root);
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateId {
                    kind: EntityKind::VcsRoot,
                    id: "NunitLoader".to_string(),
                },
                ValidationError::DuplicateId {
                    kind: EntityKind::BuildType,
                    id: "Build".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_unused_template_is_checked() {
        let mut template = Template::new("Orphaned").unwrap();
        template.settings.attach_vcs_root(VcsRootId::new("ghost").unwrap());
        template
            .settings
            .add_step(Step::new("Script", StepKind::from("powershell")).unwrap())
            .unwrap();

        let mut root = project("Root", vec![build("Build", &["NunitLoader"])]);
        root.templates.push(template);

        let errors = Validator::validate(&root);
        assert_eq!(
            errors,
            vec![
                ValidationError::DanglingReference {
                    owner: "template 'Orphaned'".to_string(),
                    kind: EntityKind::VcsRoot,
                    target: "ghost".to_string(),
                },
                ValidationError::UnsupportedKind {
                    owner: "step 'Script' of template 'Orphaned'".to_string(),
                    category: EntityKind::Step,
                    kind: "powershell".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_template_reported() {
        let mut root = project("Root", vec![build("Build", &["NunitLoader"])]);
        root.templates.push(Template::new("Shared").unwrap());
        let mut sub = project("Sub", vec![]);
        sub.vcs_roots.clear();
        sub.templates.push(Template::new("Shared").unwrap());
        root.sub_projects.push(sub);

        assert_eq!(
            Validator::validate(&root),
            vec![ValidationError::DuplicateId {
                kind: EntityKind::Template,
                id: "Shared".to_string(),
            }]
        );
    }
}
