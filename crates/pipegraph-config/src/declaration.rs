//! Declaration parsing from KDL text.
//!
//! A declaration document looks like:
//!
//! ```kdl
//! settings-root "NunitLoader"
//!
//! project "Root" {
//!     name "NUnit samples"
//!     param "env.CI" "true"
//!
//!     vcs-root "NunitLoader" {
//!         url "https://github.com/nunit/nunit-project-loader.git"
//!         branch "refs/heads/main"
//!         branch-spec "refs/heads/*"
//!         auth "password" username="" password=""
//!     }
//!
//!     template "TemplateNUnit" {
//!         vcs "@settings"
//!         steps {
//!             step "Restore_sln" kind="restore" {
//!                 name "Restore .sln"
//!                 projects "nunit-project-loader.sln"
//!             }
//!         }
//!         triggers {
//!             trigger "vcs" id="TRIGGER_1"
//!         }
//!         features {
//!             feature "perfmon" id="BUILD_EXT_1"
//!         }
//!     }
//!
//!     build-type "BuildFromTemplate" {
//!         template "TemplateNUnit"
//!     }
//! }
//!
//! patches {
//!     change build-type="BuildFromTemplate" {
//!         expect "name" "BuildFromTemplate"
//!         set "name" "Build from NUnit Template"
//!     }
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use pipegraph_core::model::{
    AuthMethod, BuildSettings, BuildType, Feature, FeatureKind, Project, Step, StepKind, Template,
    Trigger, TriggerKind, VcsRoot,
};
use pipegraph_core::patch::{CreatePatch, Definition, EntityRef, MutatePatch, Patch};
use pipegraph_core::{EntityKind, ProjectId, TemplateId, VcsRootId};

/// VCS reference that stands for the root the settings are loaded from.
pub const SETTINGS_ROOT_ALIAS: &str = "@settings";

/// Everything declared in one document.
#[derive(Debug, Default)]
pub struct Declarations {
    /// VCS root that `@settings` refers to.
    pub settings_root: Option<VcsRootId>,
    pub projects: Vec<DeclaredProject>,
    pub patches: Vec<Patch>,
}

/// A project together with the project it attaches to, if declared elsewhere.
#[derive(Debug)]
pub struct DeclaredProject {
    pub parent: Option<ProjectId>,
    pub project: Project,
}

/// Parse declarations from KDL text.
pub fn parse_declarations(kdl: &str) -> ConfigResult<Declarations> {
    let doc: KdlDocument = kdl.parse()?;

    let mut decls = Declarations::default();

    for node in doc.nodes() {
        match node.name().value() {
            "settings-root" => {
                let id = get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
                    field: "settings-root".to_string(),
                    message: "expected a VCS root id".to_string(),
                })?;
                decls.settings_root = Some(VcsRootId::new(id)?);
            }
            "project" => {
                let parent = get_string_prop(node, "parent")
                    .map(ProjectId::new)
                    .transpose()?;
                decls.projects.push(DeclaredProject {
                    parent,
                    project: parse_project(node)?,
                });
            }
            "patches" => {
                for child in child_nodes(node) {
                    decls.patches.push(parse_patch(child)?);
                }
            }
            other => return Err(unknown_node(other, "document")),
        }
    }

    Ok(decls)
}

fn parse_project(node: &KdlNode) -> ConfigResult<Project> {
    let id = required_id(node, EntityKind::Project)?;
    let mut project = Project::new(id)?;

    for child in child_nodes(node) {
        match child.name().value() {
            "name" => project.name = get_first_string_arg(child).unwrap_or_default(),
            "description" => project.description = get_first_string_arg(child),
            "param" => {
                let (key, value) = parse_param(child)?;
                project.params.declare(key, value)?;
            }
            "vcs-root" => project.vcs_roots.push(parse_vcs_root(child)?),
            "template" => project.templates.push(parse_template(child)?),
            "build-type" => project.build_types.push(parse_build_type(child)?),
            "project" => project.sub_projects.push(parse_project(child)?),
            other => return Err(unknown_node(other, &format!("project '{}'", project.id))),
        }
    }

    Ok(project)
}

fn parse_vcs_root(node: &KdlNode) -> ConfigResult<VcsRoot> {
    let id = required_id(node, EntityKind::VcsRoot)?;

    let mut name = None;
    let mut url = String::new();
    let mut branch = None;
    let mut branch_spec = None;
    let mut auth = AuthMethod::Anonymous;

    for child in child_nodes(node) {
        match child.name().value() {
            "name" => name = get_first_string_arg(child),
            "url" => url = get_first_string_arg(child).unwrap_or_default(),
            "branch" => branch = get_first_string_arg(child),
            "branch-spec" => branch_spec = get_first_string_arg(child),
            "auth" => auth = parse_auth(child, &id)?,
            other => return Err(unknown_node(other, &format!("VCS root '{id}'"))),
        }
    }

    let mut root = VcsRoot::new(id, url)?.with_auth(auth);
    if let Some(name) = name {
        root = root.with_name(name);
    }
    root.branch = branch;
    root.branch_spec = branch_spec;
    Ok(root)
}

fn parse_auth(node: &KdlNode, root_id: &str) -> ConfigResult<AuthMethod> {
    let method = get_first_string_arg(node).unwrap_or_default();
    match method.as_str() {
        "anonymous" | "" => Ok(AuthMethod::Anonymous),
        "password" => Ok(AuthMethod::Password {
            username: get_string_prop(node, "username").unwrap_or_default(),
            password: get_string_prop(node, "password").unwrap_or_default(),
        }),
        "ssh-key" => Ok(AuthMethod::SshKey {
            key: get_string_prop(node, "key").unwrap_or_default(),
        }),
        other => Err(ConfigError::MalformedEntity {
            kind: EntityKind::VcsRoot,
            id: root_id.to_string(),
            reason: format!("unknown auth method: {other}"),
        }),
    }
}

fn parse_template(node: &KdlNode) -> ConfigResult<Template> {
    let id = required_id(node, EntityKind::Template)?;
    let mut template = Template::new(id)?;

    for child in child_nodes(node) {
        let key = child.name().value();
        if key == "name" {
            template.name = get_first_string_arg(child).unwrap_or_default();
        } else if !parse_settings_node(child, &mut template.settings)? {
            return Err(unknown_node(key, &format!("template '{}'", template.id)));
        }
    }

    Ok(template)
}

fn parse_build_type(node: &KdlNode) -> ConfigResult<BuildType> {
    let id = required_id(node, EntityKind::BuildType)?;
    let mut build_type = BuildType::new(id)?;

    for child in child_nodes(node) {
        match child.name().value() {
            "name" => build_type.name = get_first_string_arg(child).unwrap_or_default(),
            "description" => build_type.description = get_first_string_arg(child),
            "template" | "templates" => {
                for template in get_all_string_args(child) {
                    build_type.templates.push(TemplateId::new(template)?);
                }
            }
            "rootless" => build_type.rootless = get_first_bool_arg(child).unwrap_or(true),
            key => {
                if !parse_settings_node(child, &mut build_type.settings)? {
                    return Err(unknown_node(key, &format!("build type '{}'", build_type.id)));
                }
            }
        }
    }

    Ok(build_type)
}

/// Handle a node shared by templates and build types. Returns false if the
/// node is not a settings node.
fn parse_settings_node(node: &KdlNode, settings: &mut BuildSettings) -> ConfigResult<bool> {
    match node.name().value() {
        "param" => {
            let (key, value) = parse_param(node)?;
            settings.params.declare(key, value)?;
        }
        "vcs" => {
            for root in get_all_string_args(node) {
                settings.attach_vcs_root(VcsRootId::new(root)?);
            }
        }
        "steps" => {
            for child in child_nodes(node) {
                match child.name().value() {
                    "step" => settings.add_step(parse_step(child)?)?,
                    other => return Err(unknown_node(other, "steps")),
                }
            }
        }
        "triggers" => {
            for child in child_nodes(node) {
                match child.name().value() {
                    "trigger" => settings.add_trigger(parse_trigger(child)?)?,
                    other => return Err(unknown_node(other, "triggers")),
                }
            }
        }
        "features" => {
            for child in child_nodes(node) {
                match child.name().value() {
                    "feature" => settings.add_feature(parse_feature(child)?)?,
                    other => return Err(unknown_node(other, "features")),
                }
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let id = required_id(node, EntityKind::Step)?;
    let kind = get_string_prop(node, "kind").ok_or_else(|| ConfigError::MalformedEntity {
        kind: EntityKind::Step,
        id: id.clone(),
        reason: "missing kind".to_string(),
    })?;

    let mut step = Step::new(id, StepKind::from(kind))?;

    for child in child_nodes(node) {
        match child.name().value() {
            "name" => step.name = get_first_string_arg(child),
            "enabled" => step.enabled = get_first_bool_arg(child).unwrap_or(true),
            "param" => {
                let (key, value) = parse_param(child)?;
                step.config.insert(key, value);
            }
            key => {
                let value = get_first_value_arg(child).unwrap_or_default();
                step.config.insert(key.to_string(), value);
            }
        }
    }

    Ok(step)
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let kind = get_first_string_arg(node).ok_or_else(|| ConfigError::MalformedEntity {
        kind: EntityKind::Trigger,
        id: get_string_prop(node, "id").unwrap_or_default(),
        reason: "missing kind".to_string(),
    })?;

    let mut trigger = Trigger::new(TriggerKind::from(kind));
    trigger.id = get_string_prop(node, "id");
    trigger.config = parse_config_children(node);
    Ok(trigger)
}

fn parse_feature(node: &KdlNode) -> ConfigResult<Feature> {
    let kind = get_first_string_arg(node).ok_or_else(|| ConfigError::MalformedEntity {
        kind: EntityKind::Feature,
        id: get_string_prop(node, "id").unwrap_or_default(),
        reason: "missing kind".to_string(),
    })?;

    let mut feature = Feature::new(FeatureKind::from(kind));
    feature.id = get_string_prop(node, "id");
    feature.config = parse_config_children(node);
    Ok(feature)
}

fn parse_param(node: &KdlNode) -> ConfigResult<(String, String)> {
    let args = get_all_value_args(node);
    match args.as_slice() {
        [key, value] => Ok((key.clone(), value.clone())),
        [key] => Ok((key.clone(), String::new())),
        _ => Err(ConfigError::InvalidValue {
            field: "param".to_string(),
            message: "expected `param \"name\" \"value\"`".to_string(),
        }),
    }
}

fn parse_config_children(node: &KdlNode) -> std::collections::BTreeMap<String, String> {
    child_nodes(node)
        .map(|child| {
            (
                child.name().value().to_string(),
                get_first_value_arg(child).unwrap_or_default(),
            )
        })
        .collect()
}

fn parse_patch(node: &KdlNode) -> ConfigResult<Patch> {
    match node.name().value() {
        "create" => {
            let parent = get_string_prop(node, "project").ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: "create".to_string(),
                    message: "missing project=\"<id>\"".to_string(),
                }
            })?;
            let mut definitions = child_nodes(node);
            let (Some(definition), None) = (definitions.next(), definitions.next()) else {
                return Err(ConfigError::InvalidValue {
                    field: "create".to_string(),
                    message: "expected exactly one definition".to_string(),
                });
            };
            Ok(Patch::Create(CreatePatch {
                parent: ProjectId::new(parent)?,
                definition: parse_definition(definition)?,
            }))
        }
        "change" => {
            let target = parse_patch_target(node)?;
            let mut patch = MutatePatch::new(target);
            for child in child_nodes(node) {
                let args = get_all_value_args(child);
                let [field, value] = args.as_slice() else {
                    return Err(ConfigError::InvalidValue {
                        field: child.name().value().to_string(),
                        message: "expected a field and a value".to_string(),
                    });
                };
                patch = match child.name().value() {
                    "expect" => patch.expect(field, value),
                    "set" => patch.set(field, value),
                    other => return Err(unknown_node(other, "change")),
                };
            }
            Ok(Patch::Mutate(patch))
        }
        other => Err(unknown_node(other, "patches")),
    }
}

fn parse_definition(node: &KdlNode) -> ConfigResult<Definition> {
    match node.name().value() {
        "project" => Ok(Definition::Project(parse_project(node)?)),
        "build-type" => Ok(Definition::BuildType(parse_build_type(node)?)),
        "template" => Ok(Definition::Template(parse_template(node)?)),
        "vcs-root" => Ok(Definition::VcsRoot(parse_vcs_root(node)?)),
        other => Err(unknown_node(other, "create")),
    }
}

fn parse_patch_target(node: &KdlNode) -> ConfigResult<EntityRef> {
    const TARGETS: &[(&str, EntityKind)] = &[
        ("project", EntityKind::Project),
        ("build-type", EntityKind::BuildType),
        ("template", EntityKind::Template),
        ("vcs-root", EntityKind::VcsRoot),
    ];

    TARGETS
        .iter()
        .find_map(|(prop, kind)| get_string_prop(node, prop).map(|id| EntityRef::new(*kind, id)))
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "change".to_string(),
            message: "expected one of project=, build-type=, template=, vcs-root=".to_string(),
        })
}

fn required_id(node: &KdlNode, kind: EntityKind) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MalformedEntity {
        kind,
        id: String::new(),
        reason: format!("`{}` needs an id", node.name().value()),
    })
}

fn unknown_node(name: &str, context: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: context.to_string(),
        message: format!("unknown node `{name}`"),
    }
}

// Helper functions for extracting values from KDL nodes

fn child_nodes(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or_default()
        .iter()
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

/// First argument of any scalar type, rendered as a string.
fn get_first_value_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| value_to_string(e.value()))
}

fn get_all_value_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| value_to_string(e.value()))
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn value_to_string(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        Some(s.to_string())
    } else if let Some(b) = value.as_bool() {
        Some(b.to_string())
    } else if let Some(i) = value.as_integer() {
        Some(i.to_string())
    } else if let Some(f) = value.as_float() {
        Some(f.to_string())
    } else {
        value.is_null().then(String::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_with_template() {
        let kdl = r#"
            project "Root" {
                name "NUnit samples"
                param "env.CI" "true"

                template "TemplateNUnit" {
                    name "Template_NUnit"
                    vcs "@settings"
                    steps {
                        step "Restore_sln" kind="restore" {
                            name "Restore .sln"
                            projects "nunit-project-loader.sln"
                        }
                        step "NUnit_1st_dll" kind="test-run" {
                            include-tests "bin/Debug/net20/test-*.dll"
                            use-project-file #true
                        }
                    }
                    triggers {
                        trigger "vcs" id="TRIGGER_1"
                    }
                    features {
                        feature "perfmon" id="BUILD_EXT_1"
                    }
                }

                build-type "BuildFromTemplate" {
                    name "Build from NUnit Template"
                    template "TemplateNUnit"
                }
            }
        "#;

        let decls = parse_declarations(kdl).unwrap();
        assert_eq!(decls.projects.len(), 1);

        let project = &decls.projects[0].project;
        assert_eq!(project.name, "NUnit samples");
        assert_eq!(project.params.get("env.CI"), Some("true"));

        let template = &project.templates[0];
        assert_eq!(template.name, "Template_NUnit");
        assert_eq!(template.settings.vcs_roots[0].as_str(), SETTINGS_ROOT_ALIAS);
        assert_eq!(template.settings.steps.len(), 2);
        assert_eq!(template.settings.steps[0].kind, StepKind::Restore);
        assert_eq!(
            template.settings.steps[0].config.get("projects").map(String::as_str),
            Some("nunit-project-loader.sln")
        );
        assert_eq!(
            template.settings.steps[1].config.get("use-project-file").map(String::as_str),
            Some("true")
        );
        assert_eq!(template.settings.triggers[0].id.as_deref(), Some("TRIGGER_1"));
        assert_eq!(template.settings.features[0].kind, FeatureKind::Perfmon);

        let build_type = &project.build_types[0];
        assert_eq!(build_type.templates[0].as_str(), "TemplateNUnit");
        assert!(build_type.settings.steps.is_empty());
    }

    #[test]
    fn test_parse_vcs_root() {
        let kdl = r#"
            settings-root "NunitLoader"
            project "Root" {
                vcs-root "NunitLoader" {
                    name "nunit-project-loader#refs/heads/main"
                    url "https://github.com/nunit/nunit-project-loader.git"
                    branch "refs/heads/main"
                    branch-spec "refs/heads/*"
                    auth "password" username="" password="credentialsJSON:7dfcbd69"
                }
            }
        "#;

        let decls = parse_declarations(kdl).unwrap();
        assert_eq!(decls.settings_root.unwrap().as_str(), "NunitLoader");

        let root = &decls.projects[0].project.vcs_roots[0];
        assert_eq!(root.branch.as_deref(), Some("refs/heads/main"));
        assert_eq!(root.branch_spec.as_deref(), Some("refs/heads/*"));
        assert_eq!(
            root.auth,
            AuthMethod::Password {
                username: String::new(),
                password: "credentialsJSON:7dfcbd69".to_string(),
            }
        );
    }

    #[test]
    fn test_vcs_root_without_url() {
        let kdl = r#"
            project "Root" {
                vcs-root "Broken" {
                    branch "main"
                }
            }
        "#;

        let result = parse_declarations(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::MalformedEntity {
                kind: EntityKind::VcsRoot,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_step_id() {
        let kdl = r#"
            project "Root" {
                build-type "Build" {
                    steps {
                        step "dotnet" kind="build"
                        step "dotnet" kind="build"
                    }
                }
            }
        "#;

        let result = parse_declarations(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::MalformedEntity {
                kind: EntityKind::Step,
                ..
            }
        ));
    }

    #[test]
    fn test_step_without_kind() {
        let kdl = r#"
            project "Root" {
                build-type "Build" {
                    steps {
                        step "dotnet"
                    }
                }
            }
        "#;

        assert!(parse_declarations(kdl).is_err());
    }

    #[test]
    fn test_unknown_step_kind_is_kept() {
        let kdl = r#"
            project "Root" {
                build-type "Build" {
                    steps {
                        step "jetbrains_powershell" kind="powershell" {
                            script-path "build.ps1"
                        }
                    }
                }
            }
        "#;

        let decls = parse_declarations(kdl).unwrap();
        let step = &decls.projects[0].project.build_types[0].settings.steps[0];
        assert_eq!(step.kind, StepKind::Unsupported("powershell".to_string()));
    }

    #[test]
    fn test_parse_patches() {
        let kdl = r#"
            patches {
                create project="DotNetTestsSamples" {
                    build-type "DotNetTestsSamples_Build" {
                        name "Build"
                        rootless
                    }
                }
                change build-type="TwoNUnitSteps2dlls" {
                    expect "name" "2 NUnit steps: 2 dlls"
                    set "name" "✔️ 2 NUnit steps: 2 dlls"
                }
            }
        "#;

        let decls = parse_declarations(kdl).unwrap();
        assert_eq!(decls.patches.len(), 2);

        match &decls.patches[0] {
            Patch::Create(create) => {
                assert_eq!(create.parent.as_str(), "DotNetTestsSamples");
                match &create.definition {
                    Definition::BuildType(b) => assert!(b.rootless),
                    other => panic!("unexpected definition: {other:?}"),
                }
            }
            other => panic!("unexpected patch: {other:?}"),
        }

        match &decls.patches[1] {
            Patch::Mutate(change) => {
                assert_eq!(change.target.kind, EntityKind::BuildType);
                assert_eq!(change.assertions[0].expected, "2 NUnit steps: 2 dlls");
                assert_eq!(change.mutations[0].value, "✔️ 2 NUnit steps: 2 dlls");
            }
            other => panic!("unexpected patch: {other:?}"),
        }
    }

    #[test]
    fn test_sub_project_with_parent() {
        let kdl = r#"
            project "DotNetTestsSamples" parent="Root" {
                name "DotNetTestsSamples"
            }
        "#;

        let decls = parse_declarations(kdl).unwrap();
        assert_eq!(
            decls.projects[0].parent.as_ref().map(|p| p.as_str()),
            Some("Root")
        );
    }

    #[test]
    fn test_unknown_node_rejected() {
        let kdl = r#"
            project "Root" {
                pipeline "oops"
            }
        "#;

        assert!(matches!(
            parse_declarations(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
