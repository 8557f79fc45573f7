//! Loading, patching and resolving a settings directory split across files.

use std::path::Path;

use pipegraph_config::{ConfigError, Loader, Resolver, SystemConfig, ValidationError};
use pipegraph_core::BuildTypeId;
use tempfile::TempDir;

const ROOT: &str = r#"
settings-root "NunitProjectLoader"

project "Root" {
    name "NUnit Project Loader"
    param "configuration" "Debug"

    vcs-root "NunitProjectLoader" {
        url "https://github.com/nunit/nunit-project-loader.git"
        branch "refs/heads/%branch.name%"
        branch-spec "+:refs/heads/*"
    }

    template "TemplateNUnit" {
        vcs "@settings"
        steps {
            step "Restore_sln" kind="restore" {
                projects "nunit-project-loader.sln"
            }
            step "Build_sln" kind="build" {
                projects "nunit-project-loader.sln"
                args "-c %configuration%"
            }
            step "NUnit" kind="test-run" {
                include-tests "bin/%configuration%/net20/test-1.dll"
            }
        }
        triggers {
            trigger "vcs" id="TRIGGER_1"
        }
    }
}
"#;

const SAMPLES: &str = r#"
project "DotNetTestsSamples" parent="Root" {
    name "Samples"
    param "configuration" "Release"

    build-type "TwoNUnitSteps2dlls" {
        name "2 NUnit steps: 2 dlls"
        template "TemplateNUnit"
    }

    build-type "Empty" {
        name "No steps"
        vcs "@settings"
    }
}
"#;

const PATCHES: &str = r#"
patches {
    create project="DotNetTestsSamples" {
        build-type "DotNetTestsSamples_Build" {
            name "Build"
            rootless
        }
    }
    change build-type="TwoNUnitSteps2dlls" {
        expect "name" "2 NUnit steps: 2 dlls"
        set "name" "2 NUnit steps, renamed"
    }
}
"#;

fn write(dir: &Path, name: &str, contents: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

fn settings_dir(patches: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "settings.kdl", ROOT);
    write(dir.path(), "samples/project.kdl", SAMPLES);
    write(dir.path(), "samples/patches.kdl", patches);
    dir
}

fn system() -> SystemConfig {
    let mut system = SystemConfig::default();
    system.set_param("branch.name", "main");
    system
}

fn id(id: &str) -> BuildTypeId {
    BuildTypeId::new(id).unwrap()
}

#[test]
fn test_resolve_settings_dir() {
    let dir = settings_dir(PATCHES);
    let registry = Loader::load_dir(dir.path()).unwrap();
    let system = system();
    let resolved = Resolver::new(&registry, &system).resolve().unwrap();

    let ids: Vec<&str> = resolved
        .build_types()
        .iter()
        .map(|b| b.id.as_str())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&"TwoNUnitSteps2dlls"));
    assert!(ids.contains(&"Empty"));
    assert!(ids.contains(&"DotNetTestsSamples_Build"));

    let build = resolved.find_build_type(&id("TwoNUnitSteps2dlls")).unwrap();
    assert_eq!(build.name, "2 NUnit steps, renamed");
    let steps: Vec<&str> = build.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(steps, vec!["Restore_sln", "Build_sln", "NUnit"]);
    assert_eq!(
        build.steps[1].config.get("args").map(String::as_str),
        Some("-c Release")
    );
    assert_eq!(build.triggers.len(), 1);
    assert_eq!(build.vcs_roots[0].as_str(), "NunitProjectLoader");

    let empty = resolved.find_build_type(&id("Empty")).unwrap();
    assert!(empty.steps.is_empty());
    assert_eq!(empty.vcs_roots[0].as_str(), "NunitProjectLoader");

    let created = resolved
        .find_build_type(&id("DotNetTestsSamples_Build"))
        .unwrap();
    assert!(created.rootless);
    assert!(created.vcs_roots.is_empty());

    let root = &resolved.project().vcs_roots[0];
    assert_eq!(root.branch.as_deref(), Some("refs/heads/main"));
}

#[test]
fn test_failed_assertion_aborts() {
    let patches = r#"
    patches {
        change build-type="TwoNUnitSteps2dlls" {
            expect "name" "something else"
            set "name" "never applied"
        }
    }
    "#;
    let dir = settings_dir(patches);
    let registry = Loader::load_dir(dir.path()).unwrap();
    let system = system();

    match Resolver::new(&registry, &system).resolve().unwrap_err() {
        ConfigError::AssertionMismatch {
            field,
            expected,
            actual,
            ..
        } => {
            assert_eq!(field, "name");
            assert_eq!(expected, "something else");
            assert_eq!(actual, "2 NUnit steps: 2 dlls");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_validation_reports_every_problem() {
    let broken = r#"
    project "Broken" parent="Root" {
        build-type "NoRoot" {
            name "No VCS root"
        }
        build-type "Ghost" {
            vcs "GhostRoot"
        }
    }
    "#;
    let dir = settings_dir(PATCHES);
    write(dir.path(), "broken.kdl", broken);

    let registry = Loader::load_dir(dir.path()).unwrap();
    let system = system();
    let resolver = Resolver::new(&registry, &system);

    let (_, errors) = resolver.resolve_report().unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.contains(&ValidationError::MissingVcsRoot {
        build_type: "NoRoot".to_string()
    }));
    assert!(errors.iter().any(|e| matches!(
        e,
        ValidationError::DanglingReference { target, .. } if target == "GhostRoot"
    )));

    match resolver.resolve().unwrap_err() {
        ConfigError::Validation(reported) => assert_eq!(reported, errors),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_resolved_graph_serializes() {
    let dir = settings_dir(PATCHES);
    let registry = Loader::load_dir(dir.path()).unwrap();
    let system = system();
    let resolved = Resolver::new(&registry, &system).resolve().unwrap();

    let json = serde_json::to_value(&resolved).unwrap();
    assert_eq!(json["id"], "Root");
    assert_eq!(json["sub_projects"][0]["id"], "DotNetTestsSamples");

    // Templates are gone from resolved build types.
    let build = &json["sub_projects"][0]["build_types"][0];
    assert!(build.get("templates").is_none());
    assert_eq!(build["steps"].as_array().unwrap().len(), 3);
}
