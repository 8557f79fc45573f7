//! CLI command implementations.

pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pipegraph_config::system::parse_param_override;
use pipegraph_config::{ConfigError, Loader, Registry, Resolver, SystemConfig, ValidatedProject};
use tracing::debug;

/// Flags shared by every command.
pub struct GlobalOptions {
    pub system_config: Option<PathBuf>,
    pub params: Vec<String>,
}

/// Load declarations and the system configuration, applying `--param` overrides.
pub fn load(options: &GlobalOptions, dir: &Path) -> Result<(Registry, SystemConfig)> {
    let registry = Loader::load_dir(dir)
        .with_context(|| format!("Failed to load declarations from {}", dir.display()))?;

    let mut system = match &options.system_config {
        Some(path) => SystemConfig::load(path)
            .with_context(|| format!("Failed to load system config: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    for param in &options.params {
        let (key, value) = parse_param_override(param)?;
        debug!(%key, %value, "Global parameter override");
        system.set_param(key, value);
    }

    Ok((registry, system))
}

/// Resolve and validate, printing every validation error on failure.
pub fn resolve_validated(registry: &Registry, system: &SystemConfig) -> Result<ValidatedProject> {
    match Resolver::new(registry, system).resolve() {
        Ok(project) => Ok(project),
        Err(ConfigError::Validation(errors)) => {
            for error in &errors {
                eprintln!("  ✗ {}", error);
            }
            anyhow::bail!("Configuration has {} error(s)", errors.len());
        }
        Err(e) => Err(e).context("Failed to resolve configuration"),
    }
}

pub fn validate(options: &GlobalOptions, dir: &Path) -> Result<()> {
    let (registry, system) = load(options, dir)?;
    let (tree, errors) = Resolver::new(&registry, &system)
        .resolve_report()
        .context("Failed to resolve configuration")?;

    if errors.is_empty() {
        println!(
            "Configuration is valid ({} build types)",
            tree.all_build_types().len()
        );
        return Ok(());
    }

    for error in &errors {
        println!("  ✗ {}", error);
    }
    anyhow::bail!("Configuration has {} error(s)", errors.len());
}

pub fn resolve(
    options: &GlobalOptions,
    dir: &Path,
    output: Option<&Path>,
    compact: bool,
) -> Result<()> {
    let (registry, system) = load(options, dir)?;
    let project = resolve_validated(&registry, &system)?;

    let json = if compact {
        serde_json::to_string(&project)?
    } else {
        serde_json::to_string_pretty(&project)?
    };

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote resolved graph to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn list(options: &GlobalOptions, dir: &Path) -> Result<()> {
    let (registry, system) = load(options, dir)?;
    let (tree, errors) = Resolver::new(&registry, &system)
        .resolve_report()
        .context("Failed to resolve configuration")?;

    print_project(&tree, 0);
    if !errors.is_empty() {
        println!("\n{} validation error(s); run `pipegraph validate` for details", errors.len());
    }
    Ok(())
}

fn print_project(project: &pipegraph_core::resolved::ResolvedProject, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}{} ({})", indent, project.name, project.id);
    for build in &project.build_types {
        let enabled = build.enabled_steps().count();
        println!(
            "{}  - {} [{}]: {} step(s), {} enabled",
            indent,
            build.name,
            build.id,
            build.steps.len(),
            enabled
        );
    }
    for sub in &project.sub_projects {
        print_project(sub, depth + 1);
    }
}
