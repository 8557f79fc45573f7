//! Command lines for each step kind.
//!
//! Every supported kind has a default command whose arguments reference the
//! step's configuration as `%key%`. The system configuration can replace the
//! command for a kind. References are looked up in the step config, then the
//! build type's params, then the system globals. Arguments that name a key
//! no scope defines are dropped; a program that cannot be resolved is an
//! error.

use std::collections::HashMap;

use pipegraph_config::parameters::references;
use pipegraph_config::system::ExecutorConfig;
use pipegraph_config::{ScopeChain, ScopeLevel, SystemConfig};
use pipegraph_core::model::{Parameters, Step, StepKind};
use pipegraph_core::{Error, Result};

/// Step config key for the directory a step runs in.
pub const WORKING_DIR_KEY: &str = "working-dir";

/// How a step kind becomes a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Step config key whose value is split shell-style and appended.
    pub extra_args_key: Option<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            extra_args_key: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn extra_args(mut self, key: impl Into<String>) -> Self {
        self.extra_args_key = Some(key.into());
        self
    }
}

impl From<&ExecutorConfig> for CommandTemplate {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            extra_args_key: config.extra_args_key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandCatalog {
    templates: HashMap<StepKind, CommandTemplate>,
    /// Farthest scope, usually tool paths from the system config.
    globals: Parameters,
}

impl Default for CommandCatalog {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            StepKind::Restore,
            CommandTemplate::new("dotnet")
                .arg("restore")
                .arg("%projects%")
                .extra_args("args"),
        );
        templates.insert(
            StepKind::Build,
            CommandTemplate::new("dotnet")
                .arg("build")
                .arg("%projects%")
                .extra_args("args"),
        );
        templates.insert(
            StepKind::TestRun,
            CommandTemplate::new("nunit3-console")
                .arg("%include-tests%")
                .extra_args("args"),
        );
        templates.insert(
            StepKind::ShellScript,
            CommandTemplate::new("sh").arg("-c").arg("%script%"),
        );
        templates.insert(
            StepKind::GenericProcess,
            CommandTemplate::new("%path%").extra_args("args"),
        );
        Self {
            templates,
            globals: Parameters::new(),
        }
    }
}

impl CommandCatalog {
    /// Defaults with the overrides from `system` applied.
    pub fn from_system(system: &SystemConfig) -> Self {
        let mut catalog = Self::default().with_globals(system.globals.clone());
        for executor in &system.executors {
            catalog.insert(executor.kind.clone(), CommandTemplate::from(executor));
        }
        catalog
    }

    pub fn insert(&mut self, kind: StepKind, template: CommandTemplate) {
        self.templates.insert(kind, template);
    }

    pub fn get(&self, kind: &StepKind) -> Option<&CommandTemplate> {
        self.templates.get(kind)
    }

    pub fn with_globals(mut self, globals: Parameters) -> Self {
        self.globals = globals;
        self
    }

    /// Program and arguments for `step`.
    pub fn command_for(&self, step: &Step) -> Result<Vec<String>> {
        self.command_in(step, &Parameters::new())
    }

    /// Program and arguments for `step` of a build type with `build` params.
    pub fn command_in(&self, step: &Step, build: &Parameters) -> Result<Vec<String>> {
        let template = self.get(&step.kind).ok_or_else(|| {
            Error::InvalidInput(format!("no command for step kind '{}'", step.kind))
        })?;

        let chain = ScopeChain::new()
            .with_layer(ScopeLevel::Step, &step.config)
            .with_layer(ScopeLevel::Build, build.as_map())
            .with_layer(ScopeLevel::Global, self.globals.as_map());
        let expand = |input: &str| {
            chain
                .substitute(input)
                .map_err(|e| Error::InvalidInput(format!("step '{}': {e}", step.id)))
        };

        let program = expand(&template.program)?;
        if program.trim().is_empty() || !chain.unresolved_references(&program).is_empty() {
            return Err(Error::InvalidInput(format!(
                "step '{}' has no program to run",
                step.id
            )));
        }

        let mut command = vec![program];
        for arg in &template.args {
            if is_unset_placeholder(arg, &chain) {
                continue;
            }
            command.push(expand(arg)?);
        }

        if let Some(value) = template
            .extra_args_key
            .as_ref()
            .and_then(|key| step.config.get(key))
        {
            let extra = shell_words::split(value).map_err(|e| {
                Error::InvalidInput(format!("step '{}': cannot split arguments: {e}", step.id))
            })?;
            command.extend(extra);
        }

        Ok(command)
    }
}

/// `%key%` on its own where no scope defines `key`.
fn is_unset_placeholder(arg: &str, chain: &ScopeChain<'_>) -> bool {
    match references(arg).as_slice() {
        [name] => arg == format!("%{name}%") && chain.lookup(name).is_none(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipegraph_config::system::parse_system_config;

    fn step(kind: StepKind, config: &[(&str, &str)]) -> Step {
        config
            .iter()
            .fold(Step::new("step", kind).unwrap(), |s, (k, v)| s.with_config(*k, *v))
    }

    #[test]
    fn test_restore_command() {
        let catalog = CommandCatalog::default();
        let command = catalog
            .command_for(&step(
                StepKind::Restore,
                &[("projects", "nunit-project-loader.sln")],
            ))
            .unwrap();
        assert_eq!(command, vec!["dotnet", "restore", "nunit-project-loader.sln"]);
    }

    #[test]
    fn test_missing_optional_argument_dropped() {
        let catalog = CommandCatalog::default();
        let command = catalog
            .command_for(&step(StepKind::Build, &[("args", "-c Release --no-restore")]))
            .unwrap();
        assert_eq!(command, vec!["dotnet", "build", "-c", "Release", "--no-restore"]);
    }

    #[test]
    fn test_extra_args_are_shell_split() {
        let catalog = CommandCatalog::default();
        let command = catalog
            .command_for(&step(
                StepKind::TestRun,
                &[
                    ("include-tests", "bin/Debug/net20/test-1.dll"),
                    ("args", r#"--where "cat == Smoke""#),
                ],
            ))
            .unwrap();
        assert_eq!(
            command,
            vec![
                "nunit3-console",
                "bin/Debug/net20/test-1.dll",
                "--where",
                "cat == Smoke"
            ]
        );
    }

    #[test]
    fn test_shell_script() {
        let catalog = CommandCatalog::default();
        let command = catalog
            .command_for(&step(StepKind::ShellScript, &[("script", "echo done")]))
            .unwrap();
        assert_eq!(command, vec!["sh", "-c", "echo done"]);
    }

    #[test]
    fn test_generic_process_needs_path() {
        let catalog = CommandCatalog::default();
        assert!(catalog.command_for(&step(StepKind::GenericProcess, &[])).is_err());

        let command = catalog
            .command_for(&step(
                StepKind::GenericProcess,
                &[("path", "/usr/bin/make"), ("args", "all")],
            ))
            .unwrap();
        assert_eq!(command, vec!["/usr/bin/make", "all"]);
    }

    #[test]
    fn test_system_override() {
        let system = parse_system_config(
            r#"
            executor "test-run" program="/opt/nunit/nunit3-console" {
                arg "%include-tests%"
                arg "--noresult"
            }
            "#,
        )
        .unwrap();
        let catalog = CommandCatalog::from_system(&system);

        let command = catalog
            .command_for(&step(StepKind::TestRun, &[("include-tests", "test.dll")]))
            .unwrap();
        assert_eq!(command, vec!["/opt/nunit/nunit3-console", "test.dll", "--noresult"]);
    }

    #[test]
    fn test_system_program_uses_globals() {
        let system = parse_system_config(
            r#"
            param "teamcity.tool.NUnit.Console.DEFAULT" "/opt/nunit"
            executor "test-run" program="%teamcity.tool.NUnit.Console.DEFAULT%/nunit3-console" {
                arg "%include-tests%"
            }
            "#,
        )
        .unwrap();
        let catalog = CommandCatalog::from_system(&system);

        let command = catalog
            .command_for(&step(StepKind::TestRun, &[("include-tests", "test.dll")]))
            .unwrap();
        assert_eq!(command, vec!["/opt/nunit/nunit3-console", "test.dll"]);
    }

    #[test]
    fn test_build_params_sit_between_step_and_globals() {
        let mut globals = Parameters::new();
        globals.set("dotnet.path", "/usr/bin/dotnet");
        globals.set("configuration", "Debug");
        let mut catalog = CommandCatalog::default().with_globals(globals);
        catalog.insert(
            StepKind::Build,
            CommandTemplate::new("%dotnet.path%")
                .arg("build")
                .arg("%configuration%")
                .arg("%framework%"),
        );

        let mut build = Parameters::new();
        build.set("configuration", "Release");

        let command = catalog
            .command_in(&step(StepKind::Build, &[]), &build)
            .unwrap();
        assert_eq!(command, vec!["/usr/bin/dotnet", "build", "Release"]);
    }

    #[test]
    fn test_unsupported_kind() {
        let catalog = CommandCatalog::default();
        assert!(
            catalog
                .command_for(&step(StepKind::from("powershell"), &[]))
                .is_err()
        );
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        let catalog = CommandCatalog::default();
        let result = catalog.command_for(&step(
            StepKind::Build,
            &[("projects", "a.sln"), ("args", "\"unterminated")],
        ));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
