//! System configuration parsing.
//!
//! ```kdl
//! param "teamcity.tool.NUnit.Console.DEFAULT" "/opt/nunit/3.17.0"
//!
//! executor "test-run" program="%teamcity.tool.NUnit.Console.DEFAULT%/nunit3-console" {
//!     arg "%include-tests%"
//!     extra-args "args"
//! }
//!
//! log-dir "/var/log/pipegraph"
//! ```

use std::path::{Path, PathBuf};

use kdl::{KdlDocument, KdlNode};
use pipegraph_core::model::{Parameters, StepKind};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Global parameters, the farthest scope of every lookup.
    #[serde(default)]
    pub globals: Parameters,
    /// Command overrides per step kind.
    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,
    /// Where step output is written.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// How a step kind turns into a command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub kind: StepKind,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Step config key whose value is split and appended to the arguments.
    #[serde(default)]
    pub extra_args_key: Option<String>,
}

impl SystemConfig {
    /// Read a system configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_system_config(&text)
    }

    /// Set a global parameter, replacing a value from the file.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.globals.set(key, value);
    }

    pub fn executor(&self, kind: &StepKind) -> Option<&ExecutorConfig> {
        self.executors.iter().find(|e| &e.kind == kind)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "param" => {
                let (key, value) = string_pair(node)?;
                config.globals.declare(key, value)?;
            }
            "executor" => {
                let executor = parse_executor(node)?;
                if config.executor(&executor.kind).is_some() {
                    return Err(ConfigError::InvalidValue {
                        field: "executor".to_string(),
                        message: format!("executor for '{}' declared twice", executor.kind),
                    });
                }
                config.executors.push(executor);
            }
            "log-dir" => {
                let dir = first_string(node).ok_or_else(|| ConfigError::InvalidValue {
                    field: "log-dir".to_string(),
                    message: "expected a path".to_string(),
                })?;
                config.log_dir = Some(PathBuf::from(dir));
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "system config".to_string(),
                    message: format!("unknown node `{other}`"),
                });
            }
        }
    }

    Ok(config)
}

/// Parse a `key=value` parameter override.
pub fn parse_param_override(input: &str) -> ConfigResult<(String, String)> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::InvalidValue {
            field: "param".to_string(),
            message: format!("expected key=value, got '{input}'"),
        }),
    }
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    let kind = first_string(node).ok_or_else(|| ConfigError::InvalidValue {
        field: "executor".to_string(),
        message: "expected a step kind".to_string(),
    })?;
    let program = node
        .get("program")
        .and_then(|v| v.as_string())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "executor".to_string(),
            message: format!("executor '{kind}' needs program=\"...\""),
        })?;

    let mut executor = ExecutorConfig {
        kind: StepKind::from(kind),
        program,
        args: Vec::new(),
        extra_args_key: None,
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "arg" => executor.args.extend(first_string(child)),
                "extra-args" => executor.extra_args_key = first_string(child),
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("executor '{}'", executor.kind),
                        message: format!("unknown node `{other}`"),
                    });
                }
            }
        }
    }

    Ok(executor)
}

fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn string_pair(node: &KdlNode) -> ConfigResult<(String, String)> {
    let args: Vec<&str> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .collect();
    match args.as_slice() {
        [key, value] => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "expected a name and a value".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_config() {
        let kdl = r#"
            param "teamcity.tool.NUnit.Console.DEFAULT" "/opt/nunit"

            executor "test-run" program="%teamcity.tool.NUnit.Console.DEFAULT%/nunit3-console" {
                arg "%include-tests%"
                arg "--noresult"
                extra-args "args"
            }

            log-dir "/var/log/pipegraph"
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(
            config.globals.get("teamcity.tool.NUnit.Console.DEFAULT"),
            Some("/opt/nunit")
        );
        let executor = config.executor(&StepKind::TestRun).unwrap();
        assert_eq!(executor.args, vec!["%include-tests%", "--noresult"]);
        assert_eq!(executor.extra_args_key.as_deref(), Some("args"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/pipegraph")));
    }

    #[test]
    fn test_empty_config() {
        let config = parse_system_config("").unwrap();
        assert!(config.globals.is_empty());
        assert!(config.executors.is_empty());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_executor_requires_program() {
        let result = parse_system_config(r#"executor "build""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_duplicate_global_param() {
        let kdl = r#"
            param "env.CI" "true"
            param "env.CI" "false"
        "#;
        assert!(matches!(
            parse_system_config(kdl),
            Err(ConfigError::MalformedEntity { .. })
        ));
    }

    #[test]
    fn test_param_override() {
        assert_eq!(
            parse_param_override("configuration=Release").unwrap(),
            ("configuration".to_string(), "Release".to_string())
        );
        assert_eq!(
            parse_param_override("filter=a=b").unwrap(),
            ("filter".to_string(), "a=b".to_string())
        );
        assert!(parse_param_override("novalue").is_err());
        assert!(parse_param_override("=x").is_err());
    }
}
