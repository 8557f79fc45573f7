//! Parameter substitution for pipeline configurations.
//!
//! Values reference other parameters as `%name%`. Names may contain letters,
//! digits, `.`, `_` and `-`, e.g. `%teamcity.tool.NUnit.Console.3.17.0%`.
//! `%%` stands for a literal percent sign.
//!
//! Lookups walk a [`ScopeChain`] nearest-first: step, build, project (then
//! its parents), global. Names that no scope defines are left in place,
//! because tool paths and credentials are filled in by the executing server.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

// Matches either an escaped percent or a %name% reference.
static PARAM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%|%([A-Za-z0-9_.\-]+)%").unwrap());

/// Where a layer of parameters comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLevel {
    Step,
    Build,
    Project,
    Global,
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeLevel::Step => "step",
            ScopeLevel::Build => "build",
            ScopeLevel::Project => "project",
            ScopeLevel::Global => "global",
        };
        f.write_str(name)
    }
}

/// Layered parameter scopes, nearest first.
#[derive(Debug, Clone, Default)]
pub struct ScopeChain<'a> {
    layers: Vec<(ScopeLevel, &'a BTreeMap<String, String>)>,
}

impl<'a> ScopeChain<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer that is further away than every existing one.
    pub fn with_layer(mut self, level: ScopeLevel, params: &'a BTreeMap<String, String>) -> Self {
        self.layers.push((level, params));
        self
    }

    /// A new chain with `params` in front of every existing layer.
    pub fn nested(&self, level: ScopeLevel, params: &'a BTreeMap<String, String>) -> Self {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push((level, params));
        layers.extend(self.layers.iter().copied());
        Self { layers }
    }

    /// Look up a name in the nearest scope that defines it.
    pub fn lookup(&self, name: &str) -> Option<&'a str> {
        self.layers
            .iter()
            .find_map(|&(_, params)| params.get(name).map(String::as_str))
    }

    /// Level of the scope that defines `name`, if any.
    pub fn defined_at(&self, name: &str) -> Option<ScopeLevel> {
        self.layers
            .iter()
            .find(|(_, params)| params.contains_key(name))
            .map(|(level, _)| *level)
    }

    /// Substitute every `%name%` in `input`.
    pub fn substitute(&self, input: &str) -> ConfigResult<String> {
        let mut stack = Vec::new();
        self.expand(input, &mut stack)
    }

    /// Substitute the value stored under `key`. The key itself counts as
    /// being resolved, so `key = %key%` is a cycle.
    pub fn substitute_entry(&self, key: &str, value: &str) -> ConfigResult<String> {
        let mut stack = vec![key.to_string()];
        self.expand(value, &mut stack)
    }

    /// Substitute every value of a map.
    pub fn substitute_map(
        &self,
        map: &BTreeMap<String, String>,
    ) -> ConfigResult<BTreeMap<String, String>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.substitute_entry(k, v)?)))
            .collect()
    }

    /// References in `input` that no scope defines.
    pub fn unresolved_references(&self, input: &str) -> Vec<String> {
        references(input)
            .into_iter()
            .filter(|name| self.lookup(name).is_none())
            .collect()
    }

    fn expand(&self, input: &str, stack: &mut Vec<String>) -> ConfigResult<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for caps in PARAM_REGEX.captures_iter(input) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&input[last..whole.start()]);
            last = whole.end();

            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                out.push('%');
                continue;
            };

            if let Some(pos) = stack.iter().position(|n| n == name) {
                let mut chain = stack[pos..].to_vec();
                chain.push(name.to_string());
                return Err(ConfigError::CyclicParameter {
                    chain: chain.join(" -> "),
                });
            }

            match self.lookup(name) {
                Some(value) => {
                    stack.push(name.to_string());
                    let expanded = self.expand(value, stack)?;
                    stack.pop();
                    out.push_str(&expanded);
                }
                None => out.push_str(whole.as_str()),
            }
        }

        out.push_str(&input[last..]);
        Ok(out)
    }
}

/// Names referenced as `%name%` in `input`, in order of appearance.
pub fn references(input: &str) -> Vec<String> {
    PARAM_REGEX
        .captures_iter(input)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
