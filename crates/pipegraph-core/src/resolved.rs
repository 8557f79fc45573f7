//! The resolved execution graph.
//!
//! Templates are merged, patches applied and parameters substituted. No build
//! type in here refers to a template any more, and nothing is mutated after
//! resolution; a configuration change produces a new graph.

use serde::{Deserialize, Serialize};

use crate::id::{BuildTypeId, ProjectId, VcsRootId};
use crate::model::{Feature, Parameters, Step, Template, Trigger, VcsRoot};

/// A build type with all template layers merged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBuildType {
    pub id: BuildTypeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params: Parameters,
    pub steps: Vec<Step>,
    pub triggers: Vec<Trigger>,
    pub features: Vec<Feature>,
    pub vcs_roots: Vec<VcsRootId>,
    pub rootless: bool,
}

impl ResolvedBuildType {
    /// Steps that will be dispatched, in execution order.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedProject {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params: Parameters,
    pub vcs_roots: Vec<VcsRoot>,
    /// Templates declared in this project, after patches. Build types no
    /// longer refer to them; they are kept so their own references are
    /// validated even when no build type uses them.
    pub templates: Vec<Template>,
    pub build_types: Vec<ResolvedBuildType>,
    pub sub_projects: Vec<ResolvedProject>,
}

impl ResolvedProject {
    /// Visit this project and every descendant, depth first.
    pub fn walk<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a ResolvedProject),
    {
        f(self);
        for sub in &self.sub_projects {
            sub.walk(f);
        }
    }

    pub fn find_build_type(&self, id: &BuildTypeId) -> Option<&ResolvedBuildType> {
        self.build_types
            .iter()
            .find(|b| &b.id == id)
            .or_else(|| self.sub_projects.iter().find_map(|p| p.find_build_type(id)))
    }

    /// Every build type in the tree, depth first.
    pub fn all_build_types(&self) -> Vec<&ResolvedBuildType> {
        let mut out = Vec::new();
        self.walk(&mut |project| out.extend(project.build_types.iter()));
        out
    }
}
