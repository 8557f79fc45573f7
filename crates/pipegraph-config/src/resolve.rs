//! The resolution pipeline: patches, template merge, parameter substitution
//! and validation, in that order.

use pipegraph_core::model::{Parameters, Project};
use pipegraph_core::resolved::{ResolvedBuildType, ResolvedProject};
use tracing::{debug, info};

use crate::loader::Registry;
use crate::parameters::{ScopeChain, ScopeLevel, references};
use crate::patch::PatchApplier;
use crate::system::SystemConfig;
use crate::template::TemplateResolver;
use crate::validate::{ValidatedProject, ValidationError, Validator};
use crate::ConfigResult;

pub struct Resolver<'a> {
    registry: &'a Registry,
    system: &'a SystemConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry, system: &'a SystemConfig) -> Self {
        Self { registry, system }
    }

    /// Resolve and validate the whole tree.
    pub fn resolve(&self) -> ConfigResult<ValidatedProject> {
        Validator::check(self.resolve_tree()?)
    }

    /// Resolve the tree and return it together with every validation error
    /// instead of failing on them.
    pub fn resolve_report(&self) -> ConfigResult<(ResolvedProject, Vec<ValidationError>)> {
        let tree = self.resolve_tree()?;
        let errors = Validator::validate(&tree);
        Ok((tree, errors))
    }

    fn resolve_tree(&self) -> ConfigResult<ResolvedProject> {
        let patched = PatchApplier::apply(&self.registry.root, &self.registry.patches)?;
        let templates = TemplateResolver::new(&patched);
        let resolved = resolve_project(&patched, &[], &templates, self.system.globals.as_map())?;

        info!(
            root = %resolved.id,
            build_types = resolved.all_build_types().len(),
            "Resolved project tree"
        );
        Ok(resolved)
    }
}

fn resolve_project(
    project: &Project,
    ancestors: &[&Project],
    templates: &TemplateResolver<'_>,
    globals: &std::collections::BTreeMap<String, String>,
) -> ConfigResult<ResolvedProject> {
    let mut chain = ScopeChain::new().with_layer(ScopeLevel::Project, project.params.as_map());
    for ancestor in ancestors.iter().rev() {
        chain = chain.with_layer(ScopeLevel::Project, ancestor.params.as_map());
    }
    let chain = chain.with_layer(ScopeLevel::Global, globals);

    let params = Parameters::from(chain.substitute_map(project.params.as_map())?);

    let mut vcs_roots = Vec::with_capacity(project.vcs_roots.len());
    for root in &project.vcs_roots {
        let mut root = root.clone();
        let url = chain.substitute(&root.url)?;
        root.set_url(url)?;
        root.branch = root.branch.map(|b| chain.substitute(&b)).transpose()?;
        root.branch_spec = root.branch_spec.map(|b| chain.substitute(&b)).transpose()?;
        vcs_roots.push(root);
    }

    let mut build_types = Vec::with_capacity(project.build_types.len());
    for build_type in &project.build_types {
        let merged = templates.resolve(build_type)?;
        build_types.push(substitute_build(merged, &chain)?);
    }

    let mut nested = ancestors.to_vec();
    nested.push(project);
    let sub_projects = project
        .sub_projects
        .iter()
        .map(|sub| resolve_project(sub, &nested, templates, globals))
        .collect::<ConfigResult<Vec<_>>>()?;

    Ok(ResolvedProject {
        id: project.id.clone(),
        name: project.name.clone(),
        description: project.description.clone(),
        params,
        vcs_roots,
        templates: project.templates.clone(),
        build_types,
        sub_projects,
    })
}

fn substitute_build(
    mut build: ResolvedBuildType,
    project_chain: &ScopeChain<'_>,
) -> ConfigResult<ResolvedBuildType> {
    let declared = build.params.as_map().clone();
    let chain = project_chain.nested(ScopeLevel::Build, &declared);
    build.params = Parameters::from(chain.substitute_map(&declared)?);

    for step in &mut build.steps {
        let config = step.config.clone();
        let step_chain = chain.nested(ScopeLevel::Step, &config);
        step.config = step_chain.substitute_map(&config)?;

        for (key, value) in &step.config {
            let unresolved = references(value);
            if !unresolved.is_empty() {
                debug!(
                    build_type = %build.id,
                    step = %step.id,
                    key = %key,
                    ?unresolved,
                    "Leaving parameters for the agent"
                );
            }
        }
    }

    for trigger in &mut build.triggers {
        trigger.config = chain.substitute_map(&trigger.config)?;
    }
    for feature in &mut build.features {
        feature.config = chain.substitute_map(&feature.config)?;
    }

    Ok(build)
}
