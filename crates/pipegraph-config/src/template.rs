//! Template layering.
//!
//! A build type is resolved by starting from an empty layer, merging each of
//! its templates in declared order and finally its own settings. Steps merge
//! by id, triggers and features by `(kind, id)`: a later layer replaces an
//! earlier entry in place and appends anything new. VCS roots are an ordered
//! union and parameters are overlaid so the nearest layer wins.

use std::collections::HashMap;

use pipegraph_core::model::{BuildSettings, BuildType, Project, Template};
use pipegraph_core::resolved::ResolvedBuildType;
use pipegraph_core::TemplateId;
use tracing::{debug, warn};

use crate::{ConfigError, ConfigResult};

/// Index of every template in a project tree.
#[derive(Debug)]
pub struct TemplateResolver<'a> {
    templates: HashMap<&'a str, &'a Template>,
}

impl<'a> TemplateResolver<'a> {
    /// Index the templates of `root`. When an id is declared twice the first
    /// declaration is used and the validator reports the duplicate.
    pub fn new(root: &'a Project) -> Self {
        let mut templates = HashMap::new();

        root.walk(&mut |project, _| {
            for template in &project.templates {
                if templates.contains_key(template.id.as_str()) {
                    warn!(template = %template.id, project = %project.id, "Template id declared twice");
                } else {
                    templates.insert(template.id.as_str(), template);
                }
            }
        });

        Self { templates }
    }

    pub fn get(&self, id: &TemplateId) -> Option<&'a Template> {
        self.templates.get(id.as_str()).copied()
    }

    /// Merge the templates of `build_type` with its own settings.
    pub fn resolve(&self, build_type: &BuildType) -> ConfigResult<ResolvedBuildType> {
        let layers = build_type
            .templates
            .iter()
            .map(|id| {
                self.get(id).ok_or_else(|| ConfigError::UnknownTemplate {
                    build_type: build_type.id.to_string(),
                    template: id.to_string(),
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let mut merged = BuildSettings::default();
        for template in &layers {
            debug!(build_type = %build_type.id, template = %template.id, "Applying template");
            merge_settings(&mut merged, &template.settings);
        }
        merge_settings(&mut merged, &build_type.settings);

        Ok(ResolvedBuildType {
            id: build_type.id.clone(),
            name: build_type.name.clone(),
            description: build_type.description.clone(),
            params: merged.params,
            steps: merged.steps,
            triggers: merged.triggers,
            features: merged.features,
            vcs_roots: merged.vcs_roots,
            rootless: build_type.rootless,
        })
    }
}

/// Merge `layer` over `base`.
pub fn merge_settings(base: &mut BuildSettings, layer: &BuildSettings) {
    base.params.overlay(&layer.params);
    merge_keyed(&mut base.steps, &layer.steps, |s| s.id.clone());
    merge_keyed(&mut base.triggers, &layer.triggers, |t| t.key());
    merge_keyed(&mut base.features, &layer.features, |f| f.key());
    for root in &layer.vcs_roots {
        base.attach_vcs_root(root.clone());
    }
}

fn merge_keyed<T, K, F>(base: &mut Vec<T>, layer: &[T], key: F)
where
    T: Clone,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    // Only entries from earlier layers can be replaced. The first inherited
    // match takes the new entry and any further inherited matches are dropped.
    let inherited = base.len();
    let mut replaced = vec![false; inherited];
    let mut dropped = vec![false; inherited];
    for item in layer {
        let k = key(item);
        let matches: Vec<usize> = (0..inherited)
            .filter(|&i| !replaced[i] && !dropped[i] && key(&base[i]) == k)
            .collect();
        match matches.split_first() {
            Some((&first, rest)) => {
                base[first] = item.clone();
                replaced[first] = true;
                for &i in rest {
                    dropped[i] = true;
                }
            }
            None => base.push(item.clone()),
        }
    }

    let mut index = 0;
    base.retain(|_| {
        let keep = index >= inherited || !dropped[index];
        index += 1;
        keep
    });
}
