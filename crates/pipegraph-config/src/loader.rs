//! Loading declarations from disk into a [`Registry`].

use std::path::{Path, PathBuf};

use pipegraph_core::model::{Project, VcsRoot};
use pipegraph_core::patch::{Definition, Patch};
use pipegraph_core::{EntityKind, VcsRootId};
use tracing::{debug, info};

use crate::declaration::{Declarations, SETTINGS_ROOT_ALIAS, parse_declarations};
use crate::{ConfigError, ConfigResult};

/// The declared project tree plus the patches to apply on top of it.
#[derive(Debug, Clone)]
pub struct Registry {
    pub root: Project,
    pub patches: Vec<Patch>,
}

impl Registry {
    pub fn new(root: Project) -> Self {
        Self {
            root,
            patches: Vec::new(),
        }
    }

    pub fn with_patches(mut self, patches: Vec<Patch>) -> Self {
        self.patches = patches;
        self
    }

    /// The VCS root with `id`, anywhere in the declared tree.
    pub fn vcs_root(&self, id: &VcsRootId) -> Option<&VcsRoot> {
        let mut found = None;
        self.root.walk(&mut |project, _| {
            if found.is_none() {
                found = project.vcs_roots.iter().find(|v| &v.id == id);
            }
        });
        found
    }
}

pub struct Loader;

impl Loader {
    /// Load every `*.kdl` file below `dir`, in sorted path order.
    pub fn load_dir(dir: &Path) -> ConfigResult<Registry> {
        let mut files = Vec::new();
        collect_kdl_files(dir, &mut files)?;
        files.sort();

        if files.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "settings dir".to_string(),
                message: format!("no .kdl files found in {}", dir.display()),
            });
        }

        let mut documents = Vec::with_capacity(files.len());
        for path in &files {
            debug!(path = %path.display(), "Loading declarations");
            let text = std::fs::read_to_string(path)?;
            documents.push(parse_declarations(&text)?);
        }

        let registry = combine(documents)?;
        info!(
            files = files.len(),
            patches = registry.patches.len(),
            root = %registry.root.id,
            "Loaded declarations"
        );
        Ok(registry)
    }

    /// Load a single document.
    pub fn load_str(kdl: &str) -> ConfigResult<Registry> {
        combine(vec![parse_declarations(kdl)?])
    }
}

fn collect_kdl_files(dir: &Path, files: &mut Vec<PathBuf>) -> ConfigResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_symlink() && path.is_dir() {
            // Linked directories can form cycles.
            debug!(path = %path.display(), "Skipping symlinked directory");
        } else if path.is_dir() {
            collect_kdl_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "kdl") {
            files.push(path);
        }
    }
    Ok(())
}

fn combine(documents: Vec<Declarations>) -> ConfigResult<Registry> {
    let mut settings_root: Option<VcsRootId> = None;
    let mut roots = Vec::new();
    let mut pending = Vec::new();
    let mut patches = Vec::new();

    for decls in documents {
        if let Some(id) = decls.settings_root {
            match &settings_root {
                Some(existing) if existing != &id => {
                    return Err(ConfigError::InvalidValue {
                        field: "settings-root".to_string(),
                        message: format!("declared as both '{existing}' and '{id}'"),
                    });
                }
                _ => settings_root = Some(id),
            }
        }
        for declared in decls.projects {
            match declared.parent {
                Some(parent) => pending.push((parent, declared.project)),
                None => roots.push(declared.project),
            }
        }
        patches.extend(decls.patches);
    }

    let mut root = match <[Project; 1]>::try_from(roots) {
        Ok([root]) => root,
        Err(roots) => {
            return Err(ConfigError::InvalidValue {
                field: "project".to_string(),
                message: format!(
                    "expected exactly one root project, found {}",
                    roots.len()
                ),
            });
        }
    };

    // A project may attach to another one that is itself still pending.
    while !pending.is_empty() {
        let before = pending.len();
        let mut remaining = Vec::new();
        for (parent, project) in pending {
            match root.find_project_mut(&parent) {
                Some(target) => target.sub_projects.push(project),
                None => remaining.push((parent, project)),
            }
        }
        if remaining.len() == before {
            let (parent, project) = &remaining[0];
            return Err(ConfigError::DanglingReference {
                owner: format!("project '{}'", project.id),
                kind: EntityKind::Project,
                target: parent.to_string(),
            });
        }
        pending = remaining;
    }

    let mut rewrite = |id: &VcsRootId| -> pipegraph_core::Result<VcsRootId> {
        if id.as_str() != SETTINGS_ROOT_ALIAS {
            return Ok(id.clone());
        }
        settings_root
            .clone()
            .ok_or_else(|| pipegraph_core::Error::MalformedEntity {
                kind: EntityKind::VcsRoot,
                id: SETTINGS_ROOT_ALIAS.to_string(),
                reason: "used without a settings-root declaration".to_string(),
            })
    };

    root.rewrite_vcs_references(&mut rewrite)?;
    for patch in &mut patches {
        if let Patch::Create(create) = patch {
            match &mut create.definition {
                Definition::Project(p) => p.rewrite_vcs_references(&mut rewrite)?,
                Definition::BuildType(b) => rewrite_all(&mut b.settings.vcs_roots, &mut rewrite)?,
                Definition::Template(t) => rewrite_all(&mut t.settings.vcs_roots, &mut rewrite)?,
                Definition::VcsRoot(_) => {}
            }
        }
    }

    Ok(Registry::new(root).with_patches(patches))
}

fn rewrite_all<F>(refs: &mut [VcsRootId], f: &mut F) -> ConfigResult<()>
where
    F: FnMut(&VcsRootId) -> pipegraph_core::Result<VcsRootId>,
{
    for r in refs.iter_mut() {
        *r = f(r)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_alias_rewritten() {
        let kdl = r#"
            settings-root "NunitLoader"
            project "Root" {
                vcs-root "NunitLoader" {
                    url "https://github.com/nunit/nunit-project-loader.git"
                }
                build-type "Build" {
                    vcs "@settings"
                }
            }
        "#;

        let registry = Loader::load_str(kdl).unwrap();
        let roots = &registry.root.build_types[0].settings.vcs_roots;
        assert_eq!(roots[0].as_str(), "NunitLoader");
        assert!(registry.vcs_root(&roots[0]).is_some());
    }

    #[test]
    fn test_settings_alias_without_root() {
        let kdl = r#"
            project "Root" {
                build-type "Build" {
                    vcs "@settings"
                }
            }
        "#;

        assert!(matches!(
            Loader::load_str(kdl).unwrap_err(),
            ConfigError::MalformedEntity {
                kind: EntityKind::VcsRoot,
                ..
            }
        ));
    }

    #[test]
    fn test_exactly_one_root() {
        let two = r#"
            project "A"
            project "B"
        "#;
        assert!(Loader::load_str(two).is_err());
        assert!(Loader::load_str("").is_err());
    }

    #[test]
    fn test_attach_out_of_order() {
        let kdl = r#"
            project "Leaf" parent="Middle"
            project "Middle" parent="Root"
            project "Root"
        "#;

        let registry = Loader::load_str(kdl).unwrap();
        let middle = &registry.root.sub_projects[0];
        assert_eq!(middle.id.as_str(), "Middle");
        assert_eq!(middle.sub_projects[0].id.as_str(), "Leaf");
    }

    #[test]
    fn test_missing_parent() {
        let kdl = r#"
            project "Root"
            project "Lost" parent="Nowhere"
        "#;

        match Loader::load_str(kdl).unwrap_err() {
            ConfigError::DanglingReference { target, .. } => assert_eq!(target, "Nowhere"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_dir_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("settings.kdl"),
            r#"
                project "Root"
                patches {
                    change project="Root" {
                        set "name" "first"
                    }
                }
            "#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nested/samples.kdl"),
            r#"
                project "Samples" parent="Root"
                patches {
                    change project="Root" {
                        set "name" "second"
                    }
                }
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let registry = Loader::load_dir(dir.path()).unwrap();
        assert_eq!(registry.root.sub_projects[0].id.as_str(), "Samples");
        assert_eq!(registry.patches.len(), 2);
        // "nested/samples.kdl" sorts before "settings.kdl".
        match &registry.patches[0] {
            Patch::Mutate(m) => assert_eq!(m.mutations[0].value, "second"),
            other => panic!("unexpected patch: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("settings.kdl"), r#"project "Root""#).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("nested").join("loop")).unwrap();

        let registry = Loader::load_dir(dir.path()).unwrap();
        assert_eq!(registry.root.id.as_str(), "Root");
    }

    #[test]
    fn test_load_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Loader::load_dir(dir.path()).is_err());
    }
}
