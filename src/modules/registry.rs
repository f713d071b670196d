//! Catalog of module templates discovered under the modules root.

use super::{ScriptBody, TaskHandle};
use crate::error::{HubError, Result};
use crate::manifest::{MANIFEST_FILE, ModuleManifest};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A discovered template: its manifest and the directory it lives in.
#[derive(Debug, Clone)]
pub struct ModuleTemplate {
    pub manifest: ModuleManifest,
    pub dir: PathBuf,
}

impl ModuleTemplate {
    pub fn module_type(&self) -> &str {
        &self.manifest.module_type
    }
}

/// Outcome of one [`ModuleRegistry::discover`] pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Module types now in the catalog, sorted.
    pub loaded: Vec<String>,
    /// Template directories that were not loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

type Catalog = BTreeMap<String, Arc<ModuleTemplate>>;

/// Read-mostly catalog of module templates plus natively registered bodies.
pub struct ModuleRegistry {
    root: PathBuf,
    catalog: RwLock<Arc<Catalog>>,
    bodies: RwLock<HashMap<String, TaskHandle>>,
}

impl ModuleRegistry {
    /// Creates an empty registry for templates under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            catalog: RwLock::new(Arc::new(Catalog::new())),
            bodies: RwLock::new(HashMap::new()),
        }
    }

    /// Template root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scans the root and replaces the catalog in one step.
    ///
    /// Each sub-directory containing `manifest.toml` is a template. Broken
    /// manifests and duplicate `module_type`s are skipped and reported. A
    /// missing root yields an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root exists but cannot be listed.
    pub fn discover(&self) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let mut catalog = Catalog::new();

        if self.root.is_dir() {
            let mut dirs: Vec<PathBuf> = std::fs::read_dir(&self.root)?
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
                .collect();
            dirs.sort();

            for dir in dirs {
                let manifest = match ModuleManifest::load_from_dir(&dir) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "skipping module template");
                        report.skipped.push((dir, e.to_string()));
                        continue;
                    }
                };
                if let Some(existing) = catalog.get(&manifest.module_type) {
                    let reason = format!(
                        "module_type `{}` already provided by {}",
                        manifest.module_type,
                        existing.dir.display()
                    );
                    warn!(dir = %dir.display(), %reason, "skipping duplicate module template");
                    report.skipped.push((dir, reason));
                    continue;
                }
                debug!(module_type = %manifest.module_type, dir = %dir.display(), "module template loaded");
                catalog.insert(
                    manifest.module_type.clone(),
                    Arc::new(ModuleTemplate { manifest, dir }),
                );
            }
        } else {
            debug!(root = %self.root.display(), "module root does not exist");
        }

        report.loaded = catalog.keys().cloned().collect();
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(catalog);
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "module discovery finished"
        );
        Ok(report)
    }

    /// Template registered under `module_type`.
    pub fn get(&self, module_type: &str) -> Option<Arc<ModuleTemplate>> {
        self.snapshot().get(module_type).cloned()
    }

    /// All templates, ordered by module type.
    pub fn templates(&self) -> Vec<Arc<ModuleTemplate>> {
        self.snapshot().values().cloned().collect()
    }

    /// The current catalog. Later discoveries do not affect the returned map.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Arc<ModuleTemplate>>> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Registers an in-process body for `module_type`, replacing any previous one.
    pub fn register_body(&self, module_type: &str, body: TaskHandle) {
        self.bodies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(module_type.to_owned(), body);
        debug!(%module_type, "native task body registered");
    }

    /// Whether an in-process body is registered for `module_type`.
    pub fn has_native_body(&self, module_type: &str) -> bool {
        self.bodies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(module_type)
    }

    /// Resolves the body for an instance of `manifest` living in `task_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] if there is neither a native body nor
    /// an `entry` script.
    pub fn resolve_body(&self, manifest: &ModuleManifest, task_dir: &Path) -> Result<TaskHandle> {
        if let Some(body) = self
            .bodies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&manifest.module_type)
        {
            return Ok(Arc::clone(body));
        }
        let Some(entry) = &manifest.entry else {
            return Err(HubError::Validation {
                reason: format!(
                    "module `{}` has no entry script and no native body",
                    manifest.module_type
                ),
            });
        };
        let script = task_dir.join(crate::manifest::safe_relative_path(entry)?);
        Ok(Arc::new(ScriptBody::new(manifest.interpreter.clone(), script)))
    }
}
