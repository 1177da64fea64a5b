//! # Capability Policy
//!
//! The immutable rule set a domain is created with. It answers two
//! questions: may this domain compile source at runtime, and which files may
//! its loader open.
//!
//! Module paths are resolved against the runtime's plugin directory. A
//! policy that names a path outside that directory is refused when the
//! domain is created, never silently narrowed.

use std::collections::BTreeSet;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;

/// What an isolation domain is permitted to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityPolicy {
    allow_dynamic_compilation: bool,
    allowed_module_paths: BTreeSet<PathBuf>,
}

impl CapabilityPolicy {
    /// Loading of pre-built modules only.
    pub fn static_only() -> Self {
        Self::default()
    }

    /// Loading plus compilation of source text inside the domain.
    pub fn allow_dynamic() -> Self {
        Self {
            allow_dynamic_compilation: true,
            ..Self::default()
        }
    }

    /// Adds a file or directory (relative to the plugin directory) the
    /// loader may open. With no paths at all, the whole plugin directory is
    /// allowed.
    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_module_paths.insert(path.into());
        self
    }

    pub fn allows_dynamic_compilation(&self) -> bool {
        self.allow_dynamic_compilation
    }

    pub fn allowed_module_paths(&self) -> impl Iterator<Item = &Path> {
        self.allowed_module_paths.iter().map(PathBuf::as_path)
    }

    /// Pins the policy to a plugin directory, producing the scope the loader
    /// checks every request against.
    pub(crate) fn resolve(&self, plugin_dir: &Path) -> Result<ModuleScope> {
        let base = normalize(plugin_dir);

        if self.allowed_module_paths.is_empty() {
            return Ok(ModuleScope { base: base.clone(), roots: vec![base] });
        }

        let mut roots = Vec::with_capacity(self.allowed_module_paths.len());
        for path in &self.allowed_module_paths {
            let root = normalize(&base.join(path));
            if !root.starts_with(&base) {
                return Err(Error::PolicyViolation(format!(
                    "allowed path {} lies outside the plugin directory {}",
                    path.display(),
                    base.display()
                )));
            }
            roots.push(root);
        }

        Ok(ModuleScope { base, roots })
    }
}

/// A policy's module paths, resolved against one plugin directory.
#[derive(Clone, Debug)]
pub(crate) struct ModuleScope {
    base: PathBuf,
    roots: Vec<PathBuf>,
}

impl ModuleScope {
    /// Resolves a requested module path and checks it against the allowed
    /// roots before anything is read from disk.
    pub(crate) fn check(&self, module_path: &str) -> Result<PathBuf> {
        let resolved = normalize(&self.base.join(module_path));

        if !self.roots.iter().any(|root| resolved.starts_with(root)) {
            return Err(Error::PolicyViolation(format!(
                "module path {} is not within the allowed module paths",
                module_path
            )));
        }

        // A symlink inside an allowed root must not lead outside of it.
        if let Ok(real) = resolved.canonicalize() {
            let escapes = !self.roots.iter().any(|root| {
                let real_root = root.canonicalize().unwrap_or_else(|_| root.clone());
                real.starts_with(real_root)
            });
            if escapes {
                return Err(Error::PolicyViolation(format!(
                    "module path {} resolves outside the allowed module paths",
                    module_path
                )));
            }
        }

        Ok(resolved)
    }
}

/// Lexically removes `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
