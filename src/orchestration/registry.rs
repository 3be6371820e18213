//! Derived artifacts regenerated after merging.
//!
//! Every package under `packages_dir` that received new files gets its
//! auto-registration index rewritten to list the package's source files, and
//! its setup file patched to import that index.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::RegistryConfig;
use crate::{clog, clog_debug, Result};

const INDEX_HEADER: &str = "// Generated by convoy. Do not edit by hand.";

/// Regenerates registration indexes for one repository checkout.
pub struct RegistryWriter<'a> {
    root: &'a Path,
    config: &'a RegistryConfig,
}

impl<'a> RegistryWriter<'a> {
    pub fn new(root: &'a Path, config: &'a RegistryConfig) -> Self {
        Self { root, config }
    }

    /// Package names touched by `files` (paths relative to the repository
    /// root), excluding the template package.
    pub fn affected_packages<P: AsRef<Path>>(&self, files: &[P]) -> BTreeSet<String> {
        let packages_dir = Path::new(&self.config.packages_dir);
        files
            .iter()
            .filter_map(|file| file.as_ref().strip_prefix(packages_dir).ok())
            .filter_map(|rest| {
                let mut components = rest.components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(name)), Some(_)) => name.to_str().map(String::from),
                    _ => None,
                }
            })
            .filter(|name| name != &self.config.template_dir)
            .collect()
    }

    fn package_dir(&self, package: &str) -> PathBuf {
        Path::new(&self.config.packages_dir).join(package)
    }

    /// Source file stems listed by the index, sorted.
    fn source_stems(&self, sources: &Path) -> Result<Vec<String>> {
        let mut stems = Vec::new();
        for entry in fs::read_dir(sources)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(self.config.index_file.as_str()) {
                continue;
            }
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !self.config.extensions.iter().any(|e| e == extension) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    pub fn render_index(&self, stems: &[String]) -> String {
        let mut out = String::from(INDEX_HEADER);
        out.push('\n');
        for stem in stems {
            out.push_str(&self.config.entry_template.replace("{stem}", stem));
            out.push('\n');
        }
        out
    }

    /// Rewrite the index of one package. Returns the relative path if the
    /// file changed.
    fn regenerate_index(&self, package: &str) -> Result<Option<PathBuf>> {
        let sources_rel = self.package_dir(package).join(&self.config.sources_dir);
        let sources = self.root.join(&sources_rel);
        if !sources.is_dir() {
            clog_debug!("Package {} has no {}; skipping index", package, self.config.sources_dir);
            return Ok(None);
        }

        let content = self.render_index(&self.source_stems(&sources)?);
        let index_rel = sources_rel.join(&self.config.index_file);
        let index = self.root.join(&index_rel);
        if fs::read_to_string(&index).ok().as_deref() == Some(content.as_str()) {
            return Ok(None);
        }
        fs::write(&index, content)?;
        Ok(Some(index_rel))
    }

    /// Append the index import to a package's setup file if it is missing.
    fn patch_setup(&self, package: &str) -> Result<Option<PathBuf>> {
        let setup_rel = self.package_dir(package).join(&self.config.setup_file);
        let setup = self.root.join(&setup_rel);
        if !setup.is_file() {
            return Ok(None);
        }
        let mut text = fs::read_to_string(&setup)?;
        if text.lines().any(|line| line.trim() == self.config.setup_import.trim()) {
            return Ok(None);
        }
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.config.setup_import);
        text.push('\n');
        fs::write(&setup, text)?;
        Ok(Some(setup_rel))
    }

    /// Regenerate every affected package. Returns changed paths relative to
    /// the repository root.
    pub fn regenerate(&self, packages: &BTreeSet<String>) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();
        for package in packages {
            if let Some(path) = self.regenerate_index(package)? {
                changed.push(path);
            }
            if let Some(path) = self.patch_setup(package)? {
                changed.push(path);
            }
        }
        if !changed.is_empty() {
            clog!("Regenerated {} registration file(s)", changed.len());
        }
        Ok(changed)
    }
}
