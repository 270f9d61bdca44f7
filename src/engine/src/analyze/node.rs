//! node package scanner.
//!
//! Finds every module installed under a `node_modules` directory
//! (including scoped `@org/name` modules) by reading its `package.json`.
//! Nested dependency trees legitimately install the same module at
//! several versions, so the native shape is multi-version.

use std::path::Path;

use serde::Deserialize;
use shale_core::error::Result;
use walkdir::WalkDir;

use super::packages::{
    MultiPackageMap, MultiVersionScanner, PackageInfo, PackageMap, PackageScanner,
};
use crate::image::extract::dir_size;

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Default)]
pub struct NodeScanner;

impl MultiVersionScanner for NodeScanner {
    fn family(&self) -> &'static str {
        "node"
    }

    fn scan_root(&self, root: &Path) -> Result<MultiPackageMap> {
        let mut packages = MultiPackageMap::new();

        let mut manifests: Vec<_> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.file_name() == "package.json"
                    && is_module_manifest(entry.path())
            })
            .map(|entry| entry.into_path())
            .collect();
        manifests.sort();

        for manifest in manifests {
            let content = match std::fs::read_to_string(&manifest) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(path = %manifest.display(), error = %e, "Unreadable package.json");
                    continue;
                }
            };
            let parsed: PackageJson = match serde_json::from_str(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(path = %manifest.display(), error = %e, "Malformed package.json");
                    continue;
                }
            };
            let (Some(name), Some(version)) = (parsed.name, parsed.version) else {
                continue;
            };

            let module_dir = manifest.parent().unwrap_or(root);
            packages.entry(name).or_default().push(PackageInfo {
                version,
                size: dir_size(module_dir) as i64,
            });
        }

        if packages.is_empty() {
            tracing::info!(root = %root.display(), "No node modules found");
        }
        for infos in packages.values_mut() {
            infos.sort_by(|a, b| a.version.cmp(&b.version));
            infos.dedup_by(|a, b| a.version == b.version);
        }
        Ok(packages)
    }
}

impl PackageScanner for NodeScanner {
    fn family(&self) -> &'static str {
        "node"
    }

    /// Single-version view: the newest version per name wins.
    fn scan_root(&self, root: &Path) -> Result<PackageMap> {
        let multi = MultiVersionScanner::scan_root(self, root)?;
        Ok(multi
            .into_iter()
            .filter_map(|(name, infos)| infos.into_iter().last().map(|info| (name, info)))
            .collect())
    }
}

/// True for `node_modules/<pkg>/package.json` and
/// `node_modules/@scope/<pkg>/package.json`, false for manifests nested
/// deeper inside a module's own tree.
fn is_module_manifest(path: &Path) -> bool {
    let Some(module_dir) = path.parent() else {
        return false;
    };
    let Some(parent) = module_dir.parent() else {
        return false;
    };
    if parent.file_name().map(|n| n == "node_modules").unwrap_or(false) {
        return true;
    }
    // Scoped module: parent is "@scope" directly under node_modules
    let scoped = parent
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('@'))
        .unwrap_or(false);
    scoped
        && parent
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == "node_modules")
            .unwrap_or(false)
}
