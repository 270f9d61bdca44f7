//! apk package scanner.
//!
//! Two databases exist in Alpine images. The installed database
//! (`lib/apk/db/installed`, colon-keyed records with sizes) is preferred;
//! the world file (`etc/apk/world`, `name=version` lines without sizes)
//! is the fallback when only it exists.

use std::io::{BufRead, BufReader};
use std::path::Path;

use shale_core::error::Result;

use super::packages::{PackageInfo, PackageMap, PackageScanner};

const APK_INSTALLED_FILE: &str = "lib/apk/db/installed";
const APK_WORLD_FILE: &str = "etc/apk/world";

#[derive(Debug, Default)]
pub struct ApkScanner;

impl PackageScanner for ApkScanner {
    fn family(&self) -> &'static str {
        "apk"
    }

    fn scan_root(&self, root: &Path) -> Result<PackageMap> {
        let installed = root.join(APK_INSTALLED_FILE);
        if installed.is_file() {
            return read_installed_file(&installed);
        }
        let world = root.join(APK_WORLD_FILE);
        if world.is_file() {
            tracing::debug!(root = %root.display(), "No apk installed db, reading world file");
            return read_world_file(&world);
        }
        tracing::info!(root = %root.display(), "No apk database, reporting no apk packages");
        Ok(PackageMap::new())
    }
}

/// Parse the colon-keyed installed database: `P:` name, `V:` version,
/// `I:` installed size in bytes. Records are blank-line separated.
fn read_installed_file(path: &Path) -> Result<PackageMap> {
    let mut packages = PackageMap::new();
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut current = String::new();

    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "P" => {
                current = value.to_string();
                packages.entry(current.clone()).or_insert(PackageInfo {
                    version: String::new(),
                    size: 0,
                });
            }
            "V" => {
                if let Some(info) = packages.get_mut(&current) {
                    info.version = value.to_string();
                }
            }
            "I" => {
                if let Some(info) = packages.get_mut(&current) {
                    info.size = value.parse::<i64>().unwrap_or_else(|e| {
                        tracing::error!(package = %current, error = %e, "Bad apk size field");
                        -1
                    });
                }
            }
            _ => {}
        }
    }

    Ok(packages)
}

/// Parse the world file: one `name=version` (or bare `name`) per line.
fn read_world_file(path: &Path) -> Result<PackageMap> {
    let mut packages = PackageMap::new();
    let reader = BufReader::new(std::fs::File::open(path)?);

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, version) = match line.split_once('=') {
            Some((name, version)) => (name, version),
            None => (line, ""),
        };
        packages.insert(
            name.to_string(),
            PackageInfo {
                version: version.to_string(),
                size: 0,
            },
        );
    }

    Ok(packages)
}
