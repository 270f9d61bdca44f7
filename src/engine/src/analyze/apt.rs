//! dpkg/apt package scanner.
//!
//! Reads `var/lib/dpkg/status` stanzas. `Installed-Size` is reported in
//! kilobytes by dpkg and converted to bytes at ingest.

use std::io::{BufRead, BufReader};
use std::path::Path;

use shale_core::error::Result;

use super::packages::{PackageInfo, PackageMap, PackageScanner};

const DPKG_STATUS_FILE: &str = "var/lib/dpkg/status";

#[derive(Debug, Default)]
pub struct AptScanner;

impl PackageScanner for AptScanner {
    fn family(&self) -> &'static str {
        "apt"
    }

    fn scan_root(&self, root: &Path) -> Result<PackageMap> {
        let mut packages = PackageMap::new();
        let status_path = root.join(DPKG_STATUS_FILE);
        if !status_path.is_file() {
            tracing::info!(root = %root.display(), "No dpkg status file, reporting no apt packages");
            return Ok(packages);
        }

        let reader = BufReader::new(std::fs::File::open(&status_path)?);
        let mut current: Option<String> = None;
        let mut version = String::new();
        let mut size: i64 = 0;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                flush(&mut packages, &mut current, &mut version, &mut size);
                continue;
            }
            if let Some(value) = line.strip_prefix("Package: ") {
                flush(&mut packages, &mut current, &mut version, &mut size);
                current = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Version: ") {
                version = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("Installed-Size: ") {
                match value.trim().parse::<i64>() {
                    // dpkg reports kilobytes
                    Ok(kb) => size = kb * 1024,
                    Err(e) => {
                        tracing::error!(package = ?current, error = %e, "Bad Installed-Size field");
                        size = -1;
                    }
                }
            }
        }
        flush(&mut packages, &mut current, &mut version, &mut size);

        Ok(packages)
    }
}

fn flush(packages: &mut PackageMap, current: &mut Option<String>, version: &mut String, size: &mut i64) {
    if let Some(name) = current.take() {
        packages.insert(
            name,
            PackageInfo {
                version: std::mem::take(version),
                size: std::mem::replace(size, 0),
            },
        );
    } else {
        version.clear();
        *size = 0;
    }
}
