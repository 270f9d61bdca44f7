//! rpm package scanner.
//!
//! The rpm database is a binary format read through the `rpm` tool. Two
//! strategies, in order:
//!
//! 1. Host query: resolve `%_dbpath` from `usr/lib/rpm/macros` in the
//!    image root (probing the common locations when no macros file
//!    exists) and run the host `rpm` binary with `--root`/`--dbpath`.
//! 2. Daemon fallback: load the image into the local daemon under the
//!    [`DaemonGate`], run the query command as the container entrypoint,
//!    and parse captured stdout.
//!
//! An image without an rpm binary reports an empty map; the fallback is
//! opportunistic, not an error path.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use shale_core::error::{Result, ShaleError};

use super::packages::{PackageInfo, PackageMap, PackageScanner};
use crate::daemon::gate::DaemonGate;
use crate::daemon::{generate_query_tag, DaemonClient};
use crate::image::Image;

/// Query command run against an image database or as a container
/// entrypoint. Tab-delimited name, version-release, size.
const RPM_QUERY: [&str; 6] = [
    "rpm",
    "--nodigest",
    "--nosignature",
    "-qa",
    "--qf",
    "%{NAME}\t%{VERSION}-%{RELEASE}\t%{SIZE}\n",
];

/// Macros file consulted for the database location.
const RPM_MACROS_FILE: &str = "usr/lib/rpm/macros";

/// Database locations probed when no macros file defines `%_dbpath`.
const RPM_DEFAULT_DB_PATHS: [&str; 2] = ["var/lib/rpm", "usr/lib/sysimage/rpm"];

pub struct RpmScanner {
    daemon: Arc<dyn DaemonClient>,
    gate: DaemonGate,
}

impl RpmScanner {
    pub fn new(daemon: Arc<dyn DaemonClient>) -> Self {
        Self {
            daemon,
            gate: DaemonGate::new(),
        }
    }

    /// Scanner with a custom gate. Test hook.
    pub fn with_gate(daemon: Arc<dyn DaemonClient>, gate: DaemonGate) -> Self {
        Self { daemon, gate }
    }

    fn query_fs(&self, root: &Path) -> Result<PackageMap> {
        let db_path = rpm_db_path(root)?;
        query_with_host_rpm(root, &db_path)
    }

    /// Load the image into the daemon and run the query inside it.
    fn query_daemon(&self, image: &Image) -> Result<PackageMap> {
        let Some(layout_dir) = image.layout_dir.as_deref() else {
            tracing::info!(
                source = %image.source,
                "No daemon-loadable archive for image, reporting no rpm packages"
            );
            return Ok(PackageMap::new());
        };

        let archive = archive_from_dir(layout_dir)?;
        let result = self.query_daemon_archive(&archive, &image.source);
        let _ = std::fs::remove_file(&archive);
        result
    }

    fn query_daemon_archive(&self, archive: &Path, source: &str) -> Result<PackageMap> {
        // The gate covers load-and-tag only; the container run happens
        // outside it.
        let tag = {
            let _guard = self.gate.acquire()?;
            let tag = generate_query_tag(self.daemon.as_ref());
            self.daemon.load(archive, &tag)?;
            tag
        };

        tracing::info!(source = %source, tag = %tag, "Querying rpm database in container");
        let query: Vec<String> = RPM_QUERY.iter().map(|s| s.to_string()).collect();
        let output = self.daemon.run_capture(&tag, &query);

        if let Err(e) = self.daemon.remove_image(&tag) {
            tracing::warn!(tag = %tag, error = %e, "Failed to remove temporary daemon image");
        }

        parse_package_data(&output?)
    }
}

impl PackageScanner for RpmScanner {
    fn family(&self) -> &'static str {
        "rpm"
    }

    /// Per-layer query through the host rpm binary. Layers without a
    /// readable database are empty.
    fn scan_root(&self, root: &Path) -> Result<PackageMap> {
        match rpm_db_path(root) {
            Ok(db_path) => query_with_host_rpm(root, &db_path),
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "No readable rpm database");
                Ok(PackageMap::new())
            }
        }
    }

    fn scan_image(&self, image: &Image) -> Result<PackageMap> {
        let root = &image.fs_path;
        if !root.join("bin/rpm").exists() && !root.join("usr/bin/rpm").exists() {
            tracing::info!(source = %image.source, "No rpm binary in image, reporting no rpm packages");
            return Ok(PackageMap::new());
        }

        match self.query_fs(root) {
            Ok(packages) => Ok(packages),
            Err(e) => {
                tracing::info!(
                    source = %image.source,
                    error = %e,
                    "Could not read rpm database from extracted filesystem, querying in container"
                );
                self.query_daemon(image)
            }
        }
    }
}

/// Resolve the rpm database directory relative to the image root.
fn rpm_db_path(root: &Path) -> Result<String> {
    let host_has_rpm = Command::new("rpm")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !host_has_rpm {
        return Err(ShaleError::Internal("no rpm binary on host".to_string()));
    }

    let macros_path = root.join(RPM_MACROS_FILE);
    if macros_path.is_file() {
        let content = std::fs::read_to_string(&macros_path)?;
        for line in content.lines() {
            let line = line.trim();
            // Looking for a definition like:
            // %_dbpath    %{_usr}/lib/sysimage/rpm
            if let Some(rest) = line.strip_prefix("%_dbpath") {
                let raw = rest.trim();
                if raw.is_empty() {
                    break;
                }
                let db_path = expand_rpm_macro(raw)?;
                let relative = db_path.trim_start_matches('/');
                if root.join(relative).is_dir() {
                    return Ok(relative.to_string());
                }
                return Err(ShaleError::Internal(format!(
                    "rpm database {} missing under image root",
                    db_path
                )));
            }
        }
    }

    for candidate in RPM_DEFAULT_DB_PATHS {
        let dir = root.join(candidate);
        if dir.is_dir() && dir.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            return Ok(candidate.to_string());
        }
    }

    Err(ShaleError::Internal(
        "could not locate rpm database in image root".to_string(),
    ))
}

/// Expand the handful of prefix macros seen in `%_dbpath` definitions,
/// deferring anything else to `rpm -E`.
fn expand_rpm_macro(value: &str) -> Result<String> {
    let expanded = value
        .replace("%{_usr}", "/usr")
        .replace("%{_var}", "/var")
        .replace("%{_prefix}", "/usr");
    if !expanded.contains('%') {
        return Ok(expanded);
    }

    let output = Command::new("rpm").args(["-E", value]).output()?;
    if !output.status.success() {
        return Err(ShaleError::Internal(format!(
            "rpm -E failed for {}",
            value
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run the host rpm binary against an extracted filesystem.
fn query_with_host_rpm(root: &Path, db_path: &str) -> Result<PackageMap> {
    let root = root.canonicalize()?;
    let output = Command::new(RPM_QUERY[0])
        .arg("--root")
        .arg(&root)
        .arg("--dbpath")
        .arg(format!("/{}", db_path.trim_start_matches('/')))
        .args(&RPM_QUERY[1..])
        .output()?;

    if !output.status.success() {
        return Err(ShaleError::SubprocessFailed {
            tool: "rpm".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_package_data(&String::from_utf8_lossy(&output.stdout))
}

/// Parse tab-delimited query output, one package per non-empty line.
fn parse_package_data(output: &str) -> Result<PackageMap> {
    let mut packages = PackageMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            if !line.is_empty() {
                tracing::error!(line = %line, "Unexpected rpm query output");
            }
            continue;
        }
        let size = fields[2].parse::<i64>().map_err(|_| {
            ShaleError::Internal(format!("bad rpm package size: {}", fields[2]))
        })?;
        packages.insert(
            fields[0].to_string(),
            PackageInfo {
                version: fields[1].to_string(),
                size,
            },
        );
    }
    Ok(packages)
}

/// Tar up a directory so the daemon can load it.
fn archive_from_dir(dir: &Path) -> Result<PathBuf> {
    let suffix: String = (&mut OsRng)
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let archive = std::env::temp_dir().join(format!("shale-load-{}.tar", suffix.to_lowercase()));
    let file = std::fs::File::create(&archive)?;
    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| ShaleError::Extraction(format!("failed to archive {}: {}", dir.display(), e)))?;
    builder
        .finish()
        .map_err(|e| ShaleError::Extraction(format!("failed to finish archive: {}", e)))?;
    Ok(archive)
}
