//! pip package scanner.
//!
//! Walks every `site-packages` / `dist-packages` directory in the image
//! root, reading `*.dist-info/METADATA` and `*.egg-info/PKG-INFO`
//! records. A distribution may be installed at several versions across
//! interpreter prefixes, so the native shape is multi-version; the
//! per-layer analyzer collapses to the newest version per name.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use shale_core::error::Result;
use walkdir::WalkDir;

use super::packages::{
    MultiPackageMap, MultiVersionScanner, PackageInfo, PackageMap, PackageScanner,
};
use crate::image::extract::dir_size;

#[derive(Debug, Default)]
pub struct PipScanner;

impl MultiVersionScanner for PipScanner {
    fn family(&self) -> &'static str {
        "pip"
    }

    fn scan_root(&self, root: &Path) -> Result<MultiPackageMap> {
        let mut packages = MultiPackageMap::new();
        for site_packages in find_site_packages(root) {
            scan_site_packages(&site_packages, &mut packages)?;
        }
        if packages.is_empty() {
            tracing::info!(root = %root.display(), "No python distributions found");
        }
        for infos in packages.values_mut() {
            infos.sort_by(|a, b| a.version.cmp(&b.version));
            infos.dedup_by(|a, b| a.version == b.version);
        }
        Ok(packages)
    }
}

impl PackageScanner for PipScanner {
    fn family(&self) -> &'static str {
        "pip"
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

/// Locate package directories: `**/site-packages` and `**/dist-packages`.
fn find_site_packages(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_dir()
                && matches!(
                    entry.file_name().to_str(),
                    Some("site-packages") | Some("dist-packages")
                )
        })
        .map(|entry| entry.into_path())
        .collect();
    dirs.sort();
    dirs
}

fn scan_site_packages(site_packages: &Path, packages: &mut MultiPackageMap) -> Result<()> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(site_packages)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    children.sort();

    for child in children {
        let Some(dir_name) = child.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let metadata_path = if dir_name.ends_with(".dist-info") {
            child.join("METADATA")
        } else if dir_name.ends_with(".egg-info") {
            if child.is_dir() {
                child.join("PKG-INFO")
            } else {
                // egg-info can be a single metadata file
                child.clone()
            }
        } else {
            continue;
        };

        if !metadata_path.is_file() {
            continue;
        }
        let Some((name, version)) = parse_metadata(&metadata_path)? else {
            tracing::warn!(path = %metadata_path.display(), "Distribution metadata without name/version");
            continue;
        };

        let size = distribution_size(site_packages, &child, &name);
        packages
            .entry(name)
            .or_default()
            .push(PackageInfo { version, size });
    }
    Ok(())
}

/// Read `Name:` and `Version:` from the metadata header block.
fn parse_metadata(path: &Path) -> Result<Option<(String, String)>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut name = None;
    let mut version = None;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            // Headers end at the first blank line
            break;
        }
        if let Some(value) = line.strip_prefix("Name: ") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Version: ") {
            version = Some(value.trim().to_string());
        }
        if name.is_some() && version.is_some() {
            break;
        }
    }

    Ok(name.zip(version))
}

/// On-disk size: the importable package directory when present, the
/// metadata directory otherwise.
fn distribution_size(site_packages: &Path, metadata_dir: &Path, name: &str) -> i64 {
    let top_level = site_packages.join(name.replace('-', "_"));
    if top_level.is_dir() {
        dir_size(&top_level) as i64
    } else if metadata_dir.is_dir() {
        dir_size(metadata_dir) as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::diff::multi_version_diff;
    use tempfile::TempDir;

    fn add_dist_info(site_packages: &Path, name: &str, version: &str, payload: usize) {
        let dist_info = site_packages.join(format!("{}-{}.dist-info", name, version));
        std::fs::create_dir_all(&dist_info).unwrap();
        std::fs::write(
            dist_info.join("METADATA"),
            format!("Metadata-Version: 2.1\nName: {}\nVersion: {}\n\nBody.\n", name, version),
        )
        .unwrap();

        let pkg_dir = site_packages.join(name.replace('-', "_"));
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("__init__.py"), vec![b'#'; payload]).unwrap();
    }

    #[test]
    fn test_scan_dist_info() {
        let tmp = TempDir::new().unwrap();
        let sp = tmp.path().join("usr/lib/python3.11/site-packages");
        std::fs::create_dir_all(&sp).unwrap();
        add_dist_info(&sp, "requests", "2.32.0", 64);

        let packages = MultiVersionScanner::scan_root(&PipScanner, tmp.path()).unwrap();
        assert_eq!(packages["requests"].len(), 1);
        assert_eq!(packages["requests"][0].version, "2.32.0");
        assert_eq!(packages["requests"][0].size, 64);
    }

    #[test]
    fn test_scan_egg_info_file() {
        let tmp = TempDir::new().unwrap();
        let sp = tmp.path().join("usr/lib/python2.7/dist-packages");
        std::fs::create_dir_all(&sp).unwrap();
        std::fs::write(
            sp.join("legacy.egg-info"),
            "Name: legacy\nVersion: 0.9\n\n",
        )
        .unwrap();

        let packages = MultiVersionScanner::scan_root(&PipScanner, tmp.path()).unwrap();
        assert_eq!(packages["legacy"][0].version, "0.9");
    }

    #[test]
    fn test_multiple_site_packages_multi_version() {
        // requests at two versions under two interpreter prefixes
        let tmp = TempDir::new().unwrap();
        let sp1 = tmp.path().join("usr/lib/python3.10/site-packages");
        let sp2 = tmp.path().join("usr/lib/python3.11/site-packages");
        std::fs::create_dir_all(&sp1).unwrap();
        std::fs::create_dir_all(&sp2).unwrap();
        add_dist_info(&sp1, "requests", "2.31.0", 10);
        add_dist_info(&sp2, "requests", "2.32.0", 10);

        let packages = MultiVersionScanner::scan_root(&PipScanner, tmp.path()).unwrap();
        let versions: Vec<_> = packages["requests"].iter().map(|i| i.version.as_str()).collect();
        assert_eq!(versions, vec!["2.31.0", "2.32.0"]);
    }

    #[test]
    fn test_multi_version_pip_diff_scenario() {
        // Image A holds requests 2.31.0 and 2.32.0, image B only 2.32.0:
        // the stale version is image1-only
        let tmp = TempDir::new().unwrap();

        let root_a = tmp.path().join("a");
        let sp1 = root_a.join("usr/lib/python3.10/site-packages");
        let sp2 = root_a.join("usr/lib/python3.11/site-packages");
        std::fs::create_dir_all(&sp1).unwrap();
        std::fs::create_dir_all(&sp2).unwrap();
        add_dist_info(&sp1, "requests", "2.31.0", 10);
        add_dist_info(&sp2, "requests", "2.32.0", 10);

        let root_b = tmp.path().join("b");
        let sp = root_b.join("usr/lib/python3.11/site-packages");
        std::fs::create_dir_all(&sp).unwrap();
        add_dist_info(&sp, "requests", "2.32.0", 10);

        let a = MultiVersionScanner::scan_root(&PipScanner, &root_a).unwrap();
        let b = MultiVersionScanner::scan_root(&PipScanner, &root_b).unwrap();
        let diff = multi_version_diff(&a, &b);

        assert_eq!(diff.image1_only["requests"].len(), 1);
        assert_eq!(diff.image1_only["requests"][0].version, "2.31.0");
        assert!(diff.image2_only.is_empty());
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn test_no_python_is_empty() {
        let tmp = TempDir::new().unwrap();
        let packages = MultiVersionScanner::scan_root(&PipScanner, tmp.path()).unwrap();
        assert!(packages.is_empty());
    }

    #[test]
    fn test_single_version_view_takes_newest() {
        let tmp = TempDir::new().unwrap();
        let sp1 = tmp.path().join("opt/py/site-packages");
        let sp2 = tmp.path().join("usr/lib/python3/site-packages");
        std::fs::create_dir_all(&sp1).unwrap();
        std::fs::create_dir_all(&sp2).unwrap();
        add_dist_info(&sp1, "click", "8.0.0", 5);
        add_dist_info(&sp2, "click", "8.1.7", 5);

        let packages = PackageScanner::scan_root(&PipScanner, tmp.path()).unwrap();
        assert_eq!(packages["click"].version, "8.1.7");
    }
}
