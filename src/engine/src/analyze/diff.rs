//! The package diff algebra.
//!
//! Order-independent set difference over package maps: the result depends
//! only on the packages present, never on input ordering. Single-version
//! maps diff name by name; multi-version maps diff on (name, version)
//! pairs with the modified bucket collapsed back onto names; per-layer
//! views diff aligned layer pairs, reporting surplus layers wholesale.

use serde::Serialize;

use super::packages::{MultiPackageMap, PackageInfo, PackageMap};

/// Diff of two single-version package maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackageDiff {
    #[serde(rename = "Image1Only")]
    pub image1_only: PackageMap,
    #[serde(rename = "Image2Only")]
    pub image2_only: PackageMap,
    #[serde(rename = "Modified")]
    pub modified: Vec<ModifiedPackage>,
}

/// A package present in both images with differing attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedPackage {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image1")]
    pub info1: PackageInfo,
    #[serde(rename = "Image2")]
    pub info2: PackageInfo,
}

impl PackageDiff {
    pub fn is_empty(&self) -> bool {
        self.image1_only.is_empty() && self.image2_only.is_empty() && self.modified.is_empty()
    }
}

/// Classify packages as image1-only, image2-only, or modified.
///
/// A modified entry appears iff the name exists on both sides and any
/// tracked attribute differs.
pub fn single_version_diff(packages1: &PackageMap, packages2: &PackageMap) -> PackageDiff {
    let mut diff = PackageDiff::default();

    for (name, info1) in packages1 {
        match packages2.get(name) {
            None => {
                diff.image1_only.insert(name.clone(), info1.clone());
            }
            Some(info2) if info1 != info2 => {
                diff.modified.push(ModifiedPackage {
                    name: name.clone(),
                    info1: info1.clone(),
                    info2: info2.clone(),
                });
            }
            Some(_) => {}
        }
    }

    for (name, info2) in packages2 {
        if !packages1.contains_key(name) {
            diff.image2_only.insert(name.clone(), info2.clone());
        }
    }

    // BTreeMap iteration is already sorted; the modified list follows
    diff.modified.sort_by(|a, b| a.name.cmp(&b.name));
    diff
}

/// Diff of two multi-version package maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MultiPackageDiff {
    /// Versions present only in image1, keyed by package name
    #[serde(rename = "Image1Only")]
    pub image1_only: MultiPackageMap,
    /// Versions present only in image2, keyed by package name
    #[serde(rename = "Image2Only")]
    pub image2_only: MultiPackageMap,
    /// Names on both sides where a shared version differs in attributes;
    /// carries the full version list per side
    #[serde(rename = "Modified")]
    pub modified: Vec<MultiModifiedPackage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiModifiedPackage {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image1")]
    pub info1: Vec<PackageInfo>,
    #[serde(rename = "Image2")]
    pub info2: Vec<PackageInfo>,
}

impl MultiPackageDiff {
    pub fn is_empty(&self) -> bool {
        self.image1_only.is_empty() && self.image2_only.is_empty() && self.modified.is_empty()
    }
}

/// Multi-version diff, keyed on (name, version).
///
/// A version installed on one side only lands in the asymmetric bucket
/// even when the name exists on both sides. Modified entries cover names
/// where the *same* version carries different attributes.
pub fn multi_version_diff(packages1: &MultiPackageMap, packages2: &MultiPackageMap) -> MultiPackageDiff {
    let mut diff = MultiPackageDiff::default();

    for (name, infos1) in packages1 {
        let infos2 = packages2.get(name);

        let only1: Vec<PackageInfo> = infos1
            .iter()
            .filter(|info| {
                infos2
                    .map(|other| !other.iter().any(|o| o.version == info.version))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !only1.is_empty() {
            diff.image1_only.insert(name.clone(), sorted(only1));
        }

        if let Some(infos2) = infos2 {
            let shared_changed = infos1.iter().any(|info| {
                infos2
                    .iter()
                    .any(|other| other.version == info.version && other != info)
            });
            if shared_changed {
                diff.modified.push(MultiModifiedPackage {
                    name: name.clone(),
                    info1: sorted(infos1.clone()),
                    info2: sorted(infos2.clone()),
                });
            }
        }
    }

    for (name, infos2) in packages2 {
        let infos1 = packages1.get(name);
        let only2: Vec<PackageInfo> = infos2
            .iter()
            .filter(|info| {
                infos1
                    .map(|other| !other.iter().any(|o| o.version == info.version))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !only2.is_empty() {
            diff.image2_only.insert(name.clone(), sorted(only2));
        }
    }

    diff.modified.sort_by(|a, b| a.name.cmp(&b.name));
    diff
}

fn sorted(mut infos: Vec<PackageInfo>) -> Vec<PackageInfo> {
    infos.sort_by(|a, b| a.version.cmp(&b.version).then(a.size.cmp(&b.size)));
    infos
}

/// Per-layer diff: aligned layer pairs are diffed index by index; layers
/// past the shorter side are reported wholesale in the asymmetric bucket.
pub fn layered_diff(layers1: &[PackageMap], layers2: &[PackageMap]) -> Vec<PackageDiff> {
    let aligned = layers1.len().min(layers2.len());
    let mut diffs = Vec::with_capacity(layers1.len().max(layers2.len()));

    for index in 0..aligned {
        diffs.push(single_version_diff(&layers1[index], &layers2[index]));
    }
    for packages in &layers1[aligned..] {
        diffs.push(PackageDiff {
            image1_only: packages.clone(),
            ..Default::default()
        });
    }
    for packages in &layers2[aligned..] {
        diffs.push(PackageDiff {
            image2_only: packages.clone(),
            ..Default::default()
        });
    }
    diffs
}
