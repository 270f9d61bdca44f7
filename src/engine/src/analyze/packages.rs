//! Package data model and the shared analyzer backbones.
//!
//! Package-style analyzers supply only a scanner (how to read one package
//! database); the backbones here turn a scanner into a full [`Analyzer`]
//! for the whole-image, multi-version, and per-layer shapes. A missing
//! package database is an empty map, never an error.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use shale_core::error::{Result, ShaleError};

use super::diff::{layered_diff, multi_version_diff, single_version_diff};
use super::Analyzer;
use crate::image::Image;
use crate::report::{AnalyzeResult, DiffResult, Report};

/// Version and installed size of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(rename = "Version")]
    pub version: String,
    /// Installed size in bytes. Scanners whose database reports
    /// kilobytes convert at ingest.
    #[serde(rename = "Size")]
    pub size: i64,
}

impl PackageInfo {
    pub fn new(version: impl Into<String>, size: i64) -> Self {
        Self {
            version: version.into(),
            size,
        }
    }
}

/// Package name → info. Sorted keys give deterministic output.
pub type PackageMap = BTreeMap<String, PackageInfo>;

/// Package name → every installed version, for managers that allow
/// side-by-side installs (pip, node).
pub type MultiPackageMap = BTreeMap<String, Vec<PackageInfo>>;

/// Reads a single-version package database from a filesystem root.
pub trait PackageScanner: Send + Sync {
    /// The analyzer name this scanner backs (e.g. "apt").
    fn family(&self) -> &'static str;

    /// Read packages from one extracted filesystem root.
    fn scan_root(&self, root: &Path) -> Result<PackageMap>;

    /// Read packages from a whole image. The default reads the flattened
    /// root; scanners with richer strategies (rpm) override this.
    fn scan_image(&self, image: &Image) -> Result<PackageMap> {
        self.scan_root(&image.fs_path)
    }
}

/// Reads a multi-version package database from a filesystem root.
pub trait MultiVersionScanner: Send + Sync {
    /// The analyzer name this scanner backs (e.g. "pip").
    fn family(&self) -> &'static str;

    fn scan_root(&self, root: &Path) -> Result<MultiPackageMap>;

    fn scan_image(&self, image: &Image) -> Result<MultiPackageMap> {
        self.scan_root(&image.fs_path)
    }
}

/// Whole-image analyzer over a single-version scanner.
pub struct PackageAnalyzer<S: PackageScanner> {
    scanner: S,
}

impl<S: PackageScanner> PackageAnalyzer<S> {
    pub fn new(scanner: S) -> Self {
        Self { scanner }
    }
}

impl<S: PackageScanner> Analyzer for PackageAnalyzer<S> {
    fn name(&self) -> &'static str {
        self.scanner.family()
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        let packages = self.scanner.scan_image(image)?;
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::Packages(packages),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        let packages1 = self.scanner.scan_image(image1)?;
        let packages2 = self.scanner.scan_image(image2)?;
        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::PackageDiff(single_version_diff(&packages1, &packages2)),
        ))
    }
}

/// Whole-image analyzer over a multi-version scanner.
pub struct MultiVersionAnalyzer<S: MultiVersionScanner> {
    scanner: S,
}

impl<S: MultiVersionScanner> MultiVersionAnalyzer<S> {
    pub fn new(scanner: S) -> Self {
        Self { scanner }
    }
}

impl<S: MultiVersionScanner> Analyzer for MultiVersionAnalyzer<S> {
    fn name(&self) -> &'static str {
        self.scanner.family()
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        let packages = self.scanner.scan_image(image)?;
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::MultiPackages(packages),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        let packages1 = self.scanner.scan_image(image1)?;
        let packages2 = self.scanner.scan_image(image2)?;
        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::MultiPackageDiff(multi_version_diff(&packages1, &packages2)),
        ))
    }
}

/// Per-layer analyzer over a single-version scanner.
pub struct LayeredPackageAnalyzer<S: PackageScanner> {
    scanner: S,
    name: &'static str,
}

impl<S: PackageScanner> LayeredPackageAnalyzer<S> {
    pub fn new(scanner: S, name: &'static str) -> Self {
        Self { scanner, name }
    }

    fn scan_layers(&self, image: &Image) -> Result<Vec<PackageMap>> {
        let mut maps = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            let root = layer.fs_path.as_ref().ok_or_else(|| {
                ShaleError::Internal(format!(
                    "analyzer '{}' requires materialized layers for {}",
                    self.name, image.source
                ))
            })?;
            maps.push(self.scanner.scan_root(root)?);
        }
        Ok(maps)
    }
}

impl<S: PackageScanner> Analyzer for LayeredPackageAnalyzer<S> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name,
            &image.source,
            Report::LayeredPackages(self.scan_layers(image)?),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        let layers1 = self.scan_layers(image1)?;
        let layers2 = self.scan_layers(image2)?;
        Ok(DiffResult::new(
            self.name,
            &image1.source,
            &image2.source,
            Report::LayeredPackageDiff(layered_diff(&layers1, &layers2)),
        ))
    }
}
