//! Result envelopes.
//!
//! Every analyzer returns its payload wrapped in an envelope carrying
//! the analyzer name and the image reference(s). The payload is a tagged
//! variant; rendering dispatches on the tag and never re-reads image
//! state. JSON output uses sorted containers throughout, so two runs
//! over the same image serialize byte-identically.

use std::fmt::Write as _;

use serde::Serialize;
use shale_core::error::Result;

use crate::analyze::diff::{MultiPackageDiff, PackageDiff};
use crate::analyze::file::{FileDiff, FileEntry};
use crate::analyze::history::HistoryDiff;
use crate::analyze::metadata::MetadataDiff;
use crate::analyze::packages::{MultiPackageMap, PackageMap};
use crate::analyze::size::{LayerSizeDiff, LayerSizeEntry, SizeDiff, SizeReport};
use crate::image::ConfigSummary;

/// Analyzer payload, one variant per result shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Report {
    Packages(PackageMap),
    MultiPackages(MultiPackageMap),
    LayeredPackages(Vec<PackageMap>),
    PackageDiff(PackageDiff),
    MultiPackageDiff(MultiPackageDiff),
    LayeredPackageDiff(Vec<PackageDiff>),
    Files(Vec<FileEntry>),
    FileDiff(FileDiff),
    LayeredFiles(Vec<Vec<FileEntry>>),
    LayeredFileDiff(Vec<FileDiff>),
    History(Vec<String>),
    HistoryDiff(HistoryDiff),
    Metadata(ConfigSummary),
    MetadataDiff(MetadataDiff),
    Size(SizeReport),
    SizeDiff(SizeDiff),
    LayerSizes(Vec<LayerSizeEntry>),
    LayerSizeDiff(LayerSizeDiff),
}

/// Envelope for a whole-image analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "AnalyzeType")]
    pub analyze_type: String,
    #[serde(rename = "Analysis")]
    pub analysis: Report,
}

impl AnalyzeResult {
    pub fn new(analyzer: &str, image: &str, analysis: Report) -> Self {
        Self {
            image: image.to_string(),
            analyze_type: analyzer.to_string(),
            analysis,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "-----{}-----", self.analyze_type);
        let _ = writeln!(out);
        let _ = writeln!(out, "Image: {}", self.image);
        self.analysis.render_text(&self.image, "", &mut out);
        out
    }
}

/// Envelope for a pairwise diff.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    #[serde(rename = "Image1")]
    pub image1: String,
    #[serde(rename = "Image2")]
    pub image2: String,
    #[serde(rename = "DiffType")]
    pub diff_type: String,
    #[serde(rename = "Diff")]
    pub diff: Report,
}

impl DiffResult {
    pub fn new(analyzer: &str, image1: &str, image2: &str, diff: Report) -> Self {
        Self {
            image1: image1.to_string(),
            image2: image2.to_string(),
            diff_type: analyzer.to_string(),
            diff,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "-----{}-----", self.diff_type);
        let _ = writeln!(out);
        self.diff.render_text(&self.image1, &self.image2, &mut out);
        out
    }
}

impl Report {
    /// Render the payload for the text formatter. `image2` is empty for
    /// analysis payloads.
    fn render_text(&self, image1: &str, image2: &str, out: &mut String) {
        match self {
            Report::Packages(packages) => render_package_map(packages, out),
            Report::MultiPackages(packages) => {
                for (name, infos) in packages {
                    for info in infos {
                        let _ = writeln!(out, "{}\t{}\t{}", name, info.version, info.size);
                    }
                }
            }
            Report::LayeredPackages(layers) => {
                for (index, packages) in layers.iter().enumerate() {
                    let _ = writeln!(out, "Layer {}:", index);
                    render_package_map(packages, out);
                }
            }
            Report::PackageDiff(diff) => render_package_diff(diff, image1, image2, out),
            Report::MultiPackageDiff(diff) => {
                let _ = writeln!(out, "Packages found only in {}:", image1);
                for (name, infos) in &diff.image1_only {
                    for info in infos {
                        let _ = writeln!(out, "\t{}\t{}\t{}", name, info.version, info.size);
                    }
                }
                let _ = writeln!(out, "Packages found only in {}:", image2);
                for (name, infos) in &diff.image2_only {
                    for info in infos {
                        let _ = writeln!(out, "\t{}\t{}\t{}", name, info.version, info.size);
                    }
                }
                let _ = writeln!(out, "Version differences:");
                for modified in &diff.modified {
                    let render = |infos: &[crate::analyze::packages::PackageInfo]| {
                        infos
                            .iter()
                            .map(|i| i.version.clone())
                            .collect::<Vec<_>>()
                            .join(", ")
                    };
                    let _ = writeln!(
                        out,
                        "\t{}\t[{}]\t[{}]",
                        modified.name,
                        render(&modified.info1),
                        render(&modified.info2)
                    );
                }
            }
            Report::LayeredPackageDiff(diffs) => {
                for (index, diff) in diffs.iter().enumerate() {
                    let _ = writeln!(out, "Layer {}:", index);
                    render_package_diff(diff, image1, image2, out);
                }
            }
            Report::Files(entries) => {
                for entry in entries {
                    let _ = writeln!(out, "{}\t{}", entry.path, entry.size);
                }
            }
            Report::FileDiff(diff) => render_file_diff(diff, image1, image2, out),
            Report::LayeredFiles(layers) => {
                for (index, entries) in layers.iter().enumerate() {
                    let _ = writeln!(out, "Layer {}:", index);
                    for entry in entries {
                        let _ = writeln!(out, "\t{}\t{}", entry.path, entry.size);
                    }
                }
            }
            Report::LayeredFileDiff(diffs) => {
                for (index, diff) in diffs.iter().enumerate() {
                    let _ = writeln!(out, "Layer {}:", index);
                    render_file_diff(diff, image1, image2, out);
                }
            }
            Report::History(entries) => {
                for entry in entries {
                    let _ = writeln!(out, "{}", entry);
                }
            }
            Report::HistoryDiff(diff) => {
                let _ = writeln!(out, "History entries found only in {}:", image1);
                for entry in &diff.image1_only {
                    let _ = writeln!(out, "\t{}", entry);
                }
                let _ = writeln!(out, "History entries found only in {}:", image2);
                for entry in &diff.image2_only {
                    let _ = writeln!(out, "\t{}", entry);
                }
            }
            Report::Metadata(config) => {
                let _ = writeln!(out, "Entrypoint: {}", config.entrypoint.join(" "));
                let _ = writeln!(out, "Cmd: {}", config.cmd.join(" "));
                let _ = writeln!(out, "WorkingDir: {}", config.working_dir);
                for entry in &config.env {
                    let _ = writeln!(out, "Env: {}", entry);
                }
                for port in &config.exposed_ports {
                    let _ = writeln!(out, "ExposedPort: {}", port);
                }
                for volume in &config.volumes {
                    let _ = writeln!(out, "Volume: {}", volume);
                }
                for (key, value) in &config.labels {
                    let _ = writeln!(out, "Label: {}={}", key, value);
                }
            }
            Report::MetadataDiff(diff) => {
                for field in &diff.0 {
                    let _ = writeln!(out, "{}:", field.field);
                    for value in &field.image1_only {
                        let _ = writeln!(out, "\tonly in {}: {}", image1, value);
                    }
                    for value in &field.image2_only {
                        let _ = writeln!(out, "\tonly in {}: {}", image2, value);
                    }
                    for change in &field.changed {
                        let _ = writeln!(
                            out,
                            "\t{}: {} -> {}",
                            change.name, change.value1, change.value2
                        );
                    }
                }
            }
            Report::Size(report) => {
                let _ = writeln!(out, "Size: {}", report.size);
            }
            Report::SizeDiff(diff) => {
                let _ = writeln!(out, "{}: {}", image1, diff.size1);
                let _ = writeln!(out, "{}: {}", image2, diff.size2);
            }
            Report::LayerSizes(entries) => {
                for entry in entries {
                    let _ = writeln!(out, "{}\t{}\t{}", entry.index, entry.digest, entry.size);
                }
            }
            Report::LayerSizeDiff(diff) => {
                for (index, pair) in diff.aligned.iter().enumerate() {
                    let _ = writeln!(out, "Layer {}: {} -> {}", index, pair.size1, pair.size2);
                }
                for entry in &diff.image1_only {
                    let _ = writeln!(out, "Layer {} only in {}: {}", entry.index, image1, entry.size);
                }
                for entry in &diff.image2_only {
                    let _ = writeln!(out, "Layer {} only in {}: {}", entry.index, image2, entry.size);
                }
            }
        }
    }
}

fn render_package_map(packages: &PackageMap, out: &mut String) {
    for (name, info) in packages {
        let _ = writeln!(out, "{}\t{}\t{}", name, info.version, info.size);
    }
}

fn render_package_diff(diff: &PackageDiff, image1: &str, image2: &str, out: &mut String) {
    let _ = writeln!(out, "Packages found only in {}:", image1);
    for (name, info) in &diff.image1_only {
        let _ = writeln!(out, "\t{}\t{}\t{}", name, info.version, info.size);
    }
    let _ = writeln!(out, "Packages found only in {}:", image2);
    for (name, info) in &diff.image2_only {
        let _ = writeln!(out, "\t{}\t{}\t{}", name, info.version, info.size);
    }
    let _ = writeln!(out, "Version differences:");
    for modified in &diff.modified {
        let _ = writeln!(
            out,
            "\t{}\t{} ({})\t{} ({})",
            modified.name,
            modified.info1.version,
            modified.info1.size,
            modified.info2.version,
            modified.info2.size
        );
    }
}

fn render_file_diff(diff: &FileDiff, image1: &str, image2: &str, out: &mut String) {
    let _ = writeln!(out, "Files found only in {}:", image1);
    for entry in &diff.image1_only {
        let _ = writeln!(out, "\t{}\t{}", entry.path, entry.size);
    }
    let _ = writeln!(out, "Files found only in {}:", image2);
    for entry in &diff.image2_only {
        let _ = writeln!(out, "\t{}\t{}", entry.path, entry.size);
    }
    let _ = writeln!(out, "Modified files:");
    for modified in &diff.modified {
        let _ = writeln!(
            out,
            "\t{}\t{} -> {}",
            modified.path, modified.entry1.size, modified.entry2.size
        );
    }
}
