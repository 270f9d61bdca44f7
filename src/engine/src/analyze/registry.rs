//! The analyzer registry.
//!
//! A static table from case-insensitive analyzer name to constructor.
//! Adding an analyzer means adding a match arm; there is no discovery
//! mechanism. Unknown names fail before any image work begins.

use std::sync::Arc;

use shale_core::error::{Result, ShaleError};

use super::apk::ApkScanner;
use super::apt::AptScanner;
use super::file::{FileAnalyzer, LayerFileAnalyzer};
use super::history::HistoryAnalyzer;
use super::metadata::MetadataAnalyzer;
use super::node::NodeScanner;
use super::packages::{LayeredPackageAnalyzer, MultiVersionAnalyzer, PackageAnalyzer};
use super::pip::PipScanner;
use super::rpm::RpmScanner;
use super::size::{SizeAnalyzer, SizeLayerAnalyzer};
use super::Analyzer;
use crate::daemon::{DaemonClient, DockerCli};

/// Every registered analyzer name, lowercase.
pub const KNOWN_ANALYZERS: [&str; 16] = [
    "history",
    "metadata",
    "file",
    "layer",
    "size",
    "sizelayer",
    "apt",
    "aptlayer",
    "rpm",
    "rpmlayer",
    "apk",
    "apklayer",
    "pip",
    "piplayer",
    "node",
    "nodelayer",
];

/// Construct the analyzer registered under `name` (case-insensitive).
pub fn lookup(name: &str) -> Result<Box<dyn Analyzer>> {
    lookup_with_daemon(name, Arc::new(DockerCli))
}

/// Construct an analyzer with an explicit daemon client (the rpm family
/// needs one for its container fallback).
pub fn lookup_with_daemon(name: &str, daemon: Arc<dyn DaemonClient>) -> Result<Box<dyn Analyzer>> {
    let analyzer: Box<dyn Analyzer> = match name.to_ascii_lowercase().as_str() {
        "history" => Box::new(HistoryAnalyzer),
        "metadata" => Box::new(MetadataAnalyzer),
        "file" => Box::new(FileAnalyzer),
        "layer" => Box::new(LayerFileAnalyzer),
        "size" => Box::new(SizeAnalyzer),
        "sizelayer" => Box::new(SizeLayerAnalyzer),
        "apt" => Box::new(PackageAnalyzer::new(AptScanner)),
        "aptlayer" => Box::new(LayeredPackageAnalyzer::new(AptScanner, "aptlayer")),
        "rpm" => Box::new(PackageAnalyzer::new(RpmScanner::new(daemon))),
        "rpmlayer" => Box::new(LayeredPackageAnalyzer::new(RpmScanner::new(daemon), "rpmlayer")),
        "apk" => Box::new(PackageAnalyzer::new(ApkScanner)),
        "apklayer" => Box::new(LayeredPackageAnalyzer::new(ApkScanner, "apklayer")),
        "pip" => Box::new(MultiVersionAnalyzer::new(PipScanner)),
        "piplayer" => Box::new(LayeredPackageAnalyzer::new(PipScanner, "piplayer")),
        "node" => Box::new(MultiVersionAnalyzer::new(NodeScanner)),
        "nodelayer" => Box::new(LayeredPackageAnalyzer::new(NodeScanner, "nodelayer")),
        _ => return Err(ShaleError::UnknownAnalyzer(name.to_string())),
    };
    Ok(analyzer)
}

/// Resolve every requested name, failing fast on the first unknown one.
pub fn resolve_all(names: &[String]) -> Result<Vec<Box<dyn Analyzer>>> {
    names.iter().map(|name| lookup(name)).collect()
}

/// Whether this analyzer needs per-layer directories materialized.
pub fn requires_layers(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "layer" | "aptlayer" | "rpmlayer" | "apklayer" | "piplayer" | "nodelayer"
    )
}
