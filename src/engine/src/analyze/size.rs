//! Size analyzers.
//!
//! `size` reports the aggregate of layer blob sizes (falling back to the
//! flattened tree size when a source has no layer metadata, e.g. a plain
//! directory). `sizelayer` reports per-layer blob sizes and diffs them
//! by aligned index.

use serde::Serialize;
use shale_core::error::Result;

use super::Analyzer;
use crate::image::extract::dir_size;
use crate::image::Image;
use crate::report::{AnalyzeResult, DiffResult, Report};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SizeReport {
    #[serde(rename = "Size")]
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SizeDiff {
    #[serde(rename = "Size1")]
    pub size1: u64,
    #[serde(rename = "Size2")]
    pub size2: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSizeEntry {
    #[serde(rename = "Index")]
    pub index: usize,
    #[serde(rename = "Digest")]
    pub digest: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerSizeDiff {
    /// Index-aligned size pairs
    #[serde(rename = "Aligned")]
    pub aligned: Vec<SizeDiff>,
    /// Surplus layers present only in image1
    #[serde(rename = "Image1Only")]
    pub image1_only: Vec<LayerSizeEntry>,
    /// Surplus layers present only in image2
    #[serde(rename = "Image2Only")]
    pub image2_only: Vec<LayerSizeEntry>,
}

fn total_size(image: &Image) -> u64 {
    if image.layers.is_empty() {
        dir_size(&image.fs_path)
    } else {
        image.layers.iter().map(|l| l.size).sum()
    }
}

fn layer_entries(image: &Image) -> Vec<LayerSizeEntry> {
    image
        .layers
        .iter()
        .map(|layer| LayerSizeEntry {
            index: layer.index,
            digest: layer.digest.clone(),
            size: layer.size,
        })
        .collect()
}

pub struct SizeAnalyzer;

impl Analyzer for SizeAnalyzer {
    fn name(&self) -> &'static str {
        "size"
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::Size(SizeReport {
                size: total_size(image),
            }),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::SizeDiff(SizeDiff {
                size1: total_size(image1),
                size2: total_size(image2),
            }),
        ))
    }
}

pub struct SizeLayerAnalyzer;

impl Analyzer for SizeLayerAnalyzer {
    fn name(&self) -> &'static str {
        "sizelayer"
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::LayerSizes(layer_entries(image)),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        let entries1 = layer_entries(image1);
        let entries2 = layer_entries(image2);
        let aligned_count = entries1.len().min(entries2.len());

        let diff = LayerSizeDiff {
            aligned: (0..aligned_count)
                .map(|i| SizeDiff {
                    size1: entries1[i].size,
                    size2: entries2[i].size,
                })
                .collect(),
            image1_only: entries1[aligned_count..].to_vec(),
            image2_only: entries2[aligned_count..].to_vec(),
        };

        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::LayerSizeDiff(diff),
        ))
    }
}
