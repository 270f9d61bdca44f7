//! The analyzer capability and its implementations.
//!
//! An analyzer produces either a whole-image analysis or a pairwise diff
//! over one dimension of an image (packages, files, history, metadata,
//! sizes). Package-style analyzers share the backbones in [`packages`];
//! the diff algebra lives in [`diff`].

pub mod apk;
pub mod apt;
pub mod diff;
pub mod file;
pub mod history;
pub mod metadata;
pub mod node;
pub mod packages;
pub mod pip;
pub mod registry;
pub mod rpm;
pub mod size;

use shale_core::error::Result;

use crate::image::Image;
use crate::report::{AnalyzeResult, DiffResult};

/// A named analysis dimension.
///
/// Implementations treat images as read-only; any scratch state is local
/// to the call.
pub trait Analyzer: Send + Sync {
    /// The registry name of this analyzer.
    fn name(&self) -> &'static str;

    /// Analyze a single image.
    fn analyze(&self, image: &Image) -> Result<AnalyzeResult>;

    /// Diff two images. Swapping the arguments swaps the asymmetric
    /// result buckets.
    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult>;
}
