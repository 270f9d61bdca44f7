//! Shale Engine - the analyzer pipeline.
//!
//! This crate turns a user-supplied image reference into a materialized
//! [`image::Image`] (flattened root plus optional per-layer directories) and
//! runs a set of named analyzers over one or two such images, producing
//! either whole-image analyses or pairwise diffs with deterministic output.
//!
//! # Architecture
//!
//! ```text
//! reference ──► image::source::ImageSource ──► image::Image (×1 or ×2)
//!                                                   │
//!            analyze::registry::lookup(names) ──────┤
//!                                                   ▼
//!                     drive::{analyze_all, diff_all}   (one task per analyzer)
//!                                                   │
//!                analyze::* ──► analyze::diff (package algebra)
//!                                                   ▼
//!                          report::{AnalyzeResult, DiffResult}
//! ```

pub mod analyze;
pub mod daemon;
pub mod drive;
pub mod image;
pub mod report;

// Re-export the main entry points
pub use analyze::registry::{lookup, requires_layers, resolve_all};
pub use drive::{analyze_all, diff_all};
pub use image::source::ImageSource;
pub use image::{Image, Layer};
pub use report::{AnalyzeResult, DiffResult, Report};
