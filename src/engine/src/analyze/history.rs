//! Image history analyzer.
//!
//! The analysis is the ordered list of layer-creation commands from the
//! image configuration. The diff trims the longest common prefix and
//! reports the two tails.

use serde::Serialize;
use shale_core::error::Result;

use super::Analyzer;
use crate::image::Image;
use crate::report::{AnalyzeResult, DiffResult, Report};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryDiff {
    #[serde(rename = "Image1Only")]
    pub image1_only: Vec<String>,
    #[serde(rename = "Image2Only")]
    pub image2_only: Vec<String>,
}

impl HistoryDiff {
    pub fn is_empty(&self) -> bool {
        self.image1_only.is_empty() && self.image2_only.is_empty()
    }
}

/// Trim the shared prefix and keep the diverging tails.
pub fn history_diff(history1: &[String], history2: &[String]) -> HistoryDiff {
    let common = history1
        .iter()
        .zip(history2.iter())
        .take_while(|(a, b)| a == b)
        .count();
    HistoryDiff {
        image1_only: history1[common..].to_vec(),
        image2_only: history2[common..].to_vec(),
    }
}

pub struct HistoryAnalyzer;

impl Analyzer for HistoryAnalyzer {
    fn name(&self) -> &'static str {
        "history"
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::History(image.history.clone()),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::HistoryDiff(history_diff(&image1.history, &image2.history)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_shared_prefix_trimmed() {
        let a = commands(&["FROM scratch", "ADD rootfs /", "RUN apk add curl", "CMD [\"sh\"]"]);
        let b = commands(&["FROM scratch", "ADD rootfs /", "RUN apk add wget"]);

        let diff = history_diff(&a, &b);
        assert_eq!(diff.image1_only, commands(&["RUN apk add curl", "CMD [\"sh\"]"]));
        assert_eq!(diff.image2_only, commands(&["RUN apk add wget"]));
    }

    #[test]
    fn test_identical_history_empty_diff() {
        let a = commands(&["FROM scratch", "ADD rootfs /"]);
        assert!(history_diff(&a, &a).is_empty());
    }

    #[test]
    fn test_divergence_after_shared_entry_keeps_tails() {
        // A shared entry after the divergence point stays in both tails
        let a = commands(&["base", "x", "shared"]);
        let b = commands(&["base", "y", "shared"]);

        let diff = history_diff(&a, &b);
        assert_eq!(diff.image1_only, commands(&["x", "shared"]));
        assert_eq!(diff.image2_only, commands(&["y", "shared"]));
    }

    #[test]
    fn test_one_empty_history() {
        let a = commands(&[]);
        let b = commands(&["FROM scratch"]);
        let diff = history_diff(&a, &b);
        assert!(diff.image1_only.is_empty());
        assert_eq!(diff.image2_only.len(), 1);
    }
}
