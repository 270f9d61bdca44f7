//! Filesystem analyzers.
//!
//! `file` walks the flattened root and lists every entry, sorted by
//! path. `layer` produces the same listing per layer. The diff marks an
//! entry modified when size, type, or permissions differ; content is not
//! hashed.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shale_core::error::{Result, ShaleError};
use walkdir::WalkDir;

use super::Analyzer;
use crate::image::Image;
use crate::report::{AnalyzeResult, DiffResult, Report};

/// One filesystem entry, path relative to the walked root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Type")]
    pub kind: FileKind,
    /// Octal permission bits, e.g. "0644"
    #[serde(rename = "Permissions")]
    pub permissions: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "MTime", skip_serializing_if = "Option::is_none")]
    pub mtime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Walk a directory tree into a sorted entry list.
pub fn walk_tree(root: &Path) -> Result<Vec<FileEntry>> {
    if !root.is_dir() {
        return Err(ShaleError::Internal(format!(
            "filesystem root {} is not a readable directory",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            ShaleError::Io(std::io::Error::other(format!(
                "walk failed under {}: {}",
                root.display(),
                e
            )))
        })?;
        let metadata = entry.metadata().map_err(|e| {
            ShaleError::Io(std::io::Error::other(format!(
                "metadata failed for {}: {}",
                entry.path().display(),
                e
            )))
        })?;

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();

        let mtime = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

        entries.push(FileEntry {
            path: format!("/{}", rel),
            kind,
            permissions: permissions_string(&metadata),
            size: if kind == FileKind::File { metadata.len() } else { 0 },
            mtime,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn permissions_string(metadata: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        format!("{:04o}", metadata.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        String::from("0000")
    }
}

/// Diff of two file listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileDiff {
    #[serde(rename = "Image1Only")]
    pub image1_only: Vec<FileEntry>,
    #[serde(rename = "Image2Only")]
    pub image2_only: Vec<FileEntry>,
    #[serde(rename = "Modified")]
    pub modified: Vec<ModifiedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedFile {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Image1")]
    pub entry1: FileEntry,
    #[serde(rename = "Image2")]
    pub entry2: FileEntry,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.image1_only.is_empty() && self.image2_only.is_empty() && self.modified.is_empty()
    }
}

/// Same path, different size-or-type-or-permissions. Both inputs must be
/// path-sorted, which [`walk_tree`] guarantees.
pub fn file_diff(entries1: &[FileEntry], entries2: &[FileEntry]) -> FileDiff {
    let mut diff = FileDiff::default();
    let mut iter1 = entries1.iter().peekable();
    let mut iter2 = entries2.iter().peekable();

    loop {
        match (iter1.peek(), iter2.peek()) {
            (Some(e1), Some(e2)) => match e1.path.cmp(&e2.path) {
                std::cmp::Ordering::Less => {
                    diff.image1_only.push((*e1).clone());
                    iter1.next();
                }
                std::cmp::Ordering::Greater => {
                    diff.image2_only.push((*e2).clone());
                    iter2.next();
                }
                std::cmp::Ordering::Equal => {
                    if e1.size != e2.size
                        || e1.kind != e2.kind
                        || e1.permissions != e2.permissions
                    {
                        diff.modified.push(ModifiedFile {
                            path: e1.path.clone(),
                            entry1: (*e1).clone(),
                            entry2: (*e2).clone(),
                        });
                    }
                    iter1.next();
                    iter2.next();
                }
            },
            (Some(e1), None) => {
                diff.image1_only.push((*e1).clone());
                iter1.next();
            }
            (None, Some(e2)) => {
                diff.image2_only.push((*e2).clone());
                iter2.next();
            }
            (None, None) => break,
        }
    }
    diff
}

/// Whole-image file listing analyzer.
pub struct FileAnalyzer;

impl Analyzer for FileAnalyzer {
    fn name(&self) -> &'static str {
        "file"
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::Files(walk_tree(&image.fs_path)?),
        ))
    }

    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        let entries1 = walk_tree(&image1.fs_path)?;
        let entries2 = walk_tree(&image2.fs_path)?;
        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::FileDiff(file_diff(&entries1, &entries2)),
        ))
    }
}

/// Per-layer file listing analyzer.
pub struct LayerFileAnalyzer;

impl LayerFileAnalyzer {
    fn layer_listings(image: &Image) -> Result<Vec<Vec<FileEntry>>> {
        let mut listings = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            let root = layer.fs_path.as_ref().ok_or_else(|| {
                ShaleError::Internal(format!(
                    "layer analyzer requires materialized layers for {}",
                    image.source
                ))
            })?;
            listings.push(walk_tree(root)?);
        }
        Ok(listings)
    }
}

impl Analyzer for LayerFileAnalyzer {
    fn name(&self) -> &'static str {
        "layer"
    }

    fn analyze(&self, image: &Image) -> Result<AnalyzeResult> {
        Ok(AnalyzeResult::new(
            self.name(),
            &image.source,
            Report::LayeredFiles(Self::layer_listings(image)?),
        ))
    }

    /// One comparison per aligned layer index; surplus layers on either
    /// side are reported wholesale.
    fn diff(&self, image1: &Image, image2: &Image) -> Result<DiffResult> {
        let listings1 = Self::layer_listings(image1)?;
        let listings2 = Self::layer_listings(image2)?;

        let aligned = listings1.len().min(listings2.len());
        let mut diffs = Vec::with_capacity(listings1.len().max(listings2.len()));
        for index in 0..aligned {
            diffs.push(file_diff(&listings1[index], &listings2[index]));
        }
        for listing in &listings1[aligned..] {
            diffs.push(FileDiff {
                image1_only: listing.clone(),
                ..Default::default()
            });
        }
        for listing in &listings2[aligned..] {
            diffs.push(FileDiff {
                image2_only: listing.clone(),
                ..Default::default()
            });
        }

        Ok(DiffResult::new(
            self.name(),
            &image1.source,
            &image2.source,
            Report::LayeredFileDiff(diffs),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, kind: FileKind, permissions: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            kind,
            permissions: permissions.to_string(),
            size,
            mtime: None,
        }
    }

    #[test]
    fn test_walk_tree_sorted() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/hosts"), "x").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "abc").unwrap();

        let entries = walk_tree(tmp.path()).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a.txt", "/etc", "/etc/hosts"]);
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[1].kind, FileKind::Dir);
    }

    #[test]
    fn test_walk_tree_missing_root() {
        assert!(walk_tree(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn test_file_diff_size_change() {
        // /etc/hosts grew, /bin/sh unchanged
        let a = vec![
            entry("/bin/sh", FileKind::File, "0755", 900),
            entry("/etc/hosts", FileKind::File, "0644", 120),
        ];
        let b = vec![
            entry("/bin/sh", FileKind::File, "0755", 900),
            entry("/etc/hosts", FileKind::File, "0644", 140),
        ];

        let diff = file_diff(&a, &b);
        assert!(diff.image1_only.is_empty());
        assert!(diff.image2_only.is_empty());
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].path, "/etc/hosts");
        assert_eq!(diff.modified[0].entry1.size, 120);
        assert_eq!(diff.modified[0].entry2.size, 140);
    }

    #[test]
    fn test_file_diff_added_removed() {
        let a = vec![entry("/old", FileKind::File, "0644", 1)];
        let b = vec![entry("/new", FileKind::File, "0644", 1)];

        let diff = file_diff(&a, &b);
        assert_eq!(diff.image1_only[0].path, "/old");
        assert_eq!(diff.image2_only[0].path, "/new");
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn test_file_diff_permission_change() {
        let a = vec![entry("/bin/tool", FileKind::File, "0644", 10)];
        let b = vec![entry("/bin/tool", FileKind::File, "0755", 10)];
        assert_eq!(file_diff(&a, &b).modified.len(), 1);
    }

    #[test]
    fn test_file_diff_type_change() {
        let a = vec![entry("/bin/sh", FileKind::Symlink, "0777", 0)];
        let b = vec![entry("/bin/sh", FileKind::File, "0777", 0)];
        assert_eq!(file_diff(&a, &b).modified.len(), 1);
    }

    #[test]
    fn test_file_diff_mtime_does_not_count() {
        let mut a = entry("/f", FileKind::File, "0644", 5);
        let mut b = entry("/f", FileKind::File, "0644", 5);
        a.mtime = Some("2024-01-01T00:00:00+00:00".to_string());
        b.mtime = Some("2025-06-01T00:00:00+00:00".to_string());
        assert!(file_diff(&[a], &[b]).is_empty());
    }

    #[test]
    fn test_file_diff_self_empty() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), "content").unwrap();
        let entries = walk_tree(tmp.path()).unwrap();
        assert!(file_diff(&entries, &entries).is_empty());
    }
}
