//! Image tarball reading.
//!
//! Two on-disk archive formats are understood:
//!
//! - **OCI archive**: the tar contains an OCI image layout (`index.json`,
//!   `blobs/`). After unpacking, the regular layout reader takes over.
//! - **docker-save**: the tar contains `manifest.json` with per-image
//!   config and layer paths. The image digest is the sha256 of the config
//!   blob (the daemon's image ID).

use std::io::Read;
use std::path::{Path, PathBuf};

use oci_spec::image::ImageConfiguration;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use shale_core::error::{Result, ShaleError};

use super::extract;
use super::layout::LayerBlob;

/// Contents of an unpacked image tarball.
#[derive(Debug)]
pub enum TarballContents {
    /// The tarball held an OCI image layout rooted at this directory.
    OciLayout(PathBuf),
    /// The tarball was in docker-save format.
    DockerSave(DockerSaveImage),
}

/// A docker-save image: parsed config plus layer blobs in stack order.
#[derive(Debug)]
pub struct DockerSaveImage {
    /// Image digest: sha256 of the config blob
    pub digest: String,
    pub config: ImageConfiguration,
    pub layers: Vec<LayerBlob>,
}

/// manifest.json entry inside a docker-save archive.
#[derive(Debug, Deserialize)]
struct DockerManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Unpack an image tarball into `work_dir` and classify its format.
pub fn unpack_image_tarball(tar_path: &Path, work_dir: &Path) -> Result<TarballContents> {
    if !tar_path.is_file() {
        return Err(ShaleError::ReferenceInvalid {
            reference: tar_path.display().to_string(),
            message: "image tarball does not exist".to_string(),
        });
    }

    extract::extract_layer(tar_path, work_dir)?;

    if super::layout::ImageLayout::is_layout(work_dir) {
        tracing::debug!(tar = %tar_path.display(), "Tarball is an OCI archive");
        return Ok(TarballContents::OciLayout(work_dir.to_path_buf()));
    }

    let manifest_path = work_dir.join("manifest.json");
    if !manifest_path.is_file() {
        return Err(ShaleError::Extraction(format!(
            "{} is neither an OCI archive nor a docker-save tarball",
            tar_path.display()
        )));
    }

    let entries: Vec<DockerManifestEntry> =
        serde_json::from_str(&std::fs::read_to_string(&manifest_path)?).map_err(|e| {
            ShaleError::Extraction(format!("failed to parse manifest.json: {}", e))
        })?;
    let entry = entries.first().ok_or_else(|| {
        ShaleError::Extraction("manifest.json lists no images".to_string())
    })?;

    let config_path = work_dir.join(&entry.config);
    let config_bytes = std::fs::read(&config_path).map_err(|e| {
        ShaleError::Extraction(format!(
            "failed to read image config {}: {}",
            config_path.display(),
            e
        ))
    })?;
    let config: ImageConfiguration = serde_json::from_slice(&config_bytes).map_err(|e| {
        ShaleError::Extraction(format!("failed to parse image config: {}", e))
    })?;
    let digest = format!("sha256:{:x}", Sha256::digest(&config_bytes));

    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer_rel in &entry.layers {
        let path = work_dir.join(layer_rel);
        let meta = std::fs::metadata(&path).map_err(|e| {
            ShaleError::Extraction(format!("missing layer {}: {}", path.display(), e))
        })?;
        layers.push(LayerBlob {
            digest: format!("sha256:{}", sha256_file(&path)?),
            size: meta.len(),
            path,
        });
    }

    tracing::debug!(
        tar = %tar_path.display(),
        digest = %digest,
        layers = layers.len(),
        "Tarball is a docker-save archive"
    );

    Ok(TarballContents::DockerSave(DockerSaveImage {
        digest,
        config,
        layers,
    }))
}

/// Streaming sha256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
