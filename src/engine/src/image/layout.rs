//! OCI image-layout reading.
//!
//! Reads an on-disk OCI image layout (`oci-layout`, `index.json`,
//! `blobs/<alg>/<hex>`), selects the manifest matching a target platform
//! from a multi-platform index, and exposes the parsed manifest, config
//! and layer blob paths.

use std::path::{Path, PathBuf};

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use shale_core::error::{Result, ShaleError};
use shale_core::options::Platform;

/// A parsed OCI image layout pinned to one platform manifest.
#[derive(Debug)]
pub struct ImageLayout {
    root: PathBuf,
    manifest: ImageManifest,
    manifest_digest: String,
    config: ImageConfiguration,
}

/// One layer blob as described by the manifest.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub digest: String,
    pub size: u64,
    pub path: PathBuf,
}

impl ImageLayout {
    /// Whether `root` looks like an OCI image layout.
    pub fn is_layout(root: &Path) -> bool {
        root.join("index.json").is_file() && root.join("blobs").is_dir()
    }

    /// Open a layout and resolve the manifest for `platform`.
    ///
    /// Single-manifest indexes are used as-is. Multi-platform indexes are
    /// searched for an exact os/arch match; a nested index is followed one
    /// level.
    pub fn open(root: &Path, platform: &Platform) -> Result<Self> {
        if !Self::is_layout(root) {
            return Err(ShaleError::Extraction(format!(
                "not an OCI image layout: {}",
                root.display()
            )));
        }

        let index: ImageIndex = read_json(&root.join("index.json"))?;
        let manifest_digest = select_manifest(root, &index, platform)?;

        let manifest: ImageManifest = read_json(&blob_path(root, &manifest_digest))?;
        let config_digest = manifest.config().digest().to_string();
        let config: ImageConfiguration = read_json(&blob_path(root, &config_digest))?;

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            manifest_digest,
            config,
        })
    }

    /// The digest of the selected manifest.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// The parsed image configuration.
    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    /// The raw manifest.
    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Layer blobs in stack order, base first.
    pub fn layers(&self) -> Vec<LayerBlob> {
        self.manifest
            .layers()
            .iter()
            .map(|descriptor| {
                let digest = descriptor.digest().to_string();
                LayerBlob {
                    path: blob_path(&self.root, &digest),
                    size: descriptor.size() as u64,
                    digest,
                }
            })
            .collect()
    }
}

/// Pick the manifest digest for `platform` from an image index.
fn select_manifest(root: &Path, index: &ImageIndex, platform: &Platform) -> Result<String> {
    let manifests = index.manifests();
    if manifests.is_empty() {
        return Err(ShaleError::Extraction(
            "image index contains no manifests".to_string(),
        ));
    }

    if manifests.len() == 1 {
        let descriptor = &manifests[0];
        if is_index_media_type(descriptor.media_type()) {
            let nested: ImageIndex =
                read_json(&blob_path(root, &descriptor.digest().to_string()))?;
            return select_from_platforms(&nested, platform);
        }
        return Ok(descriptor.digest().to_string());
    }

    select_from_platforms(index, platform)
}

fn select_from_platforms(index: &ImageIndex, platform: &Platform) -> Result<String> {
    let manifests = index.manifests();

    for descriptor in manifests {
        if is_index_media_type(descriptor.media_type()) {
            continue;
        }
        if let Some(p) = descriptor.platform() {
            let os = p.os().to_string().to_lowercase();
            let arch = p.architecture().to_string().to_lowercase();
            if os == platform.os.to_lowercase() && arch == platform.architecture.to_lowercase() {
                return Ok(descriptor.digest().to_string());
            }
        }
    }

    // No platform match: fall back to the first manifest-typed descriptor
    for descriptor in manifests {
        if !is_index_media_type(descriptor.media_type()) {
            tracing::warn!(
                requested = %platform,
                chosen = %descriptor.digest(),
                "No manifest matches requested platform, using first available"
            );
            return Ok(descriptor.digest().to_string());
        }
    }

    Err(ShaleError::Extraction(format!(
        "no manifest for platform {} in image index",
        platform
    )))
}

fn is_index_media_type(media_type: &MediaType) -> bool {
    matches!(media_type, MediaType::ImageIndex)
        || media_type.to_string().contains("manifest.list")
}

/// Path to a blob by digest ("alg:hex" or bare hex).
pub fn blob_path(root: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = match digest.split_once(':') {
        Some((alg, hex)) => (alg, hex),
        None => ("sha256", digest),
    };
    root.join("blobs").join(algorithm).join(hash)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ShaleError::Extraction(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        ShaleError::Extraction(format!("failed to parse {}: {}", path.display(), e))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use tempfile::TempDir;

    /// Build a minimal single-platform OCI layout with the given files in
    /// one layer. Shared by source and cache tests.
    pub(crate) fn create_test_layout(path: &Path, files: &[(&str, &[u8])]) -> String {
        create_test_layout_for(path, files, "amd64")
    }

    pub(crate) fn create_test_layout_for(
        path: &Path,
        files: &[(&str, &[u8])],
        arch: &str,
    ) -> String {
        fs::create_dir_all(path.join("blobs/sha256")).unwrap();
        fs::write(path.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

        // Layer blob
        let layer_hex = format!("{:064x}", 0xaau64);
        {
            let file = fs::File::create(path.join("blobs/sha256").join(&layer_hex)).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for (name, content) in files {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, *name, *content).unwrap();
            }
            builder.finish().unwrap();
        }
        let layer_size = fs::metadata(path.join("blobs/sha256").join(&layer_hex))
            .unwrap()
            .len();

        // Config blob
        let config_content = format!(
            r#"{{
                "architecture": "{arch}",
                "os": "linux",
                "config": {{
                    "Entrypoint": ["/bin/app"],
                    "Env": ["PATH=/usr/bin"],
                    "WorkingDir": "/srv"
                }},
                "rootfs": {{"type": "layers", "diff_ids": ["sha256:{layer_hex}"]}},
                "history": [{{"created_by": "COPY . /srv"}}]
            }}"#
        );
        let config_hex = format!("{:064x}", 0xbbu64);
        fs::write(path.join("blobs/sha256").join(&config_hex), &config_content).unwrap();

        // Manifest blob
        let manifest_content = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {{
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "digest": "sha256:{config_hex}",
                    "size": {}
                }},
                "layers": [{{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:{layer_hex}",
                    "size": {layer_size}
                }}]
            }}"#,
            config_content.len()
        );
        let manifest_hex = format!("{:064x}", 0xccu64);
        fs::write(
            path.join("blobs/sha256").join(&manifest_hex),
            &manifest_content,
        )
        .unwrap();

        // Index
        let index_content = format!(
            r#"{{
                "schemaVersion": 2,
                "manifests": [{{
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": "sha256:{manifest_hex}",
                    "size": {},
                    "platform": {{"architecture": "{arch}", "os": "linux"}}
                }}]
            }}"#,
            manifest_content.len()
        );
        fs::write(path.join("index.json"), index_content).unwrap();

        format!("sha256:{manifest_hex}")
    }

    fn linux_platform(arch: &str) -> Platform {
        Platform {
            os: "linux".to_string(),
            architecture: arch.to_string(),
        }
    }

    #[test]
    fn test_open_layout() {
        let tmp = TempDir::new().unwrap();
        let digest = create_test_layout(tmp.path(), &[("srv/app", b"bin")]);

        let layout = ImageLayout::open(tmp.path(), &linux_platform("amd64")).unwrap();
        assert_eq!(layout.manifest_digest(), digest);
        assert_eq!(layout.layers().len(), 1);
        assert!(layout.layers()[0].path.exists());
        assert_eq!(
            layout.config().config().as_ref().unwrap().entrypoint(),
            &Some(vec!["/bin/app".to_string()])
        );
    }

    #[test]
    fn test_open_not_a_layout() {
        let tmp = TempDir::new().unwrap();
        let result = ImageLayout::open(tmp.path(), &linux_platform("amd64"));
        assert!(result.is_err());
    }

    #[test]
    fn test_single_manifest_ignores_platform_mismatch() {
        // One manifest for another arch still resolves: a single-entry
        // index is used as-is.
        let tmp = TempDir::new().unwrap();
        create_test_layout_for(tmp.path(), &[("f", b"x")], "arm64");
        let layout = ImageLayout::open(tmp.path(), &linux_platform("amd64")).unwrap();
        assert_eq!(layout.layers().len(), 1);
    }

    #[test]
    fn test_blob_path_formats() {
        let root = PathBuf::from("/img");
        assert_eq!(
            blob_path(&root, "sha256:abc"),
            PathBuf::from("/img/blobs/sha256/abc")
        );
        assert_eq!(
            blob_path(&root, "abc"),
            PathBuf::from("/img/blobs/sha256/abc")
        );
    }
}
