//! Materialized image representation.
//!
//! An [`Image`] is what analyzers consume: a flattened root filesystem, an
//! ordered sequence of per-layer directories (when requested), and a stable
//! projection of the image configuration. Images are created by
//! [`source::ImageSource`], never mutated afterwards, and own any temporary
//! directories they were materialized into.

pub mod cache;
pub mod extract;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod source;
pub mod tarball;

use std::collections::BTreeMap;
use std::path::PathBuf;

use oci_spec::image::ImageConfiguration;
use serde::Serialize;

pub use reference::ImageRef;

/// A single image layer, ordered base to top.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Position in the layer stack, 0 = base
    pub index: usize,
    /// Blob digest (e.g. "sha256:abc...")
    pub digest: String,
    /// Directory the layer tar was extracted into, when layers were
    /// materialized. Whiteout markers are preserved, not applied.
    pub fs_path: Option<PathBuf>,
    /// Blob size in bytes
    pub size: u64,
}

/// Stable projection of an image configuration.
///
/// Collections use sorted containers so serialized output is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigSummary {
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(rename = "ExposedPorts")]
    pub exposed_ports: Vec<String>,
    #[serde(rename = "Volumes")]
    pub volumes: Vec<String>,
    #[serde(rename = "Labels")]
    pub labels: BTreeMap<String, String>,
}

impl ConfigSummary {
    /// Project an OCI image configuration into the summary shape.
    pub fn from_oci(oci: &ImageConfiguration) -> Self {
        let config = oci.config();

        let mut env: Vec<String> = config
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default();
        env.sort();

        let entrypoint = config
            .as_ref()
            .and_then(|c| c.entrypoint().clone())
            .unwrap_or_default();

        let cmd = config
            .as_ref()
            .and_then(|c| c.cmd().clone())
            .unwrap_or_default();

        let working_dir = config
            .as_ref()
            .and_then(|c| c.working_dir().clone())
            .unwrap_or_default();

        let mut exposed_ports: Vec<String> = config
            .as_ref()
            .and_then(|c| c.exposed_ports().as_ref())
            .map(|ports| ports.iter().cloned().collect())
            .unwrap_or_default();
        exposed_ports.sort();

        let mut volumes: Vec<String> = config
            .as_ref()
            .and_then(|c| c.volumes().as_ref())
            .map(|vols| vols.iter().cloned().collect())
            .unwrap_or_default();
        volumes.sort();

        let labels: BTreeMap<String, String> = config
            .as_ref()
            .and_then(|c| c.labels().as_ref())
            .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Self {
            env,
            entrypoint,
            cmd,
            working_dir,
            exposed_ports,
            volumes,
            labels,
        }
    }
}

/// Layer-creation commands from the image configuration history,
/// base first, empty layers included.
pub fn history_commands(oci: &ImageConfiguration) -> Vec<String> {
    oci.history()
        .iter()
        .map(|h| h.created_by().clone().unwrap_or_default())
        .collect()
}

/// A materialized image ready for analysis.
///
/// The image is read-only once returned by the source. `cleanup` removes
/// exactly the temporary directories the image owns; cache-owned
/// directories survive.
#[derive(Debug)]
pub struct Image {
    /// The reference string as supplied by the user
    pub source: String,
    /// Manifest digest, or a content hash for sources without one
    pub digest: String,
    /// Configuration projection
    pub config: ConfigSummary,
    /// Layer-creation commands, base first
    pub history: Vec<String>,
    /// Flattened root filesystem with all layers applied in order
    pub fs_path: PathBuf,
    /// Layers, base to top
    pub layers: Vec<Layer>,
    /// Directory whose archived contents are daemon-loadable (an OCI
    /// layout or an unpacked docker-save tree), when one exists.
    /// Collaborators use it to re-stream the image to a daemon.
    pub layout_dir: Option<PathBuf>,
    /// Temporary directories owned by this image
    pub(crate) owned: Vec<PathBuf>,
}

impl Image {
    /// Remove the temporary directories this image owns.
    ///
    /// Cached directories are not owned and are left in place. Errors are
    /// logged, not returned, since cleanup runs on teardown paths.
    pub fn cleanup(&self) {
        for dir in &self.owned {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove image temp dir");
                }
            }
        }
    }

    /// Layer directories in stack order. Empty when layers were not
    /// materialized.
    pub fn layer_dirs(&self) -> Vec<&PathBuf> {
        self.layers.iter().filter_map(|l| l.fs_path.as_ref()).collect()
    }
}
