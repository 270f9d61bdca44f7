//! Image acquisition and materialization.
//!
//! [`ImageSource::prepare`] resolves a reference string to a materialized
//! [`Image`]: the flattened root filesystem (layers applied in order,
//! whiteouts honored) and, on request, one directory per layer with
//! whiteout markers preserved. Remote pulls are cache-first when the
//! caller opts in; every temporary directory is owned by the returned
//! image and removed by its `cleanup`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use oci_spec::image::ImageConfiguration;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shale_core::error::{Result, ShaleError};
use shale_core::options::PrepareOptions;

use super::cache::ImageCache;
use super::extract::{apply_layer, extract_layer};
use super::layout::{ImageLayout, LayerBlob};
use super::reference::ImageRef;
use super::registry::{RegistryAuth, RegistryPuller};
use super::tarball::{self, TarballContents};
use super::{history_commands, ConfigSummary, Image, Layer};
use crate::daemon::{DaemonClient, DockerCli};

/// Per-layer record persisted in a cache entry's manifest.json.
#[derive(Debug, Serialize, Deserialize)]
struct CachedLayerMeta {
    digest: String,
    size: u64,
}

/// Resolves references to materialized images.
pub struct ImageSource {
    puller: RegistryPuller,
    cache: ImageCache,
    daemon: Arc<dyn DaemonClient>,
}

impl ImageSource {
    /// Source with explicit collaborators.
    pub fn new(auth: RegistryAuth, cache: ImageCache, daemon: Arc<dyn DaemonClient>, retries: u32) -> Self {
        Self {
            puller: RegistryPuller::new(auth, retries),
            cache,
            daemon,
        }
    }

    /// Source with environment auth, the default cache root, and the
    /// docker CLI daemon client.
    pub fn with_defaults(retries: u32) -> Result<Self> {
        Ok(Self::new(
            RegistryAuth::from_env(),
            ImageCache::new(ImageCache::default_root())?,
            Arc::new(DockerCli),
            retries,
        ))
    }

    /// The cache this source consults.
    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Resolve a reference to a materialized image.
    pub async fn prepare(&self, reference: &str, opts: &PrepareOptions) -> Result<Image> {
        match ImageRef::parse(reference)? {
            ImageRef::Directory(dir) => self.prepare_directory(reference, &dir, opts),
            ImageRef::Tarball(path) => self.prepare_tarball(reference, &path, opts),
            ImageRef::Daemon(name) => self.prepare_daemon(reference, &name, opts),
            ImageRef::Registry(registry_ref) => {
                let full = registry_ref.full_reference();
                self.prepare_registry(reference, &registry_ref, &full, opts)
                    .await
            }
        }
    }

    fn prepare_directory(
        &self,
        source: &str,
        dir: &Path,
        opts: &PrepareOptions,
    ) -> Result<Image> {
        if !dir.is_dir() {
            return Err(ShaleError::ReferenceInvalid {
                reference: source.to_string(),
                message: format!("directory {} does not exist", dir.display()),
            });
        }

        if ImageLayout::is_layout(dir) {
            // A pre-unpacked OCI layout still needs flattening
            return self.materialize_from_layout(source, dir, Vec::new(), opts);
        }

        // A plain directory is already the flattened filesystem
        let canonical = dir.canonicalize()?;
        let digest = format!(
            "sha256:{:x}",
            Sha256::digest(canonical.to_string_lossy().as_bytes())
        );
        tracing::info!(source = %source, "Using pre-unpacked directory as image root");
        Ok(Image {
            source: source.to_string(),
            digest,
            config: ConfigSummary::default(),
            history: Vec::new(),
            fs_path: canonical,
            layers: Vec::new(),
            layout_dir: None,
            owned: Vec::new(),
        })
    }

    fn prepare_tarball(
        &self,
        source: &str,
        tar_path: &Path,
        opts: &PrepareOptions,
    ) -> Result<Image> {
        let work = scratch_dir()?;
        let result = self.materialize_tarball(source, tar_path, &work, opts);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&work);
        }
        result
    }

    fn materialize_tarball(
        &self,
        source: &str,
        tar_path: &Path,
        work: &Path,
        opts: &PrepareOptions,
    ) -> Result<Image> {
        let unpack_dir = work.join("unpacked");
        match tarball::unpack_image_tarball(tar_path, &unpack_dir)? {
            TarballContents::OciLayout(layout_dir) => {
                self.materialize_from_layout(source, &layout_dir, vec![work.to_path_buf()], opts)
            }
            TarballContents::DockerSave(image) => self.materialize(
                source,
                &image.digest,
                &image.config,
                &image.layers,
                Some(unpack_dir),
                vec![work.to_path_buf()],
                opts,
            ),
        }
    }

    fn prepare_daemon(&self, source: &str, name: &str, opts: &PrepareOptions) -> Result<Image> {
        // The daemon's content id is the config digest, the same key the
        // tarball path derives, so a cached filesystem can be reused
        // without exporting the image.
        if opts.use_cache {
            if let Ok(digest) = self.daemon.image_id(name) {
                if let Some(image) = self.image_from_cache(source, &digest, opts)? {
                    return Ok(image);
                }
            }
        }

        let work = scratch_dir()?;
        let result = (|| {
            let tar_path = work.join("daemon.tar");
            self.daemon.save(name, &tar_path)?;
            tracing::info!(image = %name, tar = %tar_path.display(), "Exported image from daemon");
            self.materialize_tarball(source, &tar_path, &work, opts)
        })();
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&work);
        }
        result
    }

    async fn prepare_registry(
        &self,
        source: &str,
        registry_ref: &super::reference::RegistryRef,
        full_reference: &str,
        opts: &PrepareOptions,
    ) -> Result<Image> {
        // Resolve the digest first so a cache hit skips the blob pulls
        if opts.use_cache {
            let digest = self.puller.manifest_digest(registry_ref).await?;
            if let Some(image) = self.image_from_cache(source, &digest, opts)? {
                return Ok(image);
            }
        }

        let work = scratch_dir()?;
        let layout_dir = work.join("layout");
        if let Err(e) = self.puller.pull(registry_ref, &layout_dir).await {
            let _ = std::fs::remove_dir_all(&work);
            tracing::warn!(reference = %full_reference, error = %e, "Pull failed");
            return Err(e);
        }

        let result =
            self.materialize_from_layout(source, &layout_dir, vec![work.clone()], opts);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&work);
        }
        result
    }

    /// Materialize from an on-disk OCI layout.
    fn materialize_from_layout(
        &self,
        source: &str,
        layout_dir: &Path,
        owned: Vec<PathBuf>,
        opts: &PrepareOptions,
    ) -> Result<Image> {
        let layout = ImageLayout::open(layout_dir, &opts.target_platform())?;
        let digest = layout.manifest_digest().to_string();
        let blobs = layout.layers();
        let config = layout.config().clone();
        self.materialize(
            source,
            &digest,
            &config,
            &blobs,
            Some(layout_dir.to_path_buf()),
            owned,
            opts,
        )
    }

    /// Shared materialization: cache lookup, flatten, per-layer extraction.
    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &self,
        source: &str,
        digest: &str,
        config: &ImageConfiguration,
        blobs: &[LayerBlob],
        layout_dir: Option<PathBuf>,
        mut owned: Vec<PathBuf>,
        opts: &PrepareOptions,
    ) -> Result<Image> {
        if opts.use_cache {
            if let Some(mut image) = self.image_from_cache(source, digest, opts)? {
                image.layout_dir = layout_dir;
                image.owned = owned;
                return Ok(image);
            }
        }

        let base = if opts.use_cache {
            self.cache.staging_dir(digest)?
        } else {
            let dir = scratch_dir()?;
            owned.push(dir.clone());
            dir
        };

        let flat = base.join("flat");
        std::fs::create_dir_all(&flat)?;
        let mut metas = Vec::with_capacity(blobs.len());
        for blob in blobs {
            apply_layer(&blob.path, &flat)?;
            if opts.include_layers {
                let layer_dir = base.join("layers").join(digest_hex(&blob.digest));
                extract_layer(&blob.path, &layer_dir)?;
            }
            metas.push(CachedLayerMeta {
                digest: blob.digest.clone(),
                size: blob.size,
            });
        }

        // Persist metadata alongside the trees (the cache entry schema)
        std::fs::write(base.join("manifest.json"), serde_json::to_string_pretty(&metas)?)?;
        std::fs::write(base.join("config.json"), serde_json::to_string(config)?)?;

        let root = if opts.use_cache {
            let entry = self.cache.put(digest, &base)?;
            tracing::debug!(digest = %digest, entry = %entry.display(), "Materialized into cache");
            entry
        } else {
            base
        };

        let mut layers = self.layers_from_root(&root, blobs, opts)?;

        // A racing cache writer may have stored a layer-less entry; fall
        // back to image-owned layer extraction from the blobs we hold.
        if opts.include_layers && layers.iter().any(|l| l.fs_path.is_none()) {
            let scratch = scratch_dir()?;
            owned.push(scratch.clone());
            layers = extract_layers_to(&scratch, blobs)?;
        }

        Ok(Image {
            source: source.to_string(),
            digest: digest.to_string(),
            config: ConfigSummary::from_oci(config),
            history: history_commands(config),
            fs_path: root.join("flat"),
            layers,
            layout_dir,
            owned,
        })
    }

    /// Build an image from a cache entry, or None on miss (including a
    /// hit that lacks requested layer directories).
    fn image_from_cache(
        &self,
        source: &str,
        digest: &str,
        opts: &PrepareOptions,
    ) -> Result<Option<Image>> {
        let Some(entry) = self.cache.get(digest) else {
            return Ok(None);
        };

        let config: ImageConfiguration =
            serde_json::from_str(&std::fs::read_to_string(entry.join("config.json"))?)?;
        let metas: Vec<CachedLayerMeta> =
            serde_json::from_str(&std::fs::read_to_string(entry.join("manifest.json"))?)?;

        let mut layers = Vec::with_capacity(metas.len());
        for (index, meta) in metas.iter().enumerate() {
            let fs_path = if opts.include_layers {
                let dir = entry.join("layers").join(digest_hex(&meta.digest));
                if !dir.is_dir() {
                    // Entry was cached without layers; treat as a miss
                    return Ok(None);
                }
                Some(dir)
            } else {
                None
            };
            layers.push(Layer {
                index,
                digest: meta.digest.clone(),
                fs_path,
                size: meta.size,
            });
        }

        tracing::info!(source = %source, digest = %digest, "Using cached image filesystem");
        Ok(Some(Image {
            source: source.to_string(),
            digest: digest.to_string(),
            config: ConfigSummary::from_oci(&config),
            history: history_commands(&config),
            fs_path: entry.join("flat"),
            layers,
            layout_dir: None,
            owned: Vec::new(),
        }))
    }

    /// Layer records rooted at a materialized tree.
    fn layers_from_root(
        &self,
        root: &Path,
        blobs: &[LayerBlob],
        opts: &PrepareOptions,
    ) -> Result<Vec<Layer>> {
        Ok(blobs
            .iter()
            .enumerate()
            .map(|(index, blob)| {
                let fs_path = if opts.include_layers {
                    let dir = root.join("layers").join(digest_hex(&blob.digest));
                    dir.is_dir().then_some(dir)
                } else {
                    None
                };
                Layer {
                    index,
                    digest: blob.digest.clone(),
                    fs_path,
                    size: blob.size,
                }
            })
            .collect())
    }
}

/// Extract every blob into `<base>/<index>-<hex>/`, returning layer records.
fn extract_layers_to(base: &Path, blobs: &[LayerBlob]) -> Result<Vec<Layer>> {
    let mut layers = Vec::with_capacity(blobs.len());
    for (index, blob) in blobs.iter().enumerate() {
        let dir = base.join(format!("{}-{}", index, digest_hex(&blob.digest)));
        extract_layer(&blob.path, &dir)?;
        layers.push(Layer {
            index,
            digest: blob.digest.clone(),
            fs_path: Some(dir),
            size: blob.size,
        });
    }
    Ok(layers)
}

/// A fresh scratch directory under the system temp root.
fn scratch_dir() -> Result<PathBuf> {
    let suffix: String = (&mut OsRng)
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let dir = std::env::temp_dir().join(format!("shale-{}", suffix.to_lowercase()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::tests::StubDaemon;
    use crate::image::layout::tests::create_test_layout;
    use tempfile::TempDir;

    fn test_source(cache_root: &Path) -> ImageSource {
        ImageSource::new(
            RegistryAuth::anonymous(),
            ImageCache::new(cache_root).unwrap(),
            Arc::new(StubDaemon::default()),
            1,
        )
    }

    #[tokio::test]
    async fn test_prepare_plain_directory() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/os-release"), "ID=test\n").unwrap();

        let source = test_source(&tmp.path().join("cache"));
        let image = source
            .prepare(rootfs.to_str().unwrap(), &PrepareOptions::default())
            .await
            .unwrap();

        assert!(image.fs_path.join("etc/os-release").exists());
        assert!(image.layers.is_empty());
        assert!(image.owned.is_empty());
        assert!(image.digest.starts_with("sha256:"));

        // Cleanup must not touch the user's directory
        image.cleanup();
        assert!(rootfs.exists());
    }

    #[tokio::test]
    async fn test_prepare_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let source = test_source(&tmp.path().join("cache"));
        let result = source
            .prepare("dir:///definitely/not/here", &PrepareOptions::default())
            .await;
        assert!(matches!(result, Err(ShaleError::ReferenceInvalid { .. })));
    }

    #[tokio::test]
    async fn test_prepare_layout_directory_with_layers() {
        let tmp = TempDir::new().unwrap();
        let layout = tmp.path().join("layout");
        create_test_layout(&layout, &[("srv/app.conf", b"port=1")]);

        let source = test_source(&tmp.path().join("cache"));
        let opts = PrepareOptions {
            include_layers: true,
            ..Default::default()
        };
        let image = source
            .prepare(&format!("dir://{}", layout.display()), &opts)
            .await
            .unwrap();

        assert!(image.fs_path.join("srv/app.conf").exists());
        assert_eq!(image.layers.len(), 1);
        let layer_dir = image.layers[0].fs_path.as_ref().unwrap();
        assert!(layer_dir.join("srv/app.conf").exists());
        assert!(image.layers[0].size > 0);

        // The layout itself is not owned; only scratch dirs are removed
        image.cleanup();
        assert!(layout.exists());
    }

    #[tokio::test]
    async fn test_prepare_oci_archive_tarball() {
        let tmp = TempDir::new().unwrap();
        let layout = tmp.path().join("layout");
        create_test_layout(&layout, &[("bin/tool", b"elf")]);

        let tar_path = tmp.path().join("image.tar");
        {
            let file = std::fs::File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(".", &layout).unwrap();
            builder.finish().unwrap();
        }

        let source = test_source(&tmp.path().join("cache"));
        let image = source
            .prepare(tar_path.to_str().unwrap(), &PrepareOptions::default())
            .await
            .unwrap();

        assert!(image.fs_path.join("bin/tool").exists());
        assert_eq!(image.layers.len(), 1);
        assert!(image.layers[0].fs_path.is_none());

        let owned: Vec<_> = image.owned.clone();
        assert!(!owned.is_empty());
        image.cleanup();
        for dir in owned {
            assert!(!dir.exists());
        }
    }

    #[tokio::test]
    async fn test_prepare_uses_cache_on_second_call() {
        let tmp = TempDir::new().unwrap();
        let cache_root = tmp.path().join("cache");
        let layout = tmp.path().join("layout");
        let digest = create_test_layout(&layout, &[("etc/conf", b"x")]);

        let source = test_source(&cache_root);
        let reference = format!("dir://{}", layout.display());
        let opts = PrepareOptions {
            use_cache: true,
            ..Default::default()
        };

        let first = source.prepare(&reference, &opts).await.unwrap();
        assert!(first.fs_path.starts_with(&cache_root));

        let second = source.prepare(&reference, &opts).await.unwrap();
        assert_eq!(second.digest, digest);
        assert!(second.fs_path.starts_with(&cache_root));

        // Cleanup leaves the cache entry intact
        first.cleanup();
        second.cleanup();
        assert!(second.fs_path.join("etc/conf").exists());
    }

    #[tokio::test]
    async fn test_prepare_daemon_hits_cache_by_content_id() {
        let tmp = TempDir::new().unwrap();
        let cache_root = tmp.path().join("cache");
        let cache = ImageCache::new(&cache_root).unwrap();

        // Seed an entry under the stub daemon's content id
        let digest = "sha256:stub";
        let staged = cache.staging_dir(digest).unwrap();
        std::fs::create_dir_all(staged.join("flat/etc")).unwrap();
        std::fs::write(staged.join("flat/etc/os-release"), "ID=test\n").unwrap();
        std::fs::write(
            staged.join("config.json"),
            r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]},"history":[]}"#,
        )
        .unwrap();
        std::fs::write(staged.join("manifest.json"), "[]").unwrap();
        cache.put(digest, &staged).unwrap();

        let stub = Arc::new(StubDaemon::default());
        let source = ImageSource::new(RegistryAuth::anonymous(), cache, stub.clone(), 1);

        let opts = PrepareOptions {
            use_cache: true,
            ..Default::default()
        };
        let image = source.prepare("daemon://myapp:dev", &opts).await.unwrap();

        assert_eq!(image.digest, digest);
        assert!(image.fs_path.starts_with(&cache_root));
        assert!(image.fs_path.join("etc/os-release").exists());
        // The cached filesystem made the daemon export unnecessary
        assert!(stub.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_daemon_source() {
        // The stub daemon "saves" nothing, so materialization fails, but
        // the save call must be recorded and scratch space cleaned up.
        let tmp = TempDir::new().unwrap();
        let stub = Arc::new(StubDaemon::default());
        let source = ImageSource::new(
            RegistryAuth::anonymous(),
            ImageCache::new(tmp.path().join("cache")).unwrap(),
            stub.clone(),
            1,
        );

        let result = source
            .prepare("daemon://myapp:dev", &PrepareOptions::default())
            .await;
        assert!(result.is_err());
        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["save myapp:dev"]);
    }
}
