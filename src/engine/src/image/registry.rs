//! Registry client for pulling images.
//!
//! Uses the `oci-distribution` crate to pull manifests and blobs from
//! container registries and writes them as an OCI image layout on disk.
//! Transport operations are retried with exponential backoff before a
//! `Transport` error is surfaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use shale_core::error::{Result, ShaleError};

use super::reference::RegistryRef;

/// Base delay for transport retries; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Authentication from `SHALE_REGISTRY_USERNAME` /
    /// `SHALE_REGISTRY_PASSWORD`, anonymous when unset.
    pub fn from_env() -> Self {
        let username = std::env::var("SHALE_REGISTRY_USERNAME").ok();
        let password = std::env::var("SHALE_REGISTRY_PASSWORD").ok();
        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls images from container registries into OCI layouts.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
    retries: u32,
}

impl RegistryPuller {
    /// Create a puller with the given authentication and attempt count.
    pub fn new(auth: RegistryAuth, retries: u32) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
            retries: retries.max(1),
        }
    }

    /// Resolve the manifest digest for a reference without pulling blobs.
    pub async fn manifest_digest(&self, reference: &RegistryRef) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        let (client, oci_ref, auth) = (&self.client, &oci_ref, &auth);
        let (_manifest, digest) = self
            .with_retry(reference, || async move {
                client.pull_manifest(oci_ref, auth).await
            })
            .await?;
        Ok(digest)
    }

    /// Pull an image and write it as an OCI image layout to `target_dir`.
    ///
    /// The resulting directory will contain `oci-layout`, `index.json` and
    /// `blobs/sha256/...`. Returns the manifest digest.
    pub async fn pull(&self, reference: &RegistryRef, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)?;

        let (manifest, manifest_digest) = {
            let (client, oci_ref, auth) = (&self.client, &oci_ref, &auth);
            self.with_retry(reference, || async move {
                client.pull_manifest(oci_ref, auth).await
            })
            .await?
        };

        let image_manifest = match manifest {
            OciManifest::Image(image_manifest) => image_manifest,
            OciManifest::ImageIndex(_) => {
                // pull_manifest resolves platform-specific manifests for
                // multi-arch references; a raw index here means the
                // registry returned something we cannot unpack.
                return Err(ShaleError::Transport {
                    reference: reference.to_string(),
                    message: "registry returned an image index instead of a manifest".to_string(),
                });
            }
        };

        let manifest_json = serde_json::to_vec(&image_manifest)?;
        write_blob(&blobs_dir, &manifest_digest, &manifest_json)?;

        self.pull_image_content(reference, &oci_ref, &image_manifest, &blobs_dir)
            .await?;

        // Layout marker and index
        std::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        std::fs::write(
            target_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            "Image pulled successfully"
        );

        Ok(manifest_digest)
    }

    /// Pull config and layer blobs, writing each to the blobs directory.
    async fn pull_image_content(
        &self,
        reference: &RegistryRef,
        oci_ref: &Reference,
        manifest: &OciImageManifest,
        blobs_dir: &Path,
    ) -> Result<()> {
        let client = &self.client;

        let config_descriptor = &manifest.config;
        let config_data = self
            .with_retry(reference, || async move {
                let mut buf: Vec<u8> = Vec::new();
                client.pull_blob(oci_ref, config_descriptor, &mut buf).await?;
                Ok::<_, oci_distribution::errors::OciDistributionError>(buf)
            })
            .await?;
        write_blob(blobs_dir, &config_descriptor.digest, &config_data)?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            let layer_data = self
                .with_retry(reference, || async move {
                    let mut buf: Vec<u8> = Vec::new();
                    client.pull_blob(oci_ref, layer, &mut buf).await?;
                    Ok::<_, oci_distribution::errors::OciDistributionError>(buf)
                })
                .await?;
            write_blob(blobs_dir, &layer.digest, &layer_data)?;
        }

        Ok(())
    }

    /// Run a transport operation with exponential backoff.
    async fn with_retry<T, E, F, Fut>(&self, reference: &RegistryRef, mut op: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.retries {
                        tracing::warn!(
                            reference = %reference,
                            attempt,
                            error = %last_error,
                            "Transport error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(ShaleError::Transport {
            reference: reference.to_string(),
            message: format!("{} attempts failed: {}", self.retries, last_error),
        })
    }
}

fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8]) -> Result<PathBuf> {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    let path = blobs_dir.join(hex);
    std::fs::write(&path, data)?;
    Ok(path)
}

fn to_oci_reference(reference: &RegistryRef) -> Result<Reference> {
    let ref_str = if let Some(ref digest) = reference.digest {
        format!("{}/{}@{}", reference.registry, reference.repository, digest)
    } else if let Some(ref tag) = reference.tag {
        format!("{}/{}:{}", reference.registry, reference.repository, tag)
    } else {
        format!("{}/{}:latest", reference.registry, reference.repository)
    };

    ref_str
        .parse::<Reference>()
        .map_err(|e| ShaleError::ReferenceInvalid {
            reference: ref_str,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        match auth.to_oci_auth() {
            OciRegistryAuth::Basic(u, p) => {
                assert_eq!(u, "user");
                assert_eq!(p, "pass");
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[test]
    fn test_to_oci_reference() {
        let r = RegistryRef::parse("ghcr.io/acme/tool:v1").unwrap();
        let oci = to_oci_reference(&r).unwrap();
        assert_eq!(oci.registry(), "ghcr.io");
        assert_eq!(oci.repository(), "acme/tool");
        assert_eq!(oci.tag(), Some("v1"));
    }

    #[tokio::test]
    async fn test_with_retry_exhausts() {
        let puller = RegistryPuller::new(RegistryAuth::anonymous(), 2);
        let r = RegistryRef::parse("example.com/app:v1").unwrap();
        let attempts = std::cell::Cell::new(0u32);

        let result: Result<()> = puller
            .with_retry(&r, || {
                attempts.set(attempts.get() + 1);
                async { Err::<(), _>("connection refused") }
            })
            .await;

        assert_eq!(attempts.get(), 2);
        match result {
            Err(ShaleError::Transport { message, .. }) => {
                assert!(message.contains("connection refused"))
            }
            other => panic!("expected transport error, got {:?}", other.err()),
        }
    }
}
