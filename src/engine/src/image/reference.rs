//! Image reference parsing and classification.
//!
//! A user-supplied reference string is classified into one of four source
//! kinds before any image work starts:
//!
//! - `daemon://<name>` — image held by the local container daemon
//! - `tar://<path>` or a path ending in `.tar` — image tarball on disk
//! - `dir://<path>` or an existing directory — pre-unpacked filesystem
//! - anything else — remote registry reference `name[:tag][@digest]`

use std::path::{Path, PathBuf};

use shale_core::error::{Result, ShaleError};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// A classified image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Remote registry reference
    Registry(RegistryRef),
    /// Image in the local container daemon
    Daemon(String),
    /// Image tarball on disk (OCI archive or docker-save format)
    Tarball(PathBuf),
    /// Pre-unpacked directory
    Directory(PathBuf),
}

/// Parsed registry reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRef {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx")
    pub repository: String,
    /// Tag (e.g., "latest")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageRef {
    /// Classify and parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ShaleError::ReferenceInvalid {
                reference: reference.to_string(),
                message: "empty image reference".to_string(),
            });
        }

        if let Some(name) = reference.strip_prefix("daemon://") {
            if name.is_empty() {
                return Err(ShaleError::ReferenceInvalid {
                    reference: reference.to_string(),
                    message: "empty daemon image name".to_string(),
                });
            }
            return Ok(ImageRef::Daemon(name.to_string()));
        }

        if let Some(path) = reference.strip_prefix("tar://") {
            return Ok(ImageRef::Tarball(PathBuf::from(path)));
        }

        if let Some(path) = reference.strip_prefix("dir://") {
            return Ok(ImageRef::Directory(PathBuf::from(path)));
        }

        // Bare paths: an existing .tar file or an existing directory wins
        // over registry interpretation.
        let as_path = Path::new(reference);
        if reference.ends_with(".tar") {
            return Ok(ImageRef::Tarball(as_path.to_path_buf()));
        }
        if as_path.is_dir() {
            return Ok(ImageRef::Directory(as_path.to_path_buf()));
        }

        Ok(ImageRef::Registry(RegistryRef::parse(reference)?))
    }
}

impl RegistryRef {
    /// Parse a registry reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `ghcr.io/org/image:tag`
    /// - `ghcr.io/org/image@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(ShaleError::ReferenceInvalid {
                    reference: reference.to_string(),
                    message: "digest must be algorithm:hex".to_string(),
                });
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split tag: last colon after the last slash
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => {
                        let tag = &after_slash[colon_pos + 1..];
                        let name = &name_tag[..slash_pos + 1 + colon_pos];
                        (name.to_string(), Some(tag.to_string()))
                    }
                    None => (name_tag.to_string(), None),
                }
            }
            None => match name_tag.rfind(':') {
                Some(colon_pos) => {
                    // Could be registry:port; a numeric suffix is a port
                    let after_colon = &name_tag[colon_pos + 1..];
                    if after_colon.chars().all(|c| c.is_ascii_digit()) {
                        (name_tag.to_string(), None)
                    } else {
                        (
                            name_tag[..colon_pos].to_string(),
                            Some(after_colon.to_string()),
                        )
                    }
                }
                None => (name_tag.to_string(), None),
            },
        };

        let (registry, repository) = Self::split_registry_repository(&name)?;

        // Apply default tag only when neither tag nor digest pins the image
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(RegistryRef {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname if it contains a dot
        // or colon, or is "localhost".
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(ShaleError::ReferenceInvalid {
                        reference: name.to_string(),
                        message: "empty repository".to_string(),
                    });
                }
                return Ok((first.to_string(), repo));
            }
        }

        // No registry detected — use the default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" on Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// The full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for RegistryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_daemon() {
        let r = ImageRef::parse("daemon://myapp:dev").unwrap();
        assert_eq!(r, ImageRef::Daemon("myapp:dev".to_string()));
    }

    #[test]
    fn test_classify_daemon_empty() {
        assert!(ImageRef::parse("daemon://").is_err());
    }

    #[test]
    fn test_classify_tar_scheme() {
        let r = ImageRef::parse("tar:///images/app.tar").unwrap();
        assert_eq!(r, ImageRef::Tarball(PathBuf::from("/images/app.tar")));
    }

    #[test]
    fn test_classify_tar_suffix() {
        let r = ImageRef::parse("build/output.tar").unwrap();
        assert_eq!(r, ImageRef::Tarball(PathBuf::from("build/output.tar")));
    }

    #[test]
    fn test_classify_dir_scheme() {
        let r = ImageRef::parse("dir:///unpacked/rootfs").unwrap();
        assert_eq!(r, ImageRef::Directory(PathBuf::from("/unpacked/rootfs")));
    }

    #[test]
    fn test_classify_existing_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let r = ImageRef::parse(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(r, ImageRef::Directory(tmp.path().to_path_buf()));
    }

    #[test]
    fn test_classify_registry_default() {
        let r = ImageRef::parse("nginx:1.25").unwrap();
        match r {
            ImageRef::Registry(reg) => {
                assert_eq!(reg.registry, "docker.io");
                assert_eq!(reg.repository, "library/nginx");
                assert_eq!(reg.tag, Some("1.25".to_string()));
            }
            other => panic!("expected registry ref, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_name() {
        let r = RegistryRef::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = RegistryRef::parse("ghcr.io/acme/tool:v2.1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "acme/tool");
        assert_eq!(r.tag, Some("v2.1".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = RegistryRef::parse(
            "ghcr.io/acme/tool@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        assert_eq!(r.tag, None);
        assert!(r.digest.unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = RegistryRef::parse("registry.local:5000/app:v1").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_localhost() {
        let r = RegistryRef::parse("localhost/app").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(RegistryRef::parse("nginx@invaliddigest").is_err());
    }

    #[test]
    fn test_full_reference_round_trip() {
        let r = RegistryRef::parse("ghcr.io/acme/tool:v2.1").unwrap();
        assert_eq!(r.full_reference(), "ghcr.io/acme/tool:v2.1");
    }
}
