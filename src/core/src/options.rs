//! Image preparation options.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShaleError};

/// Target platform for multi-platform manifest selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (e.g., "linux")
    pub os: String,
    /// CPU architecture (e.g., "amd64", "arm64")
    pub architecture: String,
}

impl Platform {
    /// The platform of the host this process runs on.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: architecture.to_string(),
        }
    }

    /// Parse an "os/arch" pair, e.g. "linux/arm64".
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
            }),
            _ => Err(ShaleError::ReferenceInvalid {
                reference: s.to_string(),
                message: "expected os/arch, e.g. linux/amd64".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Options controlling how an image is materialized.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Extract every layer to its own directory in addition to the
    /// flattened filesystem.
    pub include_layers: bool,

    /// Consult the unpack cache before extracting; populate it on miss.
    pub use_cache: bool,

    /// Platform to select from a multi-platform index. None means host.
    pub platform: Option<Platform>,

    /// Number of attempts for registry transport operations.
    pub retries: u32,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            include_layers: false,
            use_cache: false,
            platform: None,
            retries: 3,
        }
    }
}

impl PrepareOptions {
    /// The platform to match against, defaulting to the host.
    pub fn target_platform(&self) -> Platform {
        self.platform.clone().unwrap_or_else(Platform::host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        let p = Platform::parse("linux/arm64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm64");
        assert_eq!(p.to_string(), "linux/arm64");
    }

    #[test]
    fn test_platform_parse_invalid() {
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("/amd64").is_err());
        assert!(Platform::parse("linux/").is_err());
    }

    #[test]
    fn test_default_options() {
        let opts = PrepareOptions::default();
        assert!(!opts.include_layers);
        assert!(!opts.use_cache);
        assert_eq!(opts.retries, 3);
    }
}
