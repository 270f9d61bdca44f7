//! Local container daemon collaborator.
//!
//! The daemon is reached through the [`DaemonClient`] capability so the
//! analyzers that need it (the rpm fallback, the `daemon://` source) can
//! be exercised against a stub. The production implementation shells out
//! to the `docker` CLI. Exclusive daemon operations are serialized by
//! [`gate::DaemonGate`].

pub mod gate;

use std::path::Path;
use std::process::Command;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use shale_core::error::{Result, ShaleError};

/// Capability for talking to the local container daemon.
pub trait DaemonClient: Send + Sync {
    /// Export a daemon-held image to a tarball on disk.
    fn save(&self, image: &str, dest: &Path) -> Result<()>;

    /// Load an image archive into the daemon and tag it.
    ///
    /// Returns the tag under which the image is now addressable.
    fn load(&self, archive: &Path, tag: &str) -> Result<String>;

    /// Run a container from `image` with the given entrypoint, wait for
    /// it, and return captured stdout. Non-zero exit is an error.
    fn run_capture(&self, image: &str, entrypoint: &[String]) -> Result<String>;

    /// Remove an image from the daemon.
    fn remove_image(&self, image: &str) -> Result<()>;

    /// Whether an image with this name exists in the daemon.
    fn image_exists(&self, image: &str) -> bool;

    /// The daemon's content identifier for an image (e.g. "sha256:...").
    fn image_id(&self, image: &str) -> Result<String>;
}

/// `docker` CLI backed daemon client.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        tracing::debug!(args = ?args, "Running docker");
        Command::new("docker")
            .args(args)
            .output()
            .map_err(|e| ShaleError::Daemon(format!("failed to invoke docker: {}", e)))
    }

    fn docker_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.docker(args)?;
        if !output.status.success() {
            return Err(ShaleError::SubprocessFailed {
                tool: "docker".to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DaemonClient for DockerCli {
    fn save(&self, image: &str, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy();
        self.docker_checked(&["save", "-o", dest_str.as_ref(), image])?;
        Ok(())
    }

    fn load(&self, archive: &Path, tag: &str) -> Result<String> {
        let archive_str = archive.to_string_lossy();
        let stdout = self.docker_checked(&["load", "-i", archive_str.as_ref()])?;

        // docker prints either "Loaded image: name:tag" or
        // "Loaded image ID: sha256:..."
        let loaded = stdout
            .lines()
            .rev()
            .find_map(|line| {
                line.strip_prefix("Loaded image: ")
                    .or_else(|| line.strip_prefix("Loaded image ID: "))
            })
            .map(str::trim)
            .ok_or_else(|| {
                ShaleError::Daemon(format!("unexpected docker load output: {}", stdout.trim()))
            })?;

        self.docker_checked(&["tag", loaded, tag])?;
        tracing::info!(loaded = %loaded, tag = %tag, "Loaded image into daemon");
        Ok(tag.to_string())
    }

    fn run_capture(&self, image: &str, entrypoint: &[String]) -> Result<String> {
        let (program, args) = entrypoint.split_first().ok_or_else(|| {
            ShaleError::Daemon("empty entrypoint for container run".to_string())
        })?;

        let mut cmd_args: Vec<&str> = vec!["run", "--rm", "--entrypoint", program, image];
        cmd_args.extend(args.iter().map(String::as_str));
        self.docker_checked(&cmd_args)
    }

    fn remove_image(&self, image: &str) -> Result<()> {
        self.docker_checked(&["rmi", "-f", image])?;
        Ok(())
    }

    fn image_exists(&self, image: &str) -> bool {
        self.docker(&["image", "inspect", image])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn image_id(&self, image: &str) -> Result<String> {
        let id = self.docker_checked(&["image", "inspect", "--format", "{{.Id}}", image])?;
        Ok(id.trim().to_string())
    }
}

/// Generate a daemon tag that is not already in use.
///
/// Tags are drawn from the OS entropy source so concurrent processes
/// cannot collide the way a time-seeded generator would.
pub fn generate_query_tag(client: &dyn DaemonClient) -> String {
    loop {
        let suffix: String = (&mut OsRng)
            .sample_iter(Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let tag = format!("shale_query:{}", suffix.to_lowercase());
        if !client.image_exists(&tag) {
            return tag;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted daemon stub shared by rpm fallback and gate tests.
    #[derive(Debug, Default)]
    pub(crate) struct StubDaemon {
        /// stdout returned by run_capture
        pub run_output: String,
        /// Recorded method invocations, in order
        pub calls: Mutex<Vec<String>>,
    }

    impl StubDaemon {
        pub fn with_run_output(output: &str) -> Self {
            Self {
                run_output: output.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl DaemonClient for StubDaemon {
        fn save(&self, image: &str, _dest: &Path) -> Result<()> {
            self.record(format!("save {}", image));
            Ok(())
        }

        fn load(&self, _archive: &Path, tag: &str) -> Result<String> {
            self.record(format!("load {}", tag));
            Ok(tag.to_string())
        }

        fn run_capture(&self, image: &str, entrypoint: &[String]) -> Result<String> {
            self.record(format!("run {} {}", image, entrypoint.join(" ")));
            Ok(self.run_output.clone())
        }

        fn remove_image(&self, image: &str) -> Result<()> {
            self.record(format!("rmi {}", image));
            Ok(())
        }

        fn image_exists(&self, _image: &str) -> bool {
            false
        }

        fn image_id(&self, _image: &str) -> Result<String> {
            Ok("sha256:stub".to_string())
        }
    }

    #[test]
    fn test_generate_query_tag_shape() {
        let stub = StubDaemon::default();
        let tag = generate_query_tag(&stub);
        let (repo, suffix) = tag.split_once(':').unwrap();
        assert_eq!(repo, "shale_query");
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_query_tag_unique() {
        let stub = StubDaemon::default();
        let a = generate_query_tag(&stub);
        let b = generate_query_tag(&stub);
        assert_ne!(a, b);
    }
}
