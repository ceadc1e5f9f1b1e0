//! Local libvirt daemon in a container, for QEMU clusters without a
//! libvirt URI

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use constellation_common::fs::{atomic_write, remove_file_if_exists};
use constellation_common::{Error, Result};

/// File recording the name of the started container
pub const CONTAINER_NAME_FILE: &str = "libvirt.name";

/// Starts and stops the local libvirt daemon
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LibvirtRunner: Send + Sync {
    /// Start a daemon for cluster `name` from `image`
    async fn start(&self, name: &str, image: &str, cancel: &CancellationToken) -> Result<()>;

    /// Stop the daemon; stopping a stopped daemon succeeds
    async fn stop(&self) -> Result<()>;
}

/// [`LibvirtRunner`] using the `docker` CLI
#[derive(Clone, Debug)]
pub struct DockerLibvirtRunner {
    program: PathBuf,
    leading_args: Vec<String>,
    state_dir: PathBuf,
}

impl DockerLibvirtRunner {
    /// Runner recording its container under `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("docker"),
            leading_args: Vec::new(),
            state_dir: state_dir.into(),
        }
    }

    /// Use `program args...` instead of `docker`
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.leading_args = args;
        self
    }

    fn name_file(&self) -> PathBuf {
        self.state_dir.join(CONTAINER_NAME_FILE)
    }

    async fn docker(&self, args: &[&str], cancel: Option<&CancellationToken>) -> Result<std::process::Output> {
        debug!(?args, "running docker");
        let child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::internal_with_context("libvirt", format!("starting docker: {}", e)))?;
        let output = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::cancelled("starting libvirt")),
                out = child.wait_with_output() => out,
            },
            None => child.wait_with_output().await,
        };
        output.map_err(|e| Error::internal_with_context("libvirt", e.to_string()))
    }
}

fn read_name(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(name) if !name.trim().is_empty() => Ok(Some(name.trim().to_string())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io("libvirt", path, e)),
    }
}

#[async_trait]
impl LibvirtRunner for DockerLibvirtRunner {
    async fn start(&self, name: &str, image: &str, cancel: &CancellationToken) -> Result<()> {
        let container = format!("{}-libvirt", name);
        if read_name(&self.name_file())?.as_deref() == Some(container.as_str()) {
            debug!(container = %container, "Libvirt container already recorded");
            return Ok(());
        }

        info!(container = %container, image = %image, "Starting libvirt container");
        let output = self
            .docker(
                &[
                    "run",
                    "--detach",
                    "--rm",
                    "--name",
                    &container,
                    "--network",
                    "host",
                    "--privileged",
                    "--volume",
                    "/dev:/dev",
                    "--volume",
                    "/var/lib/libvirt:/var/lib/libvirt",
                    image,
                ],
                Some(cancel),
            )
            .await?;
        if !output.status.success() {
            return Err(Error::internal_with_context(
                "libvirt",
                format!(
                    "docker run {} failed: {}",
                    container,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        atomic_write(&self.name_file(), container.as_bytes())
    }

    async fn stop(&self) -> Result<()> {
        let Some(container) = read_name(&self.name_file())? else {
            debug!("No libvirt container recorded");
            return Ok(());
        };
        info!(container = %container, "Stopping libvirt container");
        let output = self.docker(&["rm", "--force", &container], None).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !stderr.contains("No such container") {
            return Err(Error::internal_with_context(
                "libvirt",
                format!("docker rm {} failed: {}", container, stderr.trim()),
            ));
        }
        remove_file_if_exists(&self.name_file())
    }
}
