use async_trait::async_trait;
use std::net::IpAddr;

use crate::error::Result;

/// Result of a command run inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Minimal set of container operations one session needs
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull(&self, image: &str) -> Result<()>;

    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Create the container and return its id
    async fn create(&self, image: &str, name: &str) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Run `command` through a shell inside the container and wait for it
    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutcome>;

    /// Address of the container on its first network
    async fn inspect_address(&self, name: &str) -> Result<IpAddr>;

    /// Tar stream holding the file at `path`
    async fn copy_archive(&self, name: &str, path: &str) -> Result<Vec<u8>>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;
}
