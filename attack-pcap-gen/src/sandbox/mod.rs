//! Sandbox lifecycle management
//!
//! A `Sandbox` walks one disposable container through
//! `Absent -> Pulling -> Created -> Running -> Executing -> CaptureCopied
//! -> Stopped -> Removed`. Teardown is attempted from any state past
//! `Absent`, including after a failed step, and is safe to repeat.

pub mod archive;
pub mod docker;
pub mod engine;

pub use docker::DockerCli;
pub use engine::{ContainerEngine, ExecOutcome};

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{
    validate_container_name, validate_image_name, DEFAULT_CAPTURE_PATH, DEFAULT_COMMAND,
    DEFAULT_CONTAINER_NAME, DEFAULT_IMAGE,
};
use crate::error::{Error, Result, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Absent,
    Pulling,
    Created,
    Running,
    Executing,
    CaptureCopied,
    Stopped,
    Removed,
}

/// What to run and where the capture lands inside the container
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub container_name: String,
    pub capture_path: String,
    pub command: String,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            capture_path: DEFAULT_CAPTURE_PATH.to_string(),
            command: DEFAULT_COMMAND.to_string(),
        }
    }
}

impl SandboxSpec {
    pub fn validate(&self) -> Result<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.container_name)?;
        if !self.capture_path.starts_with('/') {
            return Err(Error::config("capture_path", "must be an absolute path"));
        }
        if self.command.trim().is_empty() {
            return Err(Error::config("command", "cannot be empty"));
        }
        Ok(())
    }
}

/// Awaitable in-sandbox command
pub struct ExecHandle {
    task: JoinHandle<Result<ExecOutcome>>,
}

impl ExecHandle {
    pub async fn wait(self) -> Result<ExecOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::lifecycle(Stage::Exec, "command aborted")),
            Err(e) => Err(Error::lifecycle(Stage::Exec, format!("command task failed: {}", e))),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub struct Sandbox {
    engine: Arc<dyn ContainerEngine>,
    spec: SandboxSpec,
    state: LifecycleState,
    container_id: Option<String>,
    network_address: Option<IpAddr>,
    session_start_us: Option<i64>,
}

impl Sandbox {
    pub fn new(engine: Arc<dyn ContainerEngine>, spec: SandboxSpec) -> Self {
        Self {
            engine,
            spec,
            state: LifecycleState::Absent,
            container_id: None,
            network_address: None,
            session_start_us: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.spec.container_name
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn network_address(&self) -> Option<IpAddr> {
        self.network_address
    }

    /// Wall-clock microseconds recorded when the container was started
    pub fn session_start_us(&self) -> Option<i64> {
        self.session_start_us
    }

    fn expect_state(&self, stage: Stage, expected: LifecycleState) -> Result<()> {
        if self.state != expected {
            return Err(Error::lifecycle(
                stage,
                format!("expected {:?}, sandbox is {:?}", expected, self.state),
            ));
        }
        Ok(())
    }

    /// Remove any stale container, make sure the image is present, create a fresh container
    pub async fn prepare(&mut self) -> Result<()> {
        self.expect_state(Stage::Create, LifecycleState::Absent)?;
        let name = self.spec.container_name.clone();

        if self.engine.container_exists(&name).await? {
            info!(container = %name, "Removing stale container");
            if let Err(e) = self.engine.stop(&name).await {
                debug!(container = %name, "Stale container was not running: {}", e);
            }
            self.engine
                .remove(&name)
                .await
                .map_err(|e| Error::lifecycle(Stage::Cleanup, e.to_string()))?;
        }

        if !self.engine.image_exists(&self.spec.image).await? {
            self.state = LifecycleState::Pulling;
            self.engine.pull(&self.spec.image).await.map_err(|e| match e {
                Error::Image { .. } => e,
                other => Error::Image {
                    image: self.spec.image.clone(),
                    reason: other.to_string(),
                },
            })?;
        }

        let id = self.engine.create(&self.spec.image, &name).await?;
        info!(container = %name, id = %id, "Sandbox created from {}", self.spec.image);
        self.container_id = Some(id);
        self.state = LifecycleState::Created;
        Ok(())
    }

    /// Start the container, record the session start and discover its address
    pub async fn start(&mut self) -> Result<IpAddr> {
        self.expect_state(Stage::Start, LifecycleState::Created)?;
        let name = self.spec.container_name.clone();

        self.engine.start(&name).await?;
        self.session_start_us = Some(chrono::Utc::now().timestamp_micros());
        self.state = LifecycleState::Running;

        let address = self.engine.inspect_address(&name).await?;
        self.network_address = Some(address);
        info!(container = %name, address = %address, "Sandbox running");
        Ok(address)
    }

    /// Launch `command` inside the sandbox without waiting for it
    pub fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<ExecHandle> {
        self.expect_state(Stage::Exec, LifecycleState::Running)?;
        let engine = self.engine.clone();
        let name = self.spec.container_name.clone();
        let command = command.to_string();

        info!(container = %name, "Executing: {}", command);
        let task = tokio::spawn(async move {
            let run = engine.exec(&name, &command);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                    Error::lifecycle(
                        Stage::Exec,
                        format!("command did not finish within {:?}", limit),
                    )
                })?,
                None => run.await,
            }
        });

        self.state = LifecycleState::Executing;
        Ok(ExecHandle { task })
    }

    /// Copy the capture file out of the container to `dest`
    pub async fn copy_capture(&mut self, dest: &Path) -> Result<u64> {
        self.expect_state(Stage::Copy, LifecycleState::Executing)?;
        let archive = self
            .engine
            .copy_archive(&self.spec.container_name, &self.spec.capture_path)
            .await?;
        let size = archive::extract_single_file(&archive, dest)?;
        info!(
            container = %self.spec.container_name,
            "Copied {} ({} bytes) to {}",
            self.spec.capture_path,
            size,
            dest.display()
        );
        self.state = LifecycleState::CaptureCopied;
        Ok(size)
    }

    /// Stop and remove the container. Both steps are attempted; the first error is returned.
    pub async fn teardown(&mut self) -> Result<()> {
        if matches!(
            self.state,
            LifecycleState::Absent | LifecycleState::Pulling | LifecycleState::Removed
        ) {
            return Ok(());
        }
        let name = self.spec.container_name.clone();
        let mut first_error = None;

        if self.state < LifecycleState::Stopped {
            match self.engine.stop(&name).await {
                Ok(()) => info!(container = %name, "Sandbox stopped"),
                Err(e) => {
                    warn!(container = %name, "Failed to stop sandbox: {}", e);
                    first_error = Some(e);
                }
            }
            self.state = LifecycleState::Stopped;
        }

        match self.engine.remove(&name).await {
            Ok(()) => {
                info!(container = %name, "Sandbox removed");
                self.state = LifecycleState::Removed;
            }
            Err(e) => {
                error!(container = %name, "Failed to remove sandbox: {}", e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !matches!(
            self.state,
            LifecycleState::Absent | LifecycleState::Pulling | LifecycleState::Removed
        ) {
            warn!(
                container = %self.spec.container_name,
                "Sandbox dropped in state {:?} without teardown",
                self.state
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeEngine;

    fn sandbox(engine: &Arc<FakeEngine>) -> Sandbox {
        Sandbox::new(engine.clone(), SandboxSpec::default())
    }

    #[test]
    fn test_spec_validation() {
        SandboxSpec::default().validate().unwrap();
        let relative = SandboxSpec {
            capture_path: "capture.pcap".into(),
            ..SandboxSpec::default()
        };
        assert!(relative.validate().is_err());
        let blank = SandboxSpec {
            command: "  ".into(),
            ..SandboxSpec::default()
        };
        assert!(blank.validate().is_err());
    }

    #[tokio::test]
    async fn test_full_lifecycle_order() {
        let engine = Arc::new(FakeEngine::new());
        let mut sb = sandbox(&engine);

        sb.prepare().await.unwrap();
        assert_eq!(sb.state(), LifecycleState::Created);
        let address = sb.start().await.unwrap();
        assert_eq!(address, engine.address());
        assert!(sb.session_start_us().is_some());

        let handle = sb.exec("true", None).unwrap();
        assert!(handle.wait().await.unwrap().success());

        let dir = tempfile::tempdir().unwrap();
        sb.copy_capture(&dir.path().join("capture.pcap")).await.unwrap();
        assert_eq!(sb.state(), LifecycleState::CaptureCopied);

        sb.teardown().await.unwrap();
        assert_eq!(sb.state(), LifecycleState::Removed);
        assert_eq!(
            engine.call_names(),
            vec![
                "container_exists",
                "image_exists",
                "create",
                "start",
                "inspect_address",
                "exec",
                "copy_archive",
                "stop",
                "remove"
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_container_removed_before_create() {
        let engine = Arc::new(FakeEngine::new().with_stale_container());
        let mut sb = sandbox(&engine);
        sb.prepare().await.unwrap();
        sb.teardown().await.unwrap();

        let calls = engine.call_names();
        assert_eq!(&calls[..4], &["container_exists", "stop", "remove", "image_exists"]);
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled_and_failure_is_fatal() {
        let engine = Arc::new(FakeEngine::new().without_image());
        let mut sb = sandbox(&engine);
        sb.prepare().await.unwrap();
        sb.teardown().await.unwrap();
        assert!(engine.call_names().contains(&"pull".to_string()));

        let failing = Arc::new(FakeEngine::new().without_image().with_failing_pull());
        let mut sb = sandbox(&failing);
        let err = sb.prepare().await.unwrap_err();
        assert!(matches!(err, Error::Image { .. }));
        assert_eq!(sb.state(), LifecycleState::Pulling);
        assert!(!failing.call_names().contains(&"create".to_string()));
        // Nothing was created, so teardown has nothing to do
        sb.teardown().await.unwrap();
        assert!(!failing.call_names().contains(&"remove".to_string()));
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let engine = Arc::new(FakeEngine::new());
        let mut sb = sandbox(&engine);
        assert!(matches!(
            sb.start().await,
            Err(Error::Lifecycle { stage: Stage::Start, .. })
        ));
        assert!(sb.exec("true", None).is_err());

        sb.prepare().await.unwrap();
        assert!(sb.prepare().await.is_err());
        sb.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let mut sb = sandbox(&engine);
        sb.prepare().await.unwrap();
        sb.start().await.unwrap();
        sb.teardown().await.unwrap();
        sb.teardown().await.unwrap();

        let calls = engine.call_names();
        assert_eq!(calls.iter().filter(|c| *c == "stop").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "remove").count(), 1);
    }

    #[tokio::test]
    async fn test_exec_timeout_reports_lifecycle_error() {
        let engine = Arc::new(FakeEngine::new().with_exec_delay(Duration::from_secs(5)));
        let mut sb = sandbox(&engine);
        sb.prepare().await.unwrap();
        sb.start().await.unwrap();

        let handle = sb.exec("sleep", Some(Duration::from_millis(50))).unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle { stage: Stage::Exec, .. }));
        sb.teardown().await.unwrap();
    }
}
