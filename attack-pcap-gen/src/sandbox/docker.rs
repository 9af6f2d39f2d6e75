use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::engine::{ContainerEngine, ExecOutcome};
use crate::error::{Error, Result, Stage};

pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Ask the daemon for its version; an unreachable engine is fatal
    pub async fn connect() -> Result<Self> {
        Self::connect_with("docker").await
    }

    pub async fn connect_with(binary: &str) -> Result<Self> {
        let output = Command::new(binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| Error::Connectivity(format!("failed to run {}: {}", binary, e)))?;

        if !output.status.success() {
            return Err(Error::Connectivity(stderr_text(&output)));
        }

        info!(
            "Connected to container engine {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(Self {
            binary: binary.to_string(),
        })
    }

    async fn output(&self, args: &[&str]) -> std::io::Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary).args(args).output().await
    }

    /// Run and require a zero exit status
    async fn checked(&self, stage: Stage, args: &[&str]) -> Result<Output> {
        let output = self
            .output(args)
            .await
            .map_err(|e| Error::lifecycle(stage, e.to_string()))?;
        if !output.status.success() {
            return Err(Error::lifecycle(stage, stderr_text(&output)));
        }
        Ok(output)
    }
}

fn stderr_text(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if text.is_empty() {
        format!("exited with {}", output.status)
    } else {
        text
    }
}

/// Log each line of `stream` as it arrives, returning the number of lines relayed
async fn relay_lines<R: AsyncRead + Unpin>(
    stream: R,
    name: String,
    source: &'static str,
) -> usize {
    let mut lines = BufReader::new(stream).lines();
    let mut relayed = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(container = %name, "[{}] {}", source, line);
                relayed += 1;
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {} of {}: {}", source, name, e);
                break;
            }
        }
    }
    relayed
}

/// Address of the first network in an inspected `Networks` map.
///
/// serde_json keeps map keys sorted, so "first" means first by network name.
pub fn first_network_address(networks_json: &str) -> Result<IpAddr> {
    let networks: serde_json::Map<String, Value> = serde_json::from_str(networks_json.trim())
        .map_err(|e| Error::lifecycle(Stage::Inspect, format!("unparseable networks: {}", e)))?;

    if networks.len() > 1 {
        info!(
            "Container is attached to {} networks, using {:?}",
            networks.len(),
            networks.keys().next()
        );
    }

    let (network, settings) = networks
        .iter()
        .next()
        .ok_or_else(|| Error::lifecycle(Stage::Inspect, "container has no networks"))?;

    let address = settings
        .get("IPAddress")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            settings
                .get("GlobalIPv6Address")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        })
        .ok_or_else(|| {
            Error::lifecycle(
                Stage::Inspect,
                format!("network {} has no address assigned", network),
            )
        })?;

    address.parse().map_err(|e| {
        Error::lifecycle(
            Stage::Inspect,
            format!("invalid address {:?} on {}: {}", address, network, e),
        )
    })
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self
            .output(&["image", "inspect", image])
            .await
            .map_err(|e| Error::lifecycle(Stage::Create, e.to_string()))?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);
        let output = self.output(&["pull", image]).await.map_err(|e| Error::Image {
            image: image.to_string(),
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(Error::Image {
                image: image.to_string(),
                reason: stderr_text(&output),
            });
        }
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^/{}$", name);
        let output = self
            .checked(
                Stage::Cleanup,
                &["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"],
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.trim() == name))
    }

    async fn create(&self, image: &str, name: &str) -> Result<String> {
        let output = self
            .checked(Stage::Create, &["create", "--name", name, "-t", image])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.checked(Stage::Start, &["start", name]).await?;
        Ok(())
    }

    async fn exec(&self, name: &str, command: &str) -> Result<ExecOutcome> {
        let mut child = Command::new(&self.binary)
            .args(["exec", name, "bash", "-c", command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::lifecycle(Stage::Exec, e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let relay_out = async {
            if let Some(out) = stdout {
                relay_lines(out, name.to_string(), "stdout").await;
            }
        };
        let relay_err = async {
            if let Some(err) = stderr {
                relay_lines(err, name.to_string(), "stderr").await;
            }
        };
        let (status, _, _) = tokio::join!(child.wait(), relay_out, relay_err);
        let status = status.map_err(|e| Error::lifecycle(Stage::Exec, e.to_string()))?;

        let outcome = ExecOutcome {
            exit_code: status.code(),
        };
        if !outcome.success() {
            warn!(container = %name, "Sandbox command exited with {}", status);
        }
        Ok(outcome)
    }

    async fn inspect_address(&self, name: &str) -> Result<IpAddr> {
        let output = self
            .checked(
                Stage::Inspect,
                &["inspect", "--format", "{{json .NetworkSettings.Networks}}", name],
            )
            .await?;
        first_network_address(&String::from_utf8_lossy(&output.stdout))
    }

    async fn copy_archive(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let source = format!("{}:{}", name, path);
        let output = self.checked(Stage::Copy, &["cp", &source, "-"]).await?;
        Ok(output.stdout)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.checked(Stage::Stop, &["kill", name]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.checked(Stage::Remove, &["rm", "-f", name]).await?;
        Ok(())
    }
}
