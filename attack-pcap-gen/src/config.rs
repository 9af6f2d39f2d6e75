use chrono::format::{Item, StrftimeItems};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::generator::GeneratorConfig;
use crate::sandbox::SandboxSpec;

pub const DEFAULT_IMAGE: &str = "fersuy/contackgen-ubuntu2204:1.1.0";
pub const DEFAULT_CONTAINER_NAME: &str = "contackgen-session";
pub const DEFAULT_CAPTURE_PATH: &str = "/data/capture.pcap";
/// `{duration}` is replaced with the capture duration in seconds
pub const DEFAULT_COMMAND: &str = "./payload.sh -d {duration}";
pub const DEFAULT_CAPTURE_SECS: u64 = 10;
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Everything one sandbox session needs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sandbox: SandboxSpec,
    pub generator: GeneratorConfig,
    /// How long the in-sandbox capture runs
    pub capture_duration: Duration,
    /// Delay between launching the capture command and the first attack packet
    pub warmup: Duration,
    /// No limit when `None`: a hung sandbox command blocks the session
    pub exec_timeout: Option<Duration>,
    pub max_records: Option<usize>,
    /// Host directory for the copied capture, the system temp dir when `None`
    pub work_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxSpec::default(),
            generator: GeneratorConfig::default(),
            capture_duration: Duration::from_secs(DEFAULT_CAPTURE_SECS),
            warmup: Duration::from_secs(1),
            exec_timeout: None,
            max_records: None,
            work_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate()?;
        self.generator.validate()?;
        if self.capture_duration.is_zero() {
            return Err(Error::config("capture_duration", "must be at least one second"));
        }
        if let Some(timeout) = self.exec_timeout {
            if timeout < self.capture_duration {
                return Err(Error::config(
                    "exec_timeout",
                    "shorter than the capture duration",
                ));
            }
        }
        if self.max_records == Some(0) {
            return Err(Error::config("max_records", "must be greater than zero"));
        }
        if let Some(dir) = &self.work_dir {
            if !dir.is_dir() {
                return Err(Error::config(
                    "work_dir",
                    format!("{} is not a directory", dir.display()),
                ));
            }
        }
        Ok(())
    }

    /// Command line run inside the sandbox
    pub fn sandbox_command(&self) -> String {
        self.sandbox
            .command
            .replace("{duration}", &self.capture_duration.as_secs().to_string())
    }
}

/// How records are written out
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// chrono strftime pattern for the arrival timestamp column
    pub timestamp_format: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        validate_timestamp_format(&self.timestamp_format)
    }
}

pub fn validate_timestamp_format(format: &str) -> Result<()> {
    if format.trim().is_empty() {
        return Err(Error::config("timestamp_format", "must not be empty"));
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(Error::config(
            "timestamp_format",
            format!("'{}' is not a valid strftime pattern", format),
        ));
    }
    Ok(())
}

pub fn validate_image_name(image: &str) -> Result<()> {
    if image.is_empty() {
        return Err(Error::config("image", "cannot be empty"));
    }
    if image.len() > 256 {
        return Err(Error::config("image", "exceeds 256 characters"));
    }
    if let Some(ch) = image
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '-' | '.' | ':' | '/' | '_' | '@'))
    {
        return Err(Error::config("image", format!("invalid character {:?}", ch)));
    }
    if image.starts_with(['-', '.', ':', '/']) {
        return Err(Error::config("image", "must start with an alphanumeric character"));
    }
    Ok(())
}

/// Container names follow the engine's `[a-zA-Z0-9][a-zA-Z0-9_.-]*` rule
pub fn validate_container_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(Error::config("container_name", "cannot be empty")),
        Some(first) if !first.is_ascii_alphanumeric() => {
            return Err(Error::config(
                "container_name",
                "must start with an alphanumeric character",
            ));
        }
        _ => {}
    }
    if let Some(ch) = chars.find(|ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '_' | '.' | '-')) {
        return Err(Error::config(
            "container_name",
            format!("invalid character {:?}", ch),
        ));
    }
    Ok(())
}

/// The parent directory of an output file must already exist
pub fn validate_output_path(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => Err(Error::config(
            "output",
            format!("directory {} does not exist", parent.display()),
        )),
        _ => Ok(()),
    }
}
