use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle stage a sandbox failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cleanup,
    Create,
    Start,
    Inspect,
    Exec,
    Generate,
    Copy,
    Stop,
    Remove,
    Ingest,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Cleanup => "stale-cleanup",
            Stage::Create => "create",
            Stage::Start => "start",
            Stage::Inspect => "inspect",
            Stage::Exec => "exec",
            Stage::Generate => "generate",
            Stage::Copy => "copy",
            Stage::Stop => "stop",
            Stage::Remove => "remove",
            Stage::Ingest => "ingest",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The container engine could not be reached
    #[error("Container engine unreachable: {0}")]
    Connectivity(String),

    /// Image lookup or pull failed
    #[error("Image '{image}' unavailable: {reason}")]
    Image { image: String, reason: String },

    /// A frame or packet could not be turned into a record
    #[error("Decode error: {0}")]
    Decode(String),

    /// A sandbox operation failed mid-run
    #[error("Sandbox {stage} failed: {message}")]
    Lifecycle { stage: Stage, message: String },

    /// Invalid configuration, detected before any sandbox work
    #[error("Invalid configuration '{name}': {reason}")]
    Configuration { name: String, reason: String },

    /// Capture file could not be opened or framed
    #[error("Capture error: {0}")]
    Capture(String),

    /// Record export failed
    #[error("Export error: {0}")]
    Export(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Error::Decode(msg.into())
    }

    pub fn lifecycle<S: Into<String>>(stage: Stage, msg: S) -> Self {
        Error::Lifecycle {
            stage,
            message: msg.into(),
        }
    }

    pub fn config<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Error::Configuration {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Only decode failures are recovered locally by skipping the frame
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_is_recoverable() {
        assert!(Error::decode("not ip").is_recoverable());
        assert!(!Error::lifecycle(Stage::Exec, "boom").is_recoverable());
        assert!(!Error::Connectivity("no daemon".into()).is_recoverable());
    }

    #[test]
    fn test_lifecycle_message_names_stage() {
        let err = Error::lifecycle(Stage::Copy, "no such file");
        assert_eq!(err.to_string(), "Sandbox copy failed: no such file");
    }
}
