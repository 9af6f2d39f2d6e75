pub mod capture;
pub mod config;
pub mod error;
pub mod generator;
pub mod packet;
pub mod records;
pub mod sandbox;
pub mod session;
pub mod signature;

#[cfg(test)]
pub(crate) mod testutil;

pub use capture::{ingest, CaptureReader, Frame, IngestOptions, LinkType};
pub use config::{ExportConfig, SessionConfig};
pub use error::{Error, Result, Stage};
pub use generator::{AttackGenerator, Budget, GeneratorConfig, GeneratorHandle, GeneratorReport};
pub use packet::{extract, CapturedPacket, NetworkPacket};
pub use records::RecordSet;
pub use sandbox::{ContainerEngine, DockerCli, LifecycleState, Sandbox, SandboxSpec};
pub use session::{Controller, SessionReport};
pub use signature::Signature;
