use std::sync::Arc;
use tracing::{error, info, warn};

use crate::capture::{self, IngestOptions};
use crate::config::SessionConfig;
use crate::error::{Error, Result, Stage};
use crate::generator::{AttackGenerator, GeneratorReport};
use crate::records::RecordSet;
use crate::sandbox::{ContainerEngine, Sandbox};

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub generator: GeneratorReport,
    pub capture_bytes: u64,
    pub session_start_us: i64,
    pub records: usize,
    pub attack_records: usize,
}

/// Owns the record set and runs sessions one after another
pub struct Controller {
    engine: Arc<dyn ContainerEngine>,
    config: SessionConfig,
    records: RecordSet,
}

struct Drive {
    generator: GeneratorReport,
    capture_bytes: u64,
}

impl Controller {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            records: RecordSet::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Records of the last successful run
    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn take_records(&mut self) -> RecordSet {
        std::mem::take(&mut self.records)
    }

    /// Run one complete session. Records from a previous run are discarded first.
    pub async fn run(&mut self) -> Result<SessionReport> {
        self.records.clear();

        let mut builder = tempfile::Builder::new();
        builder.prefix("capture-").suffix(".pcap");
        let capture_file = match &self.config.work_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| Error::lifecycle(Stage::Copy, format!("host capture file: {}", e)))?;

        let mut sandbox = Sandbox::new(self.engine.clone(), self.config.sandbox.clone());
        let outcome = self.drive(&mut sandbox, capture_file.path()).await;

        if let Err(e) = &outcome {
            error!(container = %sandbox.name(), "Session failed in state {:?}: {}", sandbox.state(), e);
        }
        let teardown = sandbox.teardown().await;
        let drive = outcome?;
        teardown?;

        let session_start_us = sandbox
            .session_start_us()
            .ok_or_else(|| Error::lifecycle(Stage::Start, "session start was never recorded"))?;

        let options = IngestOptions {
            session_start_us: Some(session_start_us),
            signature: &self.config.generator.signature,
            max_records: self.config.max_records,
        };
        let records = capture::ingest(capture_file.path(), &options).map_err(|e| match e {
            Error::Lifecycle { .. } => e,
            other => Error::lifecycle(Stage::Ingest, other.to_string()),
        })?;
        capture_file
            .close()
            .map_err(|e| Error::lifecycle(Stage::Ingest, format!("removing capture: {}", e)))?;

        if drive.generator.sent_packets > 0 && records.attack_count() == 0 {
            warn!(
                "Generator sent {} packets but none were captured as attacks",
                drive.generator.sent_packets
            );
        }

        self.records = records;
        let report = SessionReport {
            generator: drive.generator,
            capture_bytes: drive.capture_bytes,
            session_start_us,
            records: self.records.len(),
            attack_records: self.records.attack_count(),
        };
        info!(
            "Session complete: {} records, {} attack",
            report.records, report.attack_records
        );
        Ok(report)
    }

    async fn drive(&self, sandbox: &mut Sandbox, capture_path: &std::path::Path) -> Result<Drive> {
        sandbox.prepare().await?;
        let target = sandbox.start().await?;

        let command = self.config.sandbox_command();
        let exec = sandbox.exec(&command, self.config.exec_timeout)?;

        if !self.config.warmup.is_zero() {
            tokio::time::sleep(self.config.warmup).await;
        }

        let generator = match AttackGenerator::new(self.config.generator.clone(), target)
            .and_then(AttackGenerator::spawn)
        {
            Ok(handle) => handle,
            Err(e) => {
                exec.abort();
                return Err(e);
            }
        };
        info!(target_ip = %target, "Attack generator launched");

        let (exec_result, generator_result) = tokio::join!(
            exec.wait(),
            tokio::task::spawn_blocking(move || generator.join())
        );

        let generator = generator_result
            .map_err(|e| Error::lifecycle(Stage::Generate, e.to_string()))??;
        let outcome = exec_result?;
        if !outcome.success() {
            warn!("Sandbox command finished with exit code {:?}", outcome.exit_code);
        }

        let capture_bytes = sandbox.copy_capture(capture_path).await?;
        Ok(Drive {
            generator,
            capture_bytes,
        })
    }
}
