use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use attack_pcap_gen::config::{
    self, DEFAULT_CAPTURE_PATH, DEFAULT_CAPTURE_SECS, DEFAULT_COMMAND, DEFAULT_CONTAINER_NAME,
    DEFAULT_IMAGE, DEFAULT_TIMESTAMP_FORMAT,
};
use attack_pcap_gen::{
    capture, AttackGenerator, Budget, Controller, DockerCli, ExportConfig, GeneratorConfig,
    IngestOptions, RecordSet, SandboxSpec, SessionConfig, Signature,
};

#[derive(Parser, Debug)]
#[command(name = "attack-pcap-gen")]
#[command(about = "Generate labeled attack traffic captures inside a disposable sandbox")]
#[command(version = "1.0.0")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Signature and flood shape shared by `run` and `flood`
#[derive(Args, Debug)]
struct TrafficArgs {
    /// Attack signature as hex (default: built-in marker)
    #[arg(long)]
    signature: Option<String>,

    /// Seed for payload padding and port choice
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Number of attack packets to send
    #[arg(short, long, default_value = "1000", conflicts_with = "flood_secs")]
    packets: u64,

    /// Send for this many seconds instead of a fixed packet count
    #[arg(long)]
    flood_secs: Option<u64>,

    /// Rate limit in packets per second (0 = unlimited)
    #[arg(short, long, default_value = "500")]
    rate: u64,

    /// Lowest destination port
    #[arg(long, default_value = "1024")]
    port_min: u16,

    /// Highest destination port
    #[arg(long, default_value = "65535")]
    port_max: u16,
}

impl TrafficArgs {
    fn signature(&self) -> Result<Signature> {
        match &self.signature {
            Some(text) => Signature::from_hex(text).context("Invalid --signature"),
            None => Ok(Signature::default()),
        }
    }

    fn generator_config(&self) -> Result<GeneratorConfig> {
        let budget = match self.flood_secs {
            Some(secs) => Budget::Duration(Duration::from_secs(secs)),
            None => Budget::Packets(self.packets),
        };
        Ok(GeneratorConfig {
            signature: self.signature()?,
            seed: self.seed,
            budget,
            rate: (self.rate > 0).then_some(self.rate),
            port_range: (self.port_min, self.port_max),
            ..GeneratorConfig::default()
        })
    }
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Output CSV file path
    #[arg(short, long, default_value = "records.csv")]
    output: PathBuf,

    /// chrono format for the arrival timestamp column
    #[arg(long, default_value = DEFAULT_TIMESTAMP_FORMAT)]
    timestamp_format: String,

    /// Stop after this many records
    #[arg(long)]
    max_records: Option<usize>,
}

impl OutputArgs {
    fn export_config(&self) -> Result<ExportConfig> {
        let export = ExportConfig {
            timestamp_format: self.timestamp_format.clone(),
        };
        export.validate()?;
        config::validate_output_path(&self.output)?;
        Ok(export)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a full sandbox session and export labeled records
    Run {
        /// Sandbox image
        #[arg(long, default_value = DEFAULT_IMAGE)]
        image: String,

        /// Sandbox container name (a stale container with this name is removed)
        #[arg(long, default_value = DEFAULT_CONTAINER_NAME)]
        container_name: String,

        /// Capture file path inside the sandbox
        #[arg(long, default_value = DEFAULT_CAPTURE_PATH)]
        capture_path: String,

        /// Command run inside the sandbox, `{duration}` is replaced with the capture seconds
        #[arg(long, default_value = DEFAULT_COMMAND)]
        command: String,

        /// Capture duration in seconds
        #[arg(short, long, default_value_t = DEFAULT_CAPTURE_SECS)]
        duration: u64,

        /// Milliseconds to wait after launching the capture before sending
        #[arg(long, default_value = "1000")]
        warmup_ms: u64,

        /// Abort the sandbox command after this many seconds
        #[arg(long)]
        exec_timeout: Option<u64>,

        /// Host directory for the temporary capture copy
        #[arg(long)]
        work_dir: Option<PathBuf>,

        #[command(flatten)]
        traffic: TrafficArgs,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Label an existing capture file
    Ingest {
        /// Path to PCAP file
        #[arg(short, long)]
        file: PathBuf,

        /// Attack signature as hex (default: built-in marker)
        #[arg(long)]
        signature: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Send attack traffic only, without a sandbox
    Flood {
        /// Target IP address
        #[arg(short, long)]
        target: IpAddr,

        #[command(flatten)]
        traffic: TrafficArgs,
    },
}

fn log_records_summary(records: &RecordSet) {
    info!("  Records: {}", records.len());
    info!("  Attack records: {}", records.attack_count());
    info!("  Benign records: {}", records.len() - records.attack_count());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Run {
            image,
            container_name,
            capture_path,
            command,
            duration,
            warmup_ms,
            exec_timeout,
            work_dir,
            traffic,
            output,
        } => {
            let export = output.export_config()?;
            let session = SessionConfig {
                sandbox: SandboxSpec {
                    image,
                    container_name,
                    capture_path,
                    command,
                },
                generator: traffic.generator_config()?,
                capture_duration: Duration::from_secs(duration),
                warmup: Duration::from_millis(warmup_ms),
                exec_timeout: exec_timeout.map(Duration::from_secs),
                max_records: output.max_records,
                work_dir,
            };

            info!("Starting attack capture session");
            info!("Image: {}", session.sandbox.image);
            info!("Container: {}", session.sandbox.container_name);
            info!("Capture duration: {}s", duration);

            let engine = DockerCli::connect()
                .await
                .context("Failed to connect to container engine")?;
            let mut controller = Controller::new(Arc::new(engine), session)
                .context("Invalid session configuration")?;
            let report = controller.run().await.context("Attack session failed")?;

            let rows = controller
                .records()
                .save_csv(&output.output, &export)
                .with_context(|| format!("Failed to write {}", output.output.display()))?;

            info!("======= SESSION SUMMARY =======");
            info!("  Packets sent: {}", report.generator.sent_packets);
            info!("  Bytes sent: {}", report.generator.sent_bytes);
            info!("  Send errors: {}", report.generator.errors);
            info!("  Capture size: {} bytes", report.capture_bytes);
            log_records_summary(controller.records());
            info!("  Rows written: {} to {}", rows, output.output.display());
        }
        Commands::Ingest {
            file,
            signature,
            output,
        } => {
            let export = output.export_config()?;
            let signature = match signature {
                Some(text) => Signature::from_hex(&text).context("Invalid --signature")?,
                None => Signature::default(),
            };
            if output.max_records == Some(0) {
                anyhow::bail!("--max-records must be greater than zero");
            }

            let options = IngestOptions {
                session_start_us: None,
                signature: &signature,
                max_records: output.max_records,
            };
            let records = capture::ingest(&file, &options)
                .with_context(|| format!("Failed to ingest {}", file.display()))?;
            let rows = records
                .save_csv(&output.output, &export)
                .with_context(|| format!("Failed to write {}", output.output.display()))?;

            info!("======= INGEST SUMMARY =======");
            log_records_summary(&records);
            info!("  Rows written: {} to {}", rows, output.output.display());
        }
        Commands::Flood { target, traffic } => {
            let generator = AttackGenerator::new(traffic.generator_config()?, target)
                .context("Invalid flood configuration")?;
            let report = tokio::task::spawn_blocking(move || generator.run())
                .await
                .context("Flood task failed")??;

            info!("======= FLOOD SUMMARY =======");
            info!("  Packets sent: {}", report.sent_packets);
            info!("  Bytes sent: {}", report.sent_bytes);
            info!("  Send errors: {}", report.errors);
            info!(
                "  Average rate: {:.0} packets/second",
                report.sent_packets as f64 / report.elapsed.as_secs_f64().max(0.001)
            );
        }
    }

    Ok(())
}
