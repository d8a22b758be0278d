//! CLI entry point for imu_daq.
//!
//! - `run`: start the pipeline and keep it running until Ctrl-C
//! - `cleanup`: one retention sweep over the storage directory
//! - `decode`: decode a captured byte dump and print packet counts
//!
//! # Usage
//!
//! ```bash
//! imu_daq run --config config/imu_daq.toml
//! imu_daq run --dry-run
//! imu_daq decode capture.bin
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imu_daq::config::AppConfig;
use imu_daq::logging;
use imu_daq::pipeline::PipelineCoordinator;
use imu_daq::protocol::{FrameDecoder, PacketKind};
use imu_daq::publisher::{BrokerTransport, ChannelTransport};
use imu_daq::storage::sweep_directory;
use imu_daq::transport::SerialOpener;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "imu_daq")]
#[command(about = "IMU telemetry pipeline: serial decode, processing, storage, broker publishing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition pipeline
    Run {
        /// Configuration file (defaults to config/imu_daq.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Publish into an in-process queue instead of the broker
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete data files older than the configured retention
    Cleanup {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Decode a captured byte stream
    Decode {
        /// File holding raw serial bytes
        file: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, dry_run } => run(config.as_deref(), dry_run).await,
        Commands::Cleanup { config } => cleanup(config.as_deref()),
        Commands::Decode { file } => decode(&file),
    }
}

async fn run(config_path: Option<&Path>, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, dry_run, "Starting");

    let opener = Arc::new(SerialOpener::from_config(&config.serial));
    let transport = broker_transport(&config, dry_run)?;

    let coordinator = PipelineCoordinator::new(config, opener, transport)?;
    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            stop.stop();
        }
    });

    let report = coordinator.run().await?;
    info!(
        epochs = report.epochs,
        reconnects = report.reconnects,
        samples = report.samples_processed,
        frames_rejected = report.decoder.frames_rejected,
        messages_sent = report.publisher.messages_sent,
        "Run complete"
    );
    Ok(())
}

fn broker_transport(config: &AppConfig, dry_run: bool) -> Result<Box<dyn BrokerTransport>> {
    if dry_run {
        let (transport, mut rx, _control) =
            ChannelTransport::new(config.pipeline.output_queue_capacity);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                debug!(id = message.id, bytes = message.payload.len(), topic = %message.topic, "Dry-run publish");
            }
        });
        return Ok(Box::new(transport));
    }

    #[cfg(feature = "mqtt")]
    {
        let timeout = std::time::Duration::from_millis(config.publisher.publish_timeout_ms);
        Ok(Box::new(imu_daq::publisher::MqttTransport::new(
            config.mqtt.clone(),
            timeout,
        )))
    }

    #[cfg(not(feature = "mqtt"))]
    {
        anyhow::bail!("Built without the 'mqtt' feature; use --dry-run or rebuild with --features mqtt")
    }
}

fn cleanup(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    let report = sweep_directory(
        &config.storage.base_dir,
        &config.storage.session_prefix,
        config.storage.retention(),
        None,
    )?;
    println!(
        "Removed {} file(s), {} bytes freed",
        report.removed.len(),
        report.bytes_freed
    );
    for path in &report.removed {
        println!("  {}", path.display());
    }
    Ok(())
}

fn decode(file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut decoder = FrameDecoder::new();
    decoder.push(&bytes);

    let mut counts: BTreeMap<u8, u64> = BTreeMap::new();
    for packet in decoder.drain() {
        *counts.entry(packet.kind_byte()).or_insert(0) += 1;
    }

    println!("{}: {} bytes", file.display(), bytes.len());
    for (kind, count) in &counts {
        let name = PacketKind::try_from(*kind).map_or("other", |k| k.name());
        println!("  0x{kind:02X} {name:<16} {count}");
    }
    let stats = decoder.stats();
    println!(
        "frames decoded {}, rejected {}, bytes discarded {}, trailing {}",
        stats.frames_decoded,
        stats.frames_rejected,
        stats.bytes_discarded,
        decoder.buffered()
    );
    for (reason, count) in &stats.rejects {
        println!("  rejected {reason:?}: {count}");
    }
    Ok(())
}
