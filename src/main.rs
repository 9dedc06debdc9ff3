use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use isplink_lib::constants::params;
use isplink_lib::sim::{SimBehavior, SimBus, SimPins, SimulatedIsp};
use isplink_lib::{ChunkFraming, FileSource, Isp, LinkConfig, RequestKind};

const SIM_FIRMWARE_VERSION: &str = "sim-1.0.0";

/// Drive an AP <-> ISP command link against a simulated ISP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON link configuration; defaults apply to every missing field.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Fail exchanges whose response checksum does not add up.
    #[arg(long)]
    strict_checksum: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set a numeric parameter.
    Set {
        #[arg(value_parser = parse_id)]
        id: u16,
        #[arg(value_parser = parse_value)]
        value: u64,
        /// Value width in bytes (1, 2, 4 or 8).
        #[arg(short, long, default_value_t = 1)]
        width: u8,
    },
    /// Query a parameter and print its raw value.
    Query {
        #[arg(value_parser = parse_id)]
        id: u16,
    },
    /// Run a command with an optional hex-encoded argument block.
    Command {
        #[arg(value_parser = parse_id)]
        id: u16,
        #[arg(short, long, default_value = "")]
        arg: String,
        #[arg(short, long, value_enum, default_value_t = KindArg::Ordinary)]
        kind: KindArg,
    },
    /// Set several 1-byte parameters in one frame, as ID=VALUE pairs.
    Batch {
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(u16, u8)>,
    },
    /// Have the simulated peer raise a notification, then poll for it.
    Poll {
        #[arg(value_parser = parse_id)]
        notification: Option<u16>,
        #[arg(short, long, default_value_t = 200)]
        timeout_ms: u64,
    },
    /// Upload a firmware image.
    Flash {
        file: PathBuf,
        /// Send bare chunks instead of wrapping each one in a frame.
        #[arg(long)]
        payload_only: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Ordinary,
    LiveviewPrepare,
    FlashWrite,
    Script,
    Boot,
}

impl From<KindArg> for RequestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Ordinary => RequestKind::Ordinary,
            KindArg::LiveviewPrepare => RequestKind::LiveviewPrepare,
            KindArg::FlashWrite => RequestKind::FlashWrite,
            KindArg::Script => RequestKind::Script,
            KindArg::Boot => RequestKind::Boot,
        }
    }
}

fn parse_id(s: &str) -> Result<u16, String> {
    parse_value(s).and_then(|v| u16::try_from(v).map_err(|_| format!("{s} does not fit 16 bits")))
}

fn parse_value(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_assignment(s: &str) -> Result<(u16, u8), String> {
    let (id, value) = s.split_once('=').ok_or_else(|| format!("expected ID=VALUE, got {s:?}"))?;
    let value = parse_value(value)?;
    let value = u8::try_from(value).map_err(|_| format!("{value} does not fit one byte"))?;
    Ok((parse_id(id)?, value))
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, -v for DEBUG, -vv for TRACE; RUST_LOG overrides
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<LinkConfig> {
    let config = match &cli.config {
        Some(path) => LinkConfig::from_json_file(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => LinkConfig::default(),
    };
    Ok(if cli.strict_checksum {
        config.with_strict_checksum(true)
    } else {
        config
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("isplink failed: {:?}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    let sim = SimulatedIsp::new(SimBehavior::default());
    sim.set_param(params::FIRMWARE_VERSION, SIM_FIRMWARE_VERSION.as_bytes().to_vec());
    let isp = Isp::new(sim.bus(), sim.pins(), config).context("Invalid link configuration")?;
    sim.attach(isp.irq_handle());

    match isp.initialize().await {
        Ok(version) => info!(%version, "ISP initialized"),
        Err(e) => warn!("ISP initialization failed, only recovery is possible: {e}"),
    }

    match cli.command {
        Command::Set { id, value, width } => set(&isp, id, value, width).await?,
        Command::Query { id } => {
            let value = isp.query(id).await.with_context(|| format!("Query of {id:#06x} failed"))?;
            println!("{id:#06x} = {}", hex::encode(&value));
        }
        Command::Command { id, arg, kind } => {
            let arg = hex::decode(&arg).context("Command argument must be hex")?;
            let data = isp
                .run_command(id, &arg, kind.into())
                .await
                .with_context(|| format!("Command {id:#06x} failed"))?;
            println!("{id:#06x} -> {}", hex::encode(&data));
        }
        Command::Batch { assignments } => {
            isp.enter_batch_mode().await?;
            for (id, value) in &assignments {
                isp.set_u8(*id, *value).await?;
            }
            isp.leave_batch_mode().await.context("Batch write failed")?;
            for (id, _) in &assignments {
                let value = sim.param(*id).unwrap_or_else(Bytes::new);
                println!("{id:#06x} = {}", hex::encode(&value));
            }
        }
        Command::Poll {
            notification,
            timeout_ms,
        } => {
            if let Some(id) = notification {
                sim.raise_notification(id);
            }
            match isp.poll_notification(Duration::from_millis(timeout_ms)).await? {
                Some(id) => println!("{id}"),
                None => println!("no notification"),
            }
        }
        Command::Flash { file, payload_only } => {
            let framing = if payload_only {
                ChunkFraming::PayloadOnly
            } else {
                ChunkFraming::Enveloped
            };
            let mut source = FileSource::open(&file)
                .await
                .with_context(|| format!("Failed to open firmware image {:?}", file))?;
            let report = isp.transfer_firmware(&mut source, framing).await.context("Firmware update failed")?;
            println!(
                "flashed {} bytes in {} chunks ({})",
                report.total_bytes, report.chunks, report.framing
            );
            let matches = sim.received_image().is_some_and(|image| image.len() == report.total_bytes);
            if !matches {
                bail!("simulated peer did not store the full image");
            }
        }
    }

    if isp.last_error() != 0 {
        warn!(code = isp.last_error(), "an exchange failed during this run");
    }
    Ok(())
}

async fn set(isp: &Isp<SimBus, SimPins>, id: u16, value: u64, width: u8) -> Result<()> {
    let result = match width {
        1 => isp.set_u8(id, u8::try_from(value)?).await,
        2 => isp.set_u16(id, u16::try_from(value)?).await,
        4 => isp.set_u32(id, u32::try_from(value)?).await,
        8 => isp.set_u64(id, value).await,
        other => bail!("unsupported value width {other}, expected 1, 2, 4 or 8"),
    };
    result.with_context(|| format!("Set of {id:#06x} failed"))?;
    println!("{id:#06x} <- {value:#x}");
    Ok(())
}
