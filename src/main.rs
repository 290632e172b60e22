//! # Voice Capture Agent - Command Line Entry Point
//!
//! ## Commands:
//! - **run** (default): connect to the transcription service, capture and
//!   stream speech until Ctrl-C or SIGTERM
//! - **devices**: list input devices
//! - **probe**: short microphone self-test
//! - **print-config**: show the effective configuration as TOML
//!
//! ## Configuration Overrides (lowest to highest):
//! config file / `APP_` environment, then `--device` and `--url`, then each
//! `--set '{"section": {"key": value}}'` in order.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_capture_agent::audio::events::PipelineEvent;
use voice_capture_agent::device::{DeviceManager, DeviceSelection};
use voice_capture_agent::health::{probe_microphone, status_report};
use voice_capture_agent::websocket::{self, InboundEvent};
use voice_capture_agent::{AppConfig, CaptureContext, Lifecycle};

/// How often the run loop drains the pipeline event channel.
const EVENT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(
    name = "voice-capture-agent",
    version,
    about = "Stream microphone speech to a transcription service"
)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, env = "APP_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Input device: "default", an index from `devices`, or a name
    #[arg(long)]
    device: Option<String>,

    /// Transcription service WebSocket URL
    #[arg(long)]
    url: Option<String>,

    /// Partial JSON override, may be repeated
    #[arg(long = "set", value_name = "JSON")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture and stream speech (default)
    Run,
    /// List input devices
    Devices,
    /// Capture for a few seconds and report whether signal was detected
    Probe {
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },
    /// Print the effective configuration
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Devices => list_devices(),
        Command::Probe { seconds } => probe(config, seconds).await,
        Command::PrintConfig => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls the filter; without it the crate logs at debug.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_capture_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    if let Some(device) = &cli.device {
        config.audio.device = device.clone();
    }
    if let Some(url) = &cli.url {
        config.transport.url = url.clone();
    }
    for patch in &cli.overrides {
        config.update_from_json(patch)?;
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: AppConfig) -> Result<()> {
    info!("Starting voice-capture-agent v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let mut ctx = CaptureContext::new(config.clone())?;
    let (sink, source) = websocket::connect(&config.transport.url).await?;
    let session = ctx.start(Box::new(sink)).await?;

    let (inbound_tx, mut inbound_rx) = mpsc::channel(config.transport.inbound_queue_capacity);
    let reader = websocket::spawn_inbound_reader(
        source,
        session.clone(),
        config.session.confidence_threshold,
        inbound_tx,
        shutdown.child_token(),
    );

    let events = ctx.events();
    let preserve_gain = config.session.preserve_gain_on_refresh;
    let status_every = Duration::from_secs(config.session.status_interval_secs.max(1));
    let mut status_tick = tokio::time::interval(status_every);
    let mut event_tick = tokio::time::interval(EVENT_POLL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = status_tick.tick() => {
                info!("Status: {}", status_report(&ctx));
                if ctx.lifecycle() == Lifecycle::Active && !ctx.is_capturing() {
                    refresh_device(&mut ctx, preserve_gain);
                }
            }
            _ = event_tick.tick() => {
                let mut needs_refresh = ctx.capture_failed();
                for event in events.try_iter() {
                    match event {
                        PipelineEvent::Frame(report) => trace!(
                            "frame {}: level {:.3}, gain {:.2}, speech {}",
                            report.sequence,
                            report.processed_level,
                            report.gain_applied,
                            report.vad.is_speech
                        ),
                        PipelineEvent::DeviceError { message, recoverable } => {
                            error!("{}", message);
                            needs_refresh |= recoverable;
                        }
                        PipelineEvent::ProcessingError { sequence, message } => {
                            debug!("Frame {} passed through: {}", sequence, message);
                        }
                        PipelineEvent::TransportError { message } => debug!("{}", message),
                    }
                }
                if needs_refresh {
                    refresh_device(&mut ctx, preserve_gain);
                }
            }
            inbound = inbound_rx.recv() => match inbound {
                Some(InboundEvent::Unknown) | Some(InboundEvent::Pong { .. }) => {}
                Some(event) => debug!("Inbound event: {:?}", event),
                None => {
                    warn!("Connection to the transcription service closed");
                    break;
                }
            },
        }
    }

    shutdown.cancel();
    let snapshot = ctx.stop().await?;
    ctx.dispose().await?;
    if let Err(e) = reader.await {
        warn!("Inbound reader ended abnormally: {}", e);
    }

    info!("Session summary: {}", serde_json::to_string(&snapshot)?);
    info!("Agent stopped");
    Ok(())
}

fn refresh_device(ctx: &mut CaptureContext, preserve_gain: bool) {
    if let Err(e) = ctx.refresh_device(preserve_gain) {
        error!("Device refresh failed: {}", e);
    }
}

fn list_devices() -> Result<()> {
    let devices = DeviceManager::new().list_input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for device in devices {
        println!(
            "{:>3}  {}{}",
            device.index,
            device.name,
            if device.is_default { "  (default)" } else { "" }
        );
    }
    Ok(())
}

async fn probe(config: AppConfig, seconds: u64) -> Result<()> {
    let selection: DeviceSelection = config.audio.device.parse()?;
    let report = probe_microphone(&config, &selection, seconds).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.passed {
        anyhow::bail!("no signal detected on '{}'", report.device);
    }
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received SIGINT");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
            }
        }

        shutdown.cancel();
    });
}
