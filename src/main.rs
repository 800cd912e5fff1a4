//! camtap command line: inspect cameras, tune controls, grab frames

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camtap::capture::StreamConfig;
use camtap::{utils, BackendKind, CaptureHub, Config, DeviceId};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "camtap", version, about = "Unified camera capture and control")]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured backend
    #[arg(short, long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached capture devices
    List,
    /// List native stream modes of a device
    Formats { device: String },
    /// Show every supported property with its range and value
    Props { device: String },
    /// Read one property
    Get { device: String, property: String },
    /// Write one property
    Set {
        device: String,
        property: String,
        #[arg(allow_hyphen_values = true)]
        value: f64,
    },
    /// Stream and pull frames, optionally saving the last one
    Grab {
        /// Device id; auto-detected when omitted
        #[arg(short, long)]
        device: Option<String>,
        #[arg(short, long)]
        format: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        fps: Option<f32>,
        /// Stop after this many frames
        #[arg(short = 'n', long, default_value_t = 30)]
        frames: u64,
        /// Give up after this many seconds without finishing
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Write the last frame's bytes here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_backend(s: &str) -> std::result::Result<BackendKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(BackendKind::Auto),
        "v4l2" => Ok(BackendKind::V4l2),
        "synthetic" => Ok(BackendKind::Synthetic),
        other => Err(format!("unknown backend '{other}' (auto, v4l2, synthetic)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    camtap::CONFIG.store(Arc::new(config.clone()));
    let hub = CaptureHub::from_global()?;

    match cli.command {
        Command::List => {
            let devices = hub.list_devices()?;
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for device in devices {
                println!("{device}");
            }
        }
        Command::Formats { device } => {
            for mode in hub.formats(&DeviceId::from(device))? {
                println!("{mode}");
            }
        }
        Command::Props { device } => {
            for descriptor in hub.properties(&DeviceId::from(device))? {
                println!("{descriptor}");
            }
        }
        Command::Get { device, property } => {
            let value = hub.get_property(&DeviceId::from(device), &property)?;
            println!("{property} = {value}");
        }
        Command::Set {
            device,
            property,
            value,
        } => {
            let id = DeviceId::from(device);
            hub.set_property(&id, &property, value)?;
            println!("{property} = {}", hub.get_property(&id, &property)?);
        }
        Command::Grab {
            device,
            format,
            width,
            height,
            fps,
            frames,
            timeout,
            output,
        } => {
            let (id, detected) = match device {
                Some(id) => (DeviceId::from(id), None),
                None => {
                    let found = utils::auto_detect_device(&hub)?;
                    (found.device.id.clone(), Some(found))
                }
            };
            let request = match detected {
                // Stream what was detected unless the mode was spelled out
                Some(found) if format.is_none() && width.is_none() && height.is_none() => {
                    let mut request = found.stream_config();
                    if let Some(fps) = fps {
                        request.fps = fps;
                    }
                    request
                }
                _ => {
                    let defaults = &config.stream;
                    StreamConfig::new(
                        format.unwrap_or_else(|| defaults.format.clone()).parse()?,
                        width.unwrap_or(defaults.width),
                        height.unwrap_or(defaults.height),
                        fps.unwrap_or(defaults.fps),
                    )
                }
            }
            .with_resolution_change(config.capture.allow_resolution_change);

            grab(&hub, &id, request, frames, Duration::from_secs(timeout), output).await?;
        }
    }

    Ok(())
}

async fn grab(
    hub: &CaptureHub,
    id: &DeviceId,
    request: StreamConfig,
    frames: u64,
    timeout: Duration,
    output: Option<PathBuf>,
) -> Result<()> {
    let mode = hub.configure_with(id, request)?;
    info!("Streaming {} from {}", mode, id);

    // Poll at twice the frame rate
    let mut ticker = tokio::time::interval(Duration::from_secs_f32(0.5 / mode.fps));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let started = Instant::now();
    let mut received = 0u64;
    let mut last = None;

    while received < frames {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => {
                warn!("Timed out after {} of {} frames", received, frames);
                break;
            }
            _ = ticker.tick() => {
                if let Some(frame) = hub.pull_frame(id)? {
                    received += 1;
                    info!("Frame #{} {} bytes", frame.sequence(), frame.len());
                    last = Some(frame);
                }
            }
        }
    }

    hub.stop(id)?;
    let elapsed = started.elapsed().as_secs_f64();
    if let Some(stats) = hub.frame_stats(id) {
        info!(
            "Received {} frames in {:.2}s ({:.1} fps), {} dropped, {} faults",
            received,
            elapsed,
            received as f64 / elapsed.max(f64::EPSILON),
            stats.buffer.dropped,
            stats.faults
        );
    }

    if let Some(path) = output {
        let frame = last.ok_or_else(|| eyre!("no frame received to write"))?;
        tokio::fs::write(&path, &frame.data).await?;
        println!("Wrote {} bytes to {}", frame.len(), path.display());
    }
    Ok(())
}
