//! usbtv-capture
//!
//! Captures video from a usbtv007 tuner through Linux usbfs and optionally
//! appends the raw YUYV pictures to a file.

use anyhow::{Context, Result, anyhow};
use capture::capture::{CaptureSession, CapturedFrame};
use capture::config::CaptureConfig;
use capture::usb::{DeviceFile, UsbFs};
use clap::Parser;
use common::setup_logging;
use protocol::registers::{USBTV_PRODUCT_ID, USBTV_VENDOR_ID};
use protocol::{ScanType, TvInput, TvNorm};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// How often the main task checks for a lost device or the frame limit
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "usbtv-capture")]
#[command(author, version, about = "Capture video from a usbtv007 USB tuner")]
#[command(long_about = "
Streams video from a usbtv007 (1b71:3002) capture stick through Linux usbfs.

EXAMPLES:
    # Capture from the first tuner found until Ctrl-C
    usbtv-capture

    # Capture 100 PAL frames from S-Video into a raw file
    usbtv-capture --norm pal --input svideo --frames 100 --output capture.yuyv

    # List tuners and their usbfs nodes
    usbtv-capture --list-devices

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usbtv-capture/capture.toml
    3. /etc/usbtv-capture/capture.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// usbfs device node, e.g. /dev/bus/usb/001/004
    #[arg(short, long, value_name = "PATH")]
    device: Option<String>,

    /// List usbtv007 devices and exit
    #[arg(long)]
    list_devices: bool,

    /// TV norm (ntsc, pal)
    #[arg(long)]
    norm: Option<TvNorm>,

    /// Video input (composite, svideo)
    #[arg(long)]
    input: Option<TvInput>,

    /// Scan type (progressive, discard, interleaved)
    #[arg(long)]
    scan: Option<ScanType>,

    /// Stop after this many frames
    #[arg(short, long, value_name = "N")]
    frames: Option<u64>,

    /// Append raw YUYV pictures to this file
    #[arg(short, long, value_name = "PATH")]
    output: Option<String>,

    /// Print the final counters as JSON
    #[arg(long)]
    stats_json: bool,
}

impl Args {
    fn apply(&self, config: &mut CaptureConfig) {
        if let Some(level) = &self.log_level {
            config.capture.log_level = level.clone();
        }
        if let Some(device) = &self.device {
            config.capture.device = Some(device.clone());
        }
        if let Some(output) = &self.output {
            config.capture.output = Some(output.clone());
        }
        if self.frames.is_some() {
            config.capture.frames = self.frames;
        }
        if let Some(norm) = self.norm {
            config.video.norm = norm;
        }
        if let Some(input) = self.input {
            config.video.input = input;
        }
        if let Some(scan) = self.scan {
            config.video.scan = scan;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CaptureConfig::load_from(path).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.capture.log_level).context("Failed to setup logging")?;
    info!("usbtv-capture v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices_mode();
    }

    let device_path = match config.capture.device_path() {
        Some(path) => path,
        None => find_devices()?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No usbtv007 device found, use --device"))?,
    };

    run_capture(config, &device_path, args.stats_json).await
}

/// usbfs nodes of every attached usbtv007
fn find_devices() -> Result<Vec<PathBuf>> {
    let devices = rusb::devices().context("Failed to enumerate USB devices")?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(
                    "Skipping device {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        if descriptor.vendor_id() == USBTV_VENDOR_ID && descriptor.product_id() == USBTV_PRODUCT_ID {
            found.push(PathBuf::from(format!(
                "/dev/bus/usb/{:03}/{:03}",
                device.bus_number(),
                device.address()
            )));
        }
    }
    Ok(found)
}

fn list_devices_mode() -> Result<()> {
    let devices = find_devices()?;
    if devices.is_empty() {
        println!("No usbtv007 devices found.");
    } else {
        println!("Found {} usbtv007 device(s):\n", devices.len());
        for path in devices {
            println!("  {:04x}:{:04x}  {}", USBTV_VENDOR_ID, USBTV_PRODUCT_ID, path.display());
        }
    }
    Ok(())
}

async fn run_capture(config: CaptureConfig, device_path: &Path, stats_json: bool) -> Result<()> {
    let interface = config.usb.interface;
    let device = DeviceFile::open(device_path)
        .with_context(|| format!("Failed to open {}", device_path.display()))?;
    device
        .claim_interface(interface)
        .with_context(|| format!("Failed to claim interface {}", interface))?;
    let device = Arc::new(device);
    info!("Opened {}", device_path.display());

    let mut writer = match config.capture.output_path() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open output file: {}", path.display()))?;
            info!("Writing frames to {}", path.display());
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let limit = config.capture.frames;
    let captured = Arc::new(AtomicU64::new(0));
    let consumer = {
        let captured = Arc::clone(&captured);
        move |frame: CapturedFrame| {
            let n = captured.fetch_add(1, Ordering::Relaxed) + 1;
            if limit.is_some_and(|limit| n > limit) {
                return;
            }
            debug!("Frame {} id {} {:?}", n, frame.frame_id(), frame.state());
            if let Some(writer) = writer.as_mut()
                && let Err(e) = writer.write_all(frame.data())
            {
                warn!("Failed to write frame: {}", e);
            }
        }
    };

    let fs: Arc<dyn UsbFs> = device.clone();
    let mut session = CaptureSession::new(fs, config.session_params(), consumer);
    session.start().context("Failed to start capture")?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut ended = None;
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                if let Some(summary) = session.poll_device() {
                    error!("Device lost, capture stopped");
                    ended = Some(summary);
                    break;
                }
                if let Some(limit) = limit
                    && captured.load(Ordering::Relaxed) >= limit
                {
                    info!("Captured {} frames", limit);
                    break;
                }
            }
        }
    }

    let summary = ended.or_else(|| session.stop());
    let snapshot = session.snapshot();
    drop(session);

    if let Err(e) = device.release_interface(interface) {
        warn!("Failed to release interface {}: {}", interface, e);
    }

    if stats_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize stats")?
        );
    } else {
        println!("{}", snapshot);
        if let Some(summary) = summary
            && summary.locked_slots > 0
        {
            println!("Frame slots left claimed: {}", summary.locked_slots);
        }
    }
    Ok(())
}
