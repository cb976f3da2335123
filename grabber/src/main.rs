/*!
# Lepton Grabber

Acquisition front end for a Lepton-class thermal sensor on an SPI bus.
Reassembles the packet stream into frames, colourizes them and saves
snapshots with a temperature table.

## Usage

### Continuous capture
```bash
lepton-grabber capture --device /dev/spidev0.0
```

### Synthetic sensor (no hardware)
```bash
lepton-grabber capture --debug --frames 50
```

While capturing, type commands on stdin: `ffc`, `restart`, `snap [path]`,
`status`, `quit`. `--ffc-interval 180` requests a flat-field correction
every three minutes.

### Snapshots
```bash
lepton-grabber snapshot --count 2 --interval-ms 1000 --test-name oven
```
Saved image paths are printed to stdout, one per line. With a test name,
each snapshot also writes a numbered data log with the point-of-interest
readings.

### Generate a configuration file
```bash
lepton-grabber config --output lepton-grabber.toml
```
*/

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use crossbeam_channel::{never, select, tick};
use tracing::{info, warn, Level};

use lepton_grabber::control::{self, ControlCommand};
use lepton_grabber::snapshot;
use lepton_grabber::synthetic::SyntheticOpener;
use lepton_grabber::transport::SpiOpener;
use lepton_grabber::{AppConfig, CaptureHandle, CaptureSettings, PendingCommand, WorkerEvent};

/// Sensor frame period (about 9 Hz)
const SYNTHETIC_FRAME_INTERVAL: Duration = Duration::from_millis(111);

/// How long to wait for a frame before reporting the sensor as silent
const FRAME_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "lepton-grabber")]
#[command(about = "Thermal sensor frame acquisition and snapshot tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "lepton-grabber.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run continuous acquisition
    Capture {
        /// SPI device, overriding the configuration file
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Use the synthetic sensor instead of hardware
        #[arg(long = "debug")]
        synthetic: bool,

        /// Stop after this many frames
        #[arg(short, long)]
        frames: Option<u64>,

        /// Request a flat-field correction every this many seconds
        #[arg(long)]
        ffc_interval: Option<u64>,
    },

    /// Save snapshots into a timestamped directory
    Snapshot {
        /// Number of snapshots to take
        #[arg(short = 'n', long, default_value = "2")]
        count: u32,

        /// Delay between snapshots in milliseconds
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,

        /// SPI device, overriding the configuration file
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Use the synthetic sensor instead of hardware
        #[arg(long = "debug")]
        synthetic: bool,

        /// Also write a numbered data log per snapshot under this test name
        #[arg(short, long)]
        test_name: Option<String>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "lepton-grabber.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // Logs go to stderr so stdout carries only snapshot paths
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match cli.command {
        Commands::Capture { device, synthetic, frames, ffc_interval } => {
            let config = load_config(&cli.config)?;
            let ffc_interval = ffc_interval.map(Duration::from_secs);
            run_capture(config, device, synthetic, frames, ffc_interval)
        }
        Commands::Snapshot { count, interval_ms, device, synthetic, test_name } => {
            let mut config = load_config(&cli.config)?;
            if test_name.is_some() {
                config.snapshot.test_name = test_name;
                config.validate()?;
            }
            run_snapshots(config, device, synthetic, count, Duration::from_millis(interval_ms))
        }
        Commands::Config { output } => generate_config_file(output),
    }
}

/// Load the configuration, falling back to defaults when the file is absent
fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load_from_file(path)
    } else {
        info!("No config file at {}, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

fn build_handle(config: &AppConfig, device: Option<PathBuf>, synthetic: bool) -> Result<CaptureHandle> {
    let settings = CaptureSettings::from_config(config);
    let palette = config.capture.palette()?;

    let handle = if synthetic {
        eprintln!("🧪 Generating synthetic thermal data");
        let opener = SyntheticOpener {
            layout: settings.layout.clone(),
            frame_interval: Some(SYNTHETIC_FRAME_INTERVAL),
        };
        CaptureHandle::new(opener, settings, palette)?
    } else {
        let spi_path = device.unwrap_or_else(|| config.device.spi_device.clone());
        eprintln!("📡 SPI device: {}", spi_path.display());
        let opener = SpiOpener {
            spi_path,
            spi: config.device.spi,
            i2c_path: config.device.i2c_device.clone(),
            i2c_address: config.device.i2c_address,
            packet_size: settings.layout.packet_size,
        };
        CaptureHandle::new(opener, settings, palette)?
    };

    Ok(handle)
}

fn log_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::DesyncWarning { frame_periods } => {
            warn!("⚠️ Sensor not synchronized for {} frame periods", frame_periods)
        }
        WorkerEvent::Fatal(e) => warn!("❌ Acquisition stopped: {}", e),
        WorkerEvent::CommandFailed { command, error } => {
            warn!("⚠️ {:?} failed: {}", command, error)
        }
        WorkerEvent::SnapshotSaved(files) => {
            info!("📸 Saved {}", files.image.display());
            if let Some(log) = &files.data_log {
                info!("📝 Data log {}", log.display());
            }
        }
        WorkerEvent::SnapshotFailed { path, error } => {
            warn!("⚠️ Snapshot {} failed: {}", path.display(), error)
        }
        WorkerEvent::Restarted => info!("🔄 Acquisition restarted"),
    }
}

fn note_superseded(replaced: Option<PendingCommand>) {
    if let Some(command) = replaced {
        warn!("⚠️ Pending {:?} replaced before the worker ran it", command);
    }
}

/// Run acquisition until Ctrl+C, `quit`, a fatal bus error, or the frame limit
fn run_capture(
    config: AppConfig,
    device: Option<PathBuf>,
    synthetic: bool,
    frame_limit: Option<u64>,
    ffc_interval: Option<Duration>,
) -> Result<()> {
    eprintln!("🚀 Starting thermal capture");
    let mut handle = build_handle(&config, device, synthetic)?;

    // Set up Ctrl+C handler
    let running = handle.running_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    let frames = handle.subscribe();
    let events = handle.events();
    handle.start().context("Failed to start frame capture")?;

    let controls = control::spawn_reader(BufReader::new(io::stdin()));
    let mut controls_open = true;
    let ffc_ticks = match ffc_interval {
        Some(interval) => {
            eprintln!("🎯 Flat-field correction every {:?}", interval);
            tick(interval)
        }
        None => never(),
    };

    let start_time = Instant::now();
    let mut received = 0u64;
    let mut snapshots = 0u32;
    let mut fatal = None;

    while handle.is_running() {
        for event in events.try_iter() {
            log_event(&event);
            match event {
                WorkerEvent::Fatal(e) => fatal = Some(e),
                WorkerEvent::SnapshotSaved(files) => println!("{}", files.image.display()),
                _ => {}
            }
        }

        let commands = if controls_open { controls.clone() } else { never() };
        select! {
            recv(frames) -> frame => {
                let Ok(frame) = frame else { break };
                received += 1;
                info!(
                    "🖼️ Frame {} ({}x{}, raw {}..{})",
                    frame.frame_number, frame.width, frame.height, frame.min, frame.max
                );
                if frame_limit.map_or(false, |limit| received >= limit) {
                    break;
                }
            }
            recv(commands) -> command => match command {
                Ok(ControlCommand::Quit) => break,
                Ok(ControlCommand::Ffc) => note_superseded(handle.request_ffc()),
                Ok(ControlCommand::Restart) => note_superseded(handle.restart()?),
                Ok(ControlCommand::Snapshot(path)) => {
                    let target = path.unwrap_or_else(|| {
                        snapshot::snapshot_path(&config.snapshot.output_directory, snapshots)
                    });
                    snapshots += 1;
                    eprintln!("📸 Snapshot of next frame to {}", target.display());
                    note_superseded(handle.request_snapshot(target));
                }
                Ok(ControlCommand::Status) => match handle.take_latest() {
                    Some(frame) => eprintln!(
                        "ℹ️ {:?}, {} frames published, latest frame {} (raw {}..{})",
                        handle.state(),
                        handle.publisher().frames_published(),
                        frame.frame_number,
                        frame.min,
                        frame.max
                    ),
                    None => eprintln!("ℹ️ {:?}, no frame yet", handle.state()),
                },
                Err(_) => controls_open = false,
            },
            recv(ffc_ticks) -> _ => note_superseded(handle.request_ffc()),
            default(FRAME_WAIT) => warn!("⏳ No frame in {:?}", FRAME_WAIT),
        }
    }

    for event in events.try_iter() {
        log_event(&event);
        if let WorkerEvent::Fatal(e) = event {
            fatal = Some(e);
        }
    }

    let stats = handle.stop()?;
    let elapsed = start_time.elapsed().as_secs_f64();
    if let Some(stats) = stats {
        eprintln!(
            "📈 {} frames published, {:.1} fps, {} desyncs",
            stats.frames_published,
            stats.frames_published as f64 / elapsed.max(f64::EPSILON),
            stats.assembler.desyncs
        );
    }

    if let Some(e) = fatal {
        bail!("Frame capture failed: {}", e);
    }
    eprintln!("✅ Frame capture completed");
    Ok(())
}

/// Take `count` snapshots `interval` apart, printing each image path to stdout
fn run_snapshots(
    config: AppConfig,
    device: Option<PathBuf>,
    synthetic: bool,
    count: u32,
    interval: Duration,
) -> Result<()> {
    let session_dir = config
        .snapshot
        .output_directory
        .join(Local::now().format("%Y%m%d_%H%M%S").to_string());
    std::fs::create_dir_all(&session_dir)
        .with_context(|| format!("Failed to create {}", session_dir.display()))?;
    eprintln!("💾 Output directory: {}", session_dir.display());

    let mut handle = build_handle(&config, device, synthetic)?;
    let frames = handle.subscribe();
    let events = handle.events();
    handle.start().context("Failed to start frame capture")?;

    for sequence in 0..count {
        if sequence > 0 {
            std::thread::sleep(interval);
        }

        // Wait for the stream to be live before asking for the next frame
        frames
            .recv_timeout(FRAME_WAIT)
            .map_err(|_| anyhow!("No frame from sensor within {:?}", FRAME_WAIT))?;

        let target = snapshot::snapshot_path(&session_dir, sequence);
        handle.request_snapshot(&target);

        let deadline = Instant::now() + FRAME_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = events
                .recv_timeout(remaining)
                .map_err(|_| anyhow!("Snapshot {} not written within {:?}", sequence, FRAME_WAIT))?;
            log_event(&event);
            match event {
                WorkerEvent::SnapshotSaved(files) => {
                    println!("{}", files.image.display());
                    break;
                }
                WorkerEvent::SnapshotFailed { path, error } => {
                    bail!("Snapshot {} failed: {}", path.display(), error)
                }
                WorkerEvent::Fatal(e) => bail!("Frame capture failed: {}", e),
                _ => {}
            }
        }
    }

    handle.stop()?;
    eprintln!("✅ {} snapshots saved", count);
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   lepton-grabber --config {} capture", output_path.display());

    Ok(())
}
