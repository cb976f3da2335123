/*!
Configuration management for the thermal grabber.
*/

use anyhow::{anyhow, bail, Context, Result};
use lepton_shared::palette::BUILTIN_PALETTE_SIZE;
use lepton_shared::protocol;
use lepton_shared::{PacketLayout, Palette, PaletteKind, PointOfInterest, Rgb, TemperatureScale};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::transport::SpiSettings;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
    pub snapshot: SnapshotConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Check the bus settings, palette selection and points of interest
    pub fn validate(&self) -> Result<()> {
        let layout = &self.device.layout;
        layout
            .validate()
            .with_context(|| "Invalid [device.layout] section")?;
        if self.device.spi.mode_flags().is_none() {
            bail!("Invalid [device.spi] mode {} (expected 0-3)", self.device.spi.mode);
        }
        if self.capture.frame_period_ms == 0 {
            bail!("capture.frame_period_ms must be positive");
        }
        self.capture.palette()?;

        if let Some(name) = &self.snapshot.test_name {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                bail!("snapshot.test_name must be a plain directory name, got {:?}", name);
            }
        }

        for point in &self.snapshot.points_of_interest {
            if point.row >= layout.image_rows || point.col >= layout.image_width {
                bail!(
                    "Point of interest {} at row {}, column {} is outside the {}x{} frame",
                    point.name,
                    point.row,
                    point.col,
                    layout.image_width,
                    layout.image_rows
                );
            }
        }
        Ok(())
    }
}

/// Sensor bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// SPI character device carrying the video stream
    pub spi_device: PathBuf,

    /// I2C bus carrying the command interface; FFC is unavailable when unset
    pub i2c_device: Option<PathBuf>,

    /// I2C address of the command interface
    pub i2c_address: u16,

    /// SPI mode, clock and word size
    pub spi: SpiSettings,

    /// Packet stream constants
    pub layout: PacketLayout,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            spi_device: PathBuf::from("/dev/spidev0.0"),
            spi: SpiSettings::default(),
            i2c_device: None,
            i2c_address: protocol::CCI_I2C_ADDRESS,
            layout: PacketLayout::default(),
        }
    }
}

/// Acquisition loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Built-in palette name (grayscale, ironblack, rainbow)
    pub palette: String,

    /// Colour stops for a custom palette; overrides `palette` when set
    pub custom_palette: Option<Vec<Rgb>>,

    /// Frame periods without a complete frame before a desync warning (0 disables)
    pub desync_frame_limit: u32,

    /// Nominal sensor frame period in milliseconds, used by the desync watchdog
    pub frame_period_ms: u64,

    /// Close and re-open the bus when the desync warning fires
    pub reopen_on_desync: bool,

    /// Idle time between closing and re-opening the bus, in milliseconds
    pub resync_delay_ms: u64,

    /// Statistics reporting interval in seconds
    pub stats_interval_seconds: u64,
}

impl CaptureConfig {
    /// Resolve the configured palette
    pub fn palette(&self) -> Result<Palette> {
        if let Some(stops) = &self.custom_palette {
            return Palette::from_stops("custom", stops, BUILTIN_PALETTE_SIZE)
                .with_context(|| "Invalid custom_palette");
        }
        PaletteKind::from_name(&self.palette)
            .map(|kind| kind.palette())
            .ok_or_else(|| anyhow!("Unknown palette: {}", self.palette))
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            palette: PaletteKind::Ironblack.as_str().to_string(),
            custom_palette: None,
            desync_frame_limit: 30,
            frame_period_ms: protocol::FRAME_PERIOD_MS,
            reopen_on_desync: true,
            resync_delay_ms: protocol::RESYNC_DELAY_MS,
            stats_interval_seconds: 10,
        }
    }
}

/// Snapshot output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory for CLI-initiated snapshots
    pub output_directory: PathBuf,

    /// Write a `.txt` file of per-pixel temperatures next to the image
    pub write_temperatures: bool,

    /// Write a `.json` metadata file next to the image
    pub write_metadata: bool,

    /// Test run name; when set, every snapshot also writes a numbered data log
    /// under `output_directory/<test_name>/`
    pub test_name: Option<String>,

    /// Pixels on each side of a point included in its region statistics
    pub region_extension: usize,

    /// Raw count to Celsius mapping used for the temperature file
    pub temperature_scale: TemperatureScale,

    /// Pixels reported on in the metadata and data log
    pub points_of_interest: Vec<PointOfInterest>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("./snapshots"),
            write_temperatures: true,
            write_metadata: true,
            temperature_scale: TemperatureScale::default(),
            test_name: None,
            points_of_interest: Vec::new(),
            region_extension: 3,
        }
    }
}
