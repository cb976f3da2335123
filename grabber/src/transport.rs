/*!
Bus transport: fixed-size blocking packet reads from the sensor's SPI device.

The transport has no retry logic. Every failure is returned to the worker
loop, which decides whether it is fatal.
*/

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use lepton_shared::protocol::FFC_COMMAND;
use lepton_shared::Packet;
use serde::{Deserialize, Serialize};
use spidev::{SpiModeFlags, Spidev, SpidevOptions};
use thiserror::Error;
use tracing::info;

use crate::cci::CciPort;

/// Errors raised by a packet transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open I2C device {path}: {source}")]
    I2cOpen {
        path: PathBuf,
        #[source]
        source: LinuxI2CError,
    },

    #[error("Bus transfer failed: {0}")]
    Io(#[from] io::Error),

    #[error("I2C transfer failed: {0}")]
    I2c(#[from] LinuxI2CError),

    #[error("Device stayed busy for {0} ms")]
    BusyTimeout(u64),

    #[error("Device rejected command {command:#06x} with code {code}")]
    CommandRejected { command: u16, code: i8 },

    #[error("Device command not supported: {0}")]
    Unsupported(String),
}

/// Device-level control requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Run a flat-field correction
    RunFfc,
}

impl DeviceCommand {
    pub fn command_word(self) -> u16 {
        match self {
            Self::RunFfc => FFC_COMMAND,
        }
    }
}

/// A source of fixed-size packets
pub trait PacketTransport: Send {
    /// Blocking read of exactly one packet
    fn read_packet(&mut self) -> Result<Packet, TransportError>;

    /// Issue a device command without waiting for its effect
    fn send_command(&mut self, command: DeviceCommand) -> Result<(), TransportError>;
}

/// Opens (and re-opens) a transport for the worker loop
pub trait TransportOpener: Send {
    fn open(&mut self) -> Result<Box<dyn PacketTransport>, TransportError>;
}

impl<F> TransportOpener for F
where
    F: FnMut() -> Result<Box<dyn PacketTransport>, TransportError> + Send,
{
    fn open(&mut self) -> Result<Box<dyn PacketTransport>, TransportError> {
        self()
    }
}

/// SPI clock and framing for the video channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiSettings {
    /// SPI mode 0-3 (clock polarity and phase)
    pub mode: u8,
    pub speed_hz: u32,
    pub bits_per_word: u8,
}

impl Default for SpiSettings {
    fn default() -> Self {
        Self {
            mode: 3,
            speed_hz: 10_000_000,
            bits_per_word: 8,
        }
    }
}

impl SpiSettings {
    pub fn mode_flags(&self) -> Option<SpiModeFlags> {
        match self.mode {
            0 => Some(SpiModeFlags::SPI_MODE_0),
            1 => Some(SpiModeFlags::SPI_MODE_1),
            2 => Some(SpiModeFlags::SPI_MODE_2),
            3 => Some(SpiModeFlags::SPI_MODE_3),
            _ => None,
        }
    }

    pub fn options(&self) -> Result<SpidevOptions, TransportError> {
        let mode = self.mode_flags().ok_or_else(|| {
            TransportError::Unsupported(format!("SPI mode {}", self.mode))
        })?;
        Ok(SpidevOptions::new()
            .bits_per_word(self.bits_per_word)
            .max_speed_hz(self.speed_hz)
            .mode(mode)
            .build())
    }
}

/// SPI character device transport (spidev), with an optional CCI command port
pub struct SpiTransport {
    device: Spidev,
    command: Option<CciPort<LinuxI2CDevice>>,
    buffer: Vec<u8>,
}

impl SpiTransport {
    /// Open and configure the spidev node
    pub fn open(
        spi_path: &Path,
        settings: &SpiSettings,
        command: Option<CciPort<LinuxI2CDevice>>,
        packet_size: usize,
    ) -> Result<Self, TransportError> {
        let options = settings.options()?;
        let open_error = |source| TransportError::Open {
            path: spi_path.to_path_buf(),
            source,
        };
        let mut device = Spidev::open(spi_path).map_err(open_error)?;
        device.configure(&options).map_err(open_error)?;

        info!(
            "🔌 Opened SPI device {} (mode {}, {} Hz, {} byte packets)",
            spi_path.display(),
            settings.mode,
            settings.speed_hz,
            packet_size
        );

        Ok(Self {
            device,
            command,
            buffer: vec![0u8; packet_size],
        })
    }
}

impl PacketTransport for SpiTransport {
    fn read_packet(&mut self) -> Result<Packet, TransportError> {
        self.device.read_exact(&mut self.buffer)?;
        Ok(Packet::new(self.buffer.clone()))
    }

    fn send_command(&mut self, command: DeviceCommand) -> Result<(), TransportError> {
        let port = self.command.as_mut().ok_or_else(|| {
            TransportError::Unsupported(format!("no I2C device configured for {:?}", command))
        })?;
        port.run(command)
    }
}

/// Opener for [`SpiTransport`]
#[derive(Debug, Clone)]
pub struct SpiOpener {
    pub spi_path: PathBuf,
    pub spi: SpiSettings,
    pub i2c_path: Option<PathBuf>,
    pub i2c_address: u16,
    pub packet_size: usize,
}

impl SpiOpener {
    fn open_command_port(&self) -> Result<Option<CciPort<LinuxI2CDevice>>, TransportError> {
        let Some(path) = &self.i2c_path else {
            return Ok(None);
        };
        let device = LinuxI2CDevice::new(path, self.i2c_address).map_err(|source| {
            TransportError::I2cOpen {
                path: path.clone(),
                source,
            }
        })?;
        info!("🔌 Opened CCI on {} at {:#04x}", path.display(), self.i2c_address);
        Ok(Some(CciPort::new(device)))
    }
}

impl TransportOpener for SpiOpener {
    fn open(&mut self) -> Result<Box<dyn PacketTransport>, TransportError> {
        let command = self.open_command_port()?;
        let transport = SpiTransport::open(&self.spi_path, &self.spi, command, self.packet_size)?;
        Ok(Box::new(transport))
    }
}
