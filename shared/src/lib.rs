/*!
# Shared Types and Utilities

Types and algorithms shared by the thermal acquisition components: packet
framing for the synchronous serial bus, frame data structures, and palette
conversion.

## Core Types

- [`PacketLayout`] - device constants of the packet stream
- [`PacketFramer`] - checksum validation and packet classification
- [`RawFrame`] - assembled raw sensor samples
- [`DisplayFrame`] - palette-mapped image
- [`Palette`] - colour lookup table

## Modules

- [`packet`] - packet layout, CRC and classification
- [`frame`] - line and frame data structures
- [`palette`] - palettes and raw-to-display conversion
- [`analysis`] - point and region temperature readings
- [`error`] - common error types
*/

pub mod analysis;
pub mod error;
pub mod frame;
pub mod packet;
pub mod palette;

// Re-export commonly used types
pub use analysis::{
    analyze_points, point_temperature, region_stats, PointOfInterest, PointReport, RegionStats,
};
pub use error::{Result, SharedError};
pub use frame::{DisplayFrame, ImageLine, RawFrame, Rgb, TelemetryLine, TemperatureScale};
pub use packet::{
    ByteOrder, ChecksumKind, DiscardReason, FramerStats, Packet, PacketClass, PacketFramer,
    PacketLayout,
};
pub use palette::{convert, Palette, PaletteKind};

/// Default device constants (80x60 Lepton module, raw14 output)
pub mod protocol {
    /// Size of one bus packet in bytes
    pub const PACKET_SIZE_BYTES: usize = 164;

    /// Size of the packet header (line ID + CRC) in bytes
    pub const HEADER_SIZE_BYTES: usize = 4;

    /// Samples per image row
    pub const IMAGE_WIDTH: usize = 80;

    /// Image rows per frame
    pub const IMAGE_ROWS: usize = 60;

    /// Bytes per sample on the wire
    pub const SAMPLE_SIZE_BYTES: usize = 2;

    /// Significant bits per sample
    pub const SAMPLE_BITS: u32 = 14;

    /// ID bits carrying the line number
    pub const LINE_ID_MASK: u16 = 0x0FFF;

    /// ID nibble set on discard packets
    pub const DISCARD_ID_MASK: u16 = 0x0F00;

    /// Interval between unique frames from the sensor (about 9 Hz)
    pub const FRAME_PERIOD_MS: u64 = 111;

    /// Minimum chip-select idle time for the sensor to drop its VoSPI state, in milliseconds
    pub const RESYNC_DELAY_MS: u64 = 185;

    /// 7-bit I2C address of the command and control interface
    pub const CCI_I2C_ADDRESS: u16 = 0x2A;

    /// Command word for running a flat-field correction (SYS module, RUN_FFC)
    pub const FFC_COMMAND: u16 = 0x0242;
}
