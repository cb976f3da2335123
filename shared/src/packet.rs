/*!
Packet layout, checksum validation and classification.

Every bus read yields one fixed-size packet: a header carrying the line ID
and a CRC, followed by one row of samples. This module turns such a block
into a [`PacketClass`] the frame assembler can fold.
*/

use crc::{Crc, CRC_16_XMODEM};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, SharedError};
use crate::frame::{ImageLine, TelemetryLine};
use crate::protocol;

/// CRC-16/CCITT as carried in the packet header (poly 0x1021, init 0)
const PACKET_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Checksum carried in the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// No checksum validation
    None,
    /// CRC-16/CCITT (poly 0x1021, init 0) over the whole packet with the
    /// CRC field and the bits outside the ID mask zeroed
    Crc16Ccitt,
}

/// Byte order of header fields and samples on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::BigEndian => u16::from_be_bytes(bytes),
            Self::LittleEndian => u16::from_le_bytes(bytes),
        }
    }

    fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::BigEndian => value.to_be_bytes(),
            Self::LittleEndian => value.to_le_bytes(),
        }
    }
}

/// Device constants describing the packet stream of one session.
///
/// The defaults describe an 80x60 Lepton module in raw14 mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLayout {
    /// Total bytes per bus read
    pub packet_size: usize,
    /// Header bytes preceding the payload (ID at offset 0, CRC at offset 2)
    pub header_size: usize,
    /// Samples per image row
    pub image_width: usize,
    /// Image rows per frame
    pub image_rows: usize,
    /// Telemetry rows interleaved with each frame
    pub telemetry_rows: usize,
    /// Bytes per sample on the wire
    pub sample_bytes: usize,
    /// Significant bits per sample
    pub sample_bits: u32,
    pub byte_order: ByteOrder,
    /// Bits of the ID field that carry the line number
    pub id_mask: u16,
    /// ID bits that, when all set, mark a discard packet
    pub discard_mask: u16,
    pub checksum: ChecksumKind,
}

impl Default for PacketLayout {
    fn default() -> Self {
        Self {
            packet_size: protocol::PACKET_SIZE_BYTES,
            header_size: protocol::HEADER_SIZE_BYTES,
            image_width: protocol::IMAGE_WIDTH,
            image_rows: protocol::IMAGE_ROWS,
            telemetry_rows: 0,
            sample_bytes: protocol::SAMPLE_SIZE_BYTES,
            sample_bits: protocol::SAMPLE_BITS,
            byte_order: ByteOrder::BigEndian,
            id_mask: protocol::LINE_ID_MASK,
            discard_mask: protocol::DISCARD_ID_MASK,
            checksum: ChecksumKind::Crc16Ccitt,
        }
    }
}

impl PacketLayout {
    /// Check that the constants describe a coherent packet stream
    pub fn validate(&self) -> Result<()> {
        if self.header_size < 4 {
            return Err(SharedError::invalid_layout(format!(
                "header must hold a 2-byte ID and a 2-byte CRC, got {} bytes",
                self.header_size
            )));
        }
        if self.image_width == 0 || self.image_rows == 0 {
            return Err(SharedError::invalid_layout("image dimensions must be non-zero"));
        }
        if !(1..=2).contains(&self.sample_bytes) {
            return Err(SharedError::invalid_layout(format!(
                "samples must be 1 or 2 bytes wide, got {}",
                self.sample_bytes
            )));
        }
        if self.sample_bits == 0 || self.sample_bits as usize > self.sample_bytes * 8 {
            return Err(SharedError::invalid_layout(format!(
                "{} significant bits do not fit {}-byte samples",
                self.sample_bits, self.sample_bytes
            )));
        }
        let expected = self.header_size + self.payload_size();
        if self.packet_size != expected {
            return Err(SharedError::invalid_layout(format!(
                "packet size {} does not match header {} + {} samples x {} bytes",
                self.packet_size, self.header_size, self.image_width, self.sample_bytes
            )));
        }
        if self.discard_mask == 0 {
            return Err(SharedError::invalid_layout("discard mask must not be empty"));
        }
        if (self.image_rows + self.telemetry_rows) > usize::from(self.id_mask) {
            return Err(SharedError::invalid_layout(format!(
                "{} lines cannot be addressed through ID mask {:#06x}",
                self.image_rows + self.telemetry_rows,
                self.id_mask
            )));
        }
        Ok(())
    }

    /// Payload bytes per packet
    pub fn payload_size(&self) -> usize {
        self.image_width * self.sample_bytes
    }

    /// Packets per frame period (image rows plus telemetry rows)
    pub fn packets_per_frame(&self) -> usize {
        self.image_rows + self.telemetry_rows
    }

    /// Mask selecting the significant sample bits
    pub fn sample_mask(&self) -> u16 {
        if self.sample_bits >= 16 {
            u16::MAX
        } else {
            (1u16 << self.sample_bits) - 1
        }
    }

    /// Parse the header fields of a packet
    pub fn header(&self, packet: &Packet) -> Result<PacketHeader> {
        let bytes = packet.as_bytes();
        if bytes.len() != self.packet_size {
            return Err(SharedError::InvalidPacketLength {
                expected: self.packet_size,
                actual: bytes.len(),
            });
        }
        Ok(PacketHeader {
            raw_id: self.byte_order.read_u16([bytes[0], bytes[1]]),
            crc: self.byte_order.read_u16([bytes[2], bytes[3]]),
        })
    }

    /// Compute the checksum of a packet as the device does
    pub fn compute_checksum(&self, bytes: &[u8]) -> u16 {
        if bytes.len() < 4 {
            return PACKET_CRC.checksum(bytes);
        }
        let keep = self.byte_order.write_u16(self.id_mask);
        let header = [bytes[0] & keep[0], bytes[1] & keep[1], 0, 0];

        let mut digest = PACKET_CRC.digest();
        digest.update(&header);
        digest.update(&bytes[4..]);
        digest.finalize()
    }

    /// Verify the header checksum of a packet
    pub fn verify_checksum(&self, packet: &Packet, header: &PacketHeader) -> bool {
        match self.checksum {
            ChecksumKind::None => true,
            ChecksumKind::Crc16Ccitt => self.compute_checksum(packet.as_bytes()) == header.crc,
        }
    }

    /// Classify a packet without keeping any statistics
    pub fn classify(&self, packet: &Packet) -> PacketClass {
        let header = match self.header(packet) {
            Ok(header) => header,
            Err(_) => return PacketClass::Discard(DiscardReason::Length),
        };

        if header.raw_id & self.discard_mask == self.discard_mask {
            return PacketClass::Discard(DiscardReason::Marker);
        }

        if !self.verify_checksum(packet, &header) {
            return PacketClass::Discard(DiscardReason::Checksum);
        }

        let line_id = header.raw_id & self.id_mask;
        let payload = &packet.as_bytes()[self.header_size..];

        if usize::from(line_id) >= self.image_rows {
            return PacketClass::Telemetry(TelemetryLine {
                line_id,
                payload: payload.to_vec(),
            });
        }

        PacketClass::Image(ImageLine {
            index: usize::from(line_id),
            samples: self.decode_samples(payload),
        })
    }

    /// Reinterpret a payload as fixed-width samples in device byte order
    pub fn decode_samples(&self, payload: &[u8]) -> Vec<u16> {
        let mask = self.sample_mask();
        match self.sample_bytes {
            1 => payload.iter().map(|&b| u16::from(b) & mask).collect(),
            _ => payload
                .chunks_exact(2)
                .map(|pair| self.byte_order.read_u16([pair[0], pair[1]]) & mask)
                .collect(),
        }
    }

    /// Build a packet carrying the given ID and payload, with a valid checksum.
    ///
    /// Short payloads are zero-padded, long ones truncated.
    pub fn build_packet(&self, raw_id: u16, payload: &[u8]) -> Packet {
        let mut bytes = vec![0u8; self.packet_size];
        bytes[0..2].copy_from_slice(&self.byte_order.write_u16(raw_id));
        let body = &mut bytes[self.header_size..];
        let n = payload.len().min(body.len());
        body[..n].copy_from_slice(&payload[..n]);

        if self.checksum == ChecksumKind::Crc16Ccitt {
            let crc = self.compute_checksum(&bytes);
            bytes[2..4].copy_from_slice(&self.byte_order.write_u16(crc));
        }
        Packet::new(bytes)
    }

    /// Build an image-line packet from raw samples
    pub fn build_image_packet(&self, index: u16, samples: &[u16]) -> Packet {
        let payload: Vec<u8> = match self.sample_bytes {
            1 => samples.iter().map(|&s| s as u8).collect(),
            _ => samples
                .iter()
                .flat_map(|&s| self.byte_order.write_u16(s))
                .collect(),
        };
        self.build_packet(index & self.id_mask, &payload)
    }

    /// Build a discard packet as emitted during inter-frame blanking
    pub fn build_discard_packet(&self) -> Packet {
        self.build_packet(self.discard_mask, &[])
    }
}

/// Header fields of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub raw_id: u16,
    pub crc: u16,
}

/// One fixed-size block read from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Why a packet carried no usable line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Reserved ID pattern: the device has no data yet
    Marker,
    /// Header checksum did not match
    Checksum,
    /// Block size differs from the session packet size
    Length,
}

/// Classification of a single packet
#[derive(Debug, Clone, PartialEq)]
pub enum PacketClass {
    Discard(DiscardReason),
    Telemetry(TelemetryLine),
    Image(ImageLine),
}

/// Packet classifier that keeps running counters for diagnostics
#[derive(Debug, Clone)]
pub struct PacketFramer {
    layout: PacketLayout,
    stats: FramerStats,
}

/// Counters kept by [`PacketFramer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub packets: u64,
    pub discard_markers: u64,
    pub checksum_errors: u64,
    pub length_errors: u64,
    pub telemetry_lines: u64,
    pub image_lines: u64,
}

impl PacketFramer {
    /// Create a framer for a validated layout
    pub fn new(layout: PacketLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self {
            layout,
            stats: FramerStats::default(),
        })
    }

    pub fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Classify a packet, updating the counters
    pub fn classify(&mut self, packet: &Packet) -> PacketClass {
        self.stats.packets += 1;
        let class = self.layout.classify(packet);
        match &class {
            PacketClass::Discard(DiscardReason::Marker) => self.stats.discard_markers += 1,
            PacketClass::Discard(reason) => {
                match reason {
                    DiscardReason::Checksum => self.stats.checksum_errors += 1,
                    _ => self.stats.length_errors += 1,
                }
                let head = &packet.as_bytes()[..packet.len().min(self.layout.header_size)];
                trace!("Rejected packet ({:?}), header {}", reason, hex::encode(head));
            }
            PacketClass::Telemetry(_) => self.stats.telemetry_lines += 1,
            PacketClass::Image(_) => self.stats.image_lines += 1,
        }
        class
    }
}
