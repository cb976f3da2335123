/*!
Synthetic sensor producing a valid packet stream without hardware.

Each frame period is a few discard packets (inter-frame blanking), the image
rows in order, then any telemetry rows. The scene is a gradient with a hot
spot drifting across it. Faults can be injected to exercise resync and
shutdown paths.
*/

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use lepton_shared::{Packet, PacketLayout};
use tracing::{debug, info};

use crate::transport::{DeviceCommand, PacketTransport, TransportError, TransportOpener};

/// Blanking packets emitted before each frame
const DEFAULT_BLANKING_PACKETS: usize = 3;

pub struct SyntheticSensor {
    layout: PacketLayout,
    blanking_packets: usize,
    cursor: usize,
    frame_number: u64,
    packets_read: u64,
    fail_after: Option<u64>,
    dropped_rows: Vec<(u64, usize)>,
    stall_after_frames: Option<u64>,
    frame_interval: Option<Duration>,
    commands: Arc<Mutex<Vec<DeviceCommand>>>,
}

impl SyntheticSensor {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            blanking_packets: DEFAULT_BLANKING_PACKETS,
            cursor: 0,
            frame_number: 0,
            packets_read: 0,
            fail_after: None,
            dropped_rows: Vec::new(),
            stall_after_frames: None,
            frame_interval: None,
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of discard packets preceding every frame
    pub fn with_blanking(mut self, packets: usize) -> Self {
        self.blanking_packets = packets;
        self
    }

    /// Fail the bus after `packets` successful reads
    pub fn with_fail_after(mut self, packets: u64) -> Self {
        self.fail_after = Some(packets);
        self
    }

    /// Drop one row of one frame, as a lossy bus would
    pub fn with_dropped_row(mut self, frame: u64, row: usize) -> Self {
        self.dropped_rows.push((frame, row));
        self
    }

    /// Emit only discard packets once `frames` frames have been produced
    pub fn with_stall_after(mut self, frames: u64) -> Self {
        self.stall_after_frames = Some(frames);
        self
    }

    /// Sleep before each frame to mimic the sensor's frame rate
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Shared log of device commands received
    pub fn command_log(&self) -> Arc<Mutex<Vec<DeviceCommand>>> {
        Arc::clone(&self.commands)
    }

    pub fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    fn period(&self) -> usize {
        self.blanking_packets + self.layout.packets_per_frame()
    }

    fn is_dropped(&self, frame: u64, row: usize) -> bool {
        self.dropped_rows.iter().any(|&(f, r)| f == frame && r == row)
    }

    /// Raw samples of one row of the synthetic scene
    pub fn scene_row(&self, frame: u64, row: usize) -> Vec<u16> {
        let mask = u32::from(self.layout.sample_mask());
        let width = self.layout.image_width;
        let background = mask * 48 / 100;
        let hot = mask * 58 / 100;

        let cx = (frame as usize * 3) % width;
        let cy = self.layout.image_rows / 2;
        let radius_sq = (self.layout.image_rows / 10).max(1).pow(2);

        (0..width)
            .map(|col| {
                let dx = col.abs_diff(cx);
                let dy = row.abs_diff(cy);
                if dx * dx + dy * dy <= radius_sq {
                    hot as u16
                } else {
                    (background + (col as u32) * 2 + row as u32).min(mask) as u16
                }
            })
            .collect()
    }
}

impl PacketTransport for SyntheticSensor {
    fn read_packet(&mut self) -> Result<Packet, TransportError> {
        if let Some(limit) = self.fail_after {
            if self.packets_read >= limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "synthetic bus failure").into());
            }
        }
        self.packets_read += 1;

        loop {
            let frame = self.frame_number;
            let pos = self.cursor;
            self.cursor += 1;
            if self.cursor == self.period() {
                self.cursor = 0;
                self.frame_number += 1;
            }

            if self.stall_after_frames.map_or(false, |n| frame >= n) {
                return Ok(self.layout.build_discard_packet());
            }

            if pos < self.blanking_packets {
                if pos == 0 {
                    if let Some(interval) = self.frame_interval {
                        thread::sleep(interval);
                    }
                }
                return Ok(self.layout.build_discard_packet());
            }

            let line = pos - self.blanking_packets;
            if line < self.layout.image_rows {
                if self.is_dropped(frame, line) {
                    debug!("🧪 Dropping row {} of synthetic frame {}", line, frame);
                    continue;
                }
                let samples = self.scene_row(frame, line);
                return Ok(self.layout.build_image_packet(line as u16, &samples));
            }

            let mut payload = vec![0u8; self.layout.payload_size()];
            let counter = (frame as u32).to_be_bytes();
            let n = counter.len().min(payload.len());
            payload[..n].copy_from_slice(&counter[..n]);
            return Ok(self.layout.build_packet(line as u16, &payload));
        }
    }

    fn send_command(&mut self, command: DeviceCommand) -> Result<(), TransportError> {
        info!("🧪 Synthetic sensor received {:?}", command);
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
        Ok(())
    }
}

/// Opens a fresh synthetic sensor on every (re)open
#[derive(Debug, Clone)]
pub struct SyntheticOpener {
    pub layout: PacketLayout,
    pub frame_interval: Option<Duration>,
}

impl TransportOpener for SyntheticOpener {
    fn open(&mut self) -> Result<Box<dyn PacketTransport>, TransportError> {
        let mut sensor = SyntheticSensor::new(self.layout.clone());
        if let Some(interval) = self.frame_interval {
            sensor = sensor.with_frame_interval(interval);
        }
        info!("🧪 Opened synthetic sensor ({}x{})", self.layout.image_width, self.layout.image_rows);
        Ok(Box::new(sensor))
    }
}
