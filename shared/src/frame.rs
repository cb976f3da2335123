/*!
Frame data structures.

Lines come out of the packet framer, get folded into a [`RawFrame`] by the
assembler, and each complete raw frame is converted into exactly one
[`DisplayFrame`].
*/

use serde::{Deserialize, Serialize};

use crate::error::{Result, SharedError};

/// One RGB pixel
pub type Rgb = [u8; 3];

/// A row of raw sensor samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLine {
    pub index: usize,
    pub samples: Vec<u16>,
}

/// A block of device telemetry carried in place of an image row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryLine {
    pub line_id: u16,
    pub payload: Vec<u8>,
}

/// A complete set of raw image rows, in row order
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub frame_number: u64,
    width: usize,
    height: usize,
    samples: Vec<u16>,
    telemetry: Vec<TelemetryLine>,
}

impl RawFrame {
    /// Build a raw frame from row-major samples
    pub fn new(frame_number: u64, width: usize, height: usize, samples: Vec<u16>) -> Result<Self> {
        if samples.len() != width * height {
            return Err(SharedError::invalid_frame(format!(
                "{} samples do not fill a {}x{} frame",
                samples.len(),
                width,
                height
            )));
        }
        Ok(Self {
            frame_number,
            width,
            height,
            samples,
            telemetry: Vec::new(),
        })
    }

    /// Attach the telemetry lines received while this frame was filling
    pub fn with_telemetry(mut self, telemetry: Vec<TelemetryLine>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major image samples (telemetry excluded)
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn row(&self, index: usize) -> Option<&[u16]> {
        let start = index.checked_mul(self.width)?;
        self.samples.get(start..start + self.width)
    }

    pub fn sample_at(&self, row: usize, col: usize) -> Option<u16> {
        if col >= self.width {
            return None;
        }
        self.samples.get(row * self.width + col).copied()
    }

    pub fn telemetry(&self) -> &[TelemetryLine] {
        &self.telemetry
    }

    /// Minimum and maximum raw sample value
    pub fn range(&self) -> Option<(u16, u16)> {
        let mut iter = self.samples.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), s| (lo.min(s), hi.max(s))))
    }

    /// Convert every sample to degrees Celsius
    pub fn to_celsius(&self, scale: &TemperatureScale) -> Vec<f64> {
        self.samples.iter().map(|&s| scale.celsius(s)).collect()
    }
}

/// Linear mapping from raw radiometric counts to degrees Celsius
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureScale {
    pub gain: f64,
    pub offset: f64,
}

impl TemperatureScale {
    pub fn celsius(&self, raw: u16) -> f64 {
        f64::from(raw) * self.gain + self.offset
    }
}

impl Default for TemperatureScale {
    /// TLinear output: counts are centikelvin
    fn default() -> Self {
        Self {
            gain: 0.01,
            offset: -273.15,
        }
    }
}

/// A palette-mapped image ready for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub frame_number: u64,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<Rgb>,
    /// Raw value mapped to the first palette entry
    pub min: u16,
    /// Raw value mapped to the last palette entry
    pub max: u16,
}

impl DisplayFrame {
    pub fn pixel_at(&self, x: usize, y: usize) -> Option<Rgb> {
        if x >= self.width {
            return None;
        }
        self.pixels.get(y * self.width + x).copied()
    }

    /// Pixels flattened to packed RGB8 bytes
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_frame_geometry() {
        let frame = RawFrame::new(1, 3, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(frame.row(1), Some(&[4, 5, 6][..]));
        assert_eq!(frame.row(2), None);
        assert_eq!(frame.sample_at(0, 2), Some(3));
        assert_eq!(frame.sample_at(0, 3), None);
        assert_eq!(frame.range(), Some((1, 6)));
    }

    #[test]
    fn test_raw_frame_rejects_short_buffer() {
        assert!(RawFrame::new(0, 4, 4, vec![0; 15]).is_err());
    }

    #[test]
    fn test_celsius_conversion() {
        let frame = RawFrame::new(0, 2, 1, vec![29815, 27315]).unwrap();
        let temps = frame.to_celsius(&TemperatureScale::default());
        assert!((temps[0] - 25.0).abs() < 1e-9);
        assert!(temps[1].abs() < 1e-9);
    }

    #[test]
    fn test_display_frame_bytes() {
        let frame = DisplayFrame {
            frame_number: 0,
            width: 2,
            height: 1,
            pixels: vec![[1, 2, 3], [4, 5, 6]],
            min: 0,
            max: 0,
        };
        assert_eq!(frame.to_rgb_bytes(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.pixel_at(1, 0), Some([4, 5, 6]));
        assert_eq!(frame.pixel_at(2, 0), None);
    }
}
