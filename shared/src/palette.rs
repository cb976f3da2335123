/*!
Colour palettes and raw-to-display conversion.

[`convert`] normalises a raw frame between its own minimum and maximum and
looks every sample up in a caller-supplied [`Palette`]. The converter keeps
no state between calls.
*/

use serde::{Deserialize, Serialize};

use crate::error::{Result, SharedError};
use crate::frame::{DisplayFrame, RawFrame, Rgb};

/// Entries in the built-in palettes
pub const BUILTIN_PALETTE_SIZE: usize = 256;

/// Built-in palette selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaletteKind {
    Grayscale,
    Ironblack,
    Rainbow,
}

impl PaletteKind {
    /// Parse palette name (case-insensitive)
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "grayscale" | "greyscale" | "gray" | "grey" => Some(Self::Grayscale),
            "ironblack" | "iron" => Some(Self::Ironblack),
            "rainbow" => Some(Self::Rainbow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grayscale => "grayscale",
            Self::Ironblack => "ironblack",
            Self::Rainbow => "rainbow",
        }
    }

    fn stops(&self) -> &'static [Rgb] {
        match self {
            Self::Grayscale => &[[0, 0, 0], [255, 255, 255]],
            Self::Ironblack => &[
                [0, 0, 0],
                [36, 0, 104],
                [120, 0, 156],
                [196, 28, 92],
                [236, 104, 12],
                [252, 188, 36],
                [255, 255, 255],
            ],
            Self::Rainbow => &[
                [0, 0, 128],
                [0, 0, 255],
                [0, 255, 255],
                [0, 255, 0],
                [255, 255, 0],
                [255, 0, 0],
                [255, 0, 255],
            ],
        }
    }

    /// Generate the palette table
    pub fn palette(&self) -> Palette {
        // Built-in stop lists always hold at least two entries
        let colors = interpolate(self.stops(), BUILTIN_PALETTE_SIZE);
        Palette {
            name: self.as_str().to_string(),
            colors,
        }
    }
}

/// Ordered colour lookup table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    name: String,
    colors: Vec<Rgb>,
}

impl Palette {
    /// Create a palette from an explicit table
    pub fn new(name: impl Into<String>, colors: Vec<Rgb>) -> Result<Self> {
        if colors.is_empty() {
            return Err(SharedError::invalid_palette("palette must have at least one entry"));
        }
        Ok(Self {
            name: name.into(),
            colors,
        })
    }

    /// Create a palette of `size` entries by interpolating between colour stops
    pub fn from_stops(name: impl Into<String>, stops: &[Rgb], size: usize) -> Result<Self> {
        if stops.len() < 2 {
            return Err(SharedError::invalid_palette("at least two colour stops are required"));
        }
        if size < 2 {
            return Err(SharedError::invalid_palette(format!(
                "palette size must be at least 2, got {}",
                size
            )));
        }
        Self::new(name, interpolate(stops, size))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

impl Default for Palette {
    fn default() -> Self {
        PaletteKind::Ironblack.palette()
    }
}

fn interpolate(stops: &[Rgb], size: usize) -> Vec<Rgb> {
    let segments = (stops.len() - 1) as f64;
    (0..size)
        .map(|i| {
            let t = i as f64 * segments / (size - 1) as f64;
            let seg = (t.floor() as usize).min(stops.len() - 2);
            let frac = t - seg as f64;
            let (a, b) = (stops[seg], stops[seg + 1]);
            let mut out = [0u8; 3];
            for c in 0..3 {
                let v = f64::from(a[c]) + (f64::from(b[c]) - f64::from(a[c])) * frac;
                out[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            out
        })
        .collect()
}

/// Palette index for a sample normalised between `min` and `max`.
///
/// `round((sample - min) * (len - 1) / (max - min))` with halves rounded up,
/// clamped to the table. A degenerate range maps to the middle entry.
pub fn palette_index(sample: u16, min: u16, max: u16, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let last = (len - 1) as u64;
    if max <= min {
        return len / 2;
    }
    let range = u64::from(max - min);
    let offset = u64::from(sample.saturating_sub(min)).min(range);
    ((offset * last * 2 + range) / (2 * range)).min(last) as usize
}

/// Map a raw frame to display pixels through a palette
pub fn convert(raw: &RawFrame, palette: &Palette) -> DisplayFrame {
    let (min, max) = raw.range().unwrap_or((0, 0));
    let colors = palette.colors();

    let pixels = raw
        .samples()
        .iter()
        .map(|&s| colors[palette_index(s, min, max, colors.len())])
        .collect();

    DisplayFrame {
        frame_number: raw.frame_number,
        width: raw.width(),
        height: raw.height(),
        pixels,
        min,
        max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_palette(size: usize) -> Palette {
        let colors = (0..size).map(|i| [i as u8, 0, 0]).collect();
        Palette::new("ramp", colors).unwrap()
    }

    #[test]
    fn test_index_endpoints_and_midpoint() {
        assert_eq!(palette_index(100, 100, 200, 16), 0);
        assert_eq!(palette_index(200, 100, 200, 16), 15);
        // 50 * 15 / 100 = 7.5 rounds up
        assert_eq!(palette_index(150, 100, 200, 16), 8);
        assert_eq!(palette_index(149, 100, 200, 16), 7);
    }

    #[test]
    fn test_index_clamps_out_of_range_samples() {
        assert_eq!(palette_index(10, 100, 200, 16), 0);
        assert_eq!(palette_index(5000, 100, 200, 16), 15);
    }

    #[test]
    fn test_convert_known_frame() {
        let raw = RawFrame::new(9, 3, 1, vec![100, 150, 200]).unwrap();
        let display = convert(&raw, &ramp_palette(16));

        assert_eq!(display.frame_number, 9);
        assert_eq!((display.min, display.max), (100, 200));
        assert_eq!(display.pixels, vec![[0, 0, 0], [8, 0, 0], [15, 0, 0]]);
    }

    #[test]
    fn test_convert_uniform_frame() {
        let raw = RawFrame::new(0, 4, 2, vec![8192; 8]).unwrap();
        let display = convert(&raw, &ramp_palette(16));

        assert_eq!((display.min, display.max), (8192, 8192));
        assert!(display.pixels.iter().all(|&p| p == [8, 0, 0]));
    }

    #[test]
    fn test_telemetry_does_not_affect_range() {
        let raw = RawFrame::new(0, 2, 1, vec![10, 20])
            .unwrap()
            .with_telemetry(vec![crate::frame::TelemetryLine {
                line_id: 60,
                payload: vec![0xFF; 160],
            }]);
        let display = convert(&raw, &ramp_palette(4));
        assert_eq!((display.min, display.max), (10, 20));
    }

    #[test]
    fn test_builtin_palettes() {
        for kind in [PaletteKind::Grayscale, PaletteKind::Ironblack, PaletteKind::Rainbow] {
            let palette = kind.palette();
            assert_eq!(palette.len(), BUILTIN_PALETTE_SIZE);
            assert_eq!(palette.colors()[0], kind.stops()[0]);
            assert_eq!(palette.colors()[255], *kind.stops().last().unwrap());
            assert_eq!(PaletteKind::from_name(kind.as_str()), Some(kind));
        }
        let gray = PaletteKind::Grayscale.palette();
        assert_eq!(gray.colors()[128], [128, 128, 128]);
        assert_eq!(PaletteKind::from_name("IRON"), Some(PaletteKind::Ironblack));
        assert_eq!(PaletteKind::from_name("sepia"), None);
    }

    #[test]
    fn test_invalid_palettes() {
        assert!(Palette::new("empty", Vec::new()).is_err());
        assert!(Palette::from_stops("one", &[[0, 0, 0]], 16).is_err());
        assert!(Palette::from_stops("tiny", &[[0, 0, 0], [1, 1, 1]], 1).is_err());
    }
}
