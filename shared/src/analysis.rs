/*!
Temperature readings at points of interest.

A point reading is the temperature of one pixel. A region reading covers the
square of `extension` pixels on every side of the point, cut back at the
frame edges so it never leaves the image.
*/

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SharedError};
use crate::frame::{RawFrame, TemperatureScale};

/// A named pixel location to report on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointOfInterest {
    pub name: String,
    pub row: usize,
    pub col: usize,
}

impl PointOfInterest {
    pub fn new(name: impl Into<String>, row: usize, col: usize) -> Self {
        Self {
            name: name.into(),
            row,
            col,
        }
    }
}

/// Temperature summary over a rectangular region
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionStats {
    pub rows: RangeInclusive<usize>,
    pub cols: RangeInclusive<usize>,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl RegionStats {
    pub fn height(&self) -> usize {
        self.rows.end() - self.rows.start() + 1
    }

    pub fn width(&self) -> usize {
        self.cols.end() - self.cols.start() + 1
    }
}

/// Point and region reading for one point of interest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointReport {
    pub point: PointOfInterest,
    pub temperature: f64,
    pub region: RegionStats,
}

/// Temperature of one pixel, or `None` outside the frame
pub fn point_temperature(
    frame: &RawFrame,
    scale: &TemperatureScale,
    row: usize,
    col: usize,
) -> Option<f64> {
    frame.sample_at(row, col).map(|raw| scale.celsius(raw))
}

/// Min, max and mean over the region around `(row, col)`, clamped to the frame
pub fn region_stats(
    frame: &RawFrame,
    scale: &TemperatureScale,
    row: usize,
    col: usize,
    extension: usize,
) -> Option<RegionStats> {
    if row >= frame.height() || col >= frame.width() {
        return None;
    }

    let rows = row.saturating_sub(extension)..=(row + extension).min(frame.height() - 1);
    let cols = col.saturating_sub(extension)..=(col + extension).min(frame.width() - 1);

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0usize;

    for r in rows.clone() {
        let line = frame.row(r)?;
        for &raw in &line[cols.clone()] {
            let t = scale.celsius(raw);
            min = min.min(t);
            max = max.max(t);
            sum += t;
            count += 1;
        }
    }

    Some(RegionStats {
        rows,
        cols,
        min,
        max,
        mean: sum / count as f64,
    })
}

/// Read every point of interest; a point outside the frame is an error
pub fn analyze_points(
    frame: &RawFrame,
    scale: &TemperatureScale,
    points: &[PointOfInterest],
    extension: usize,
) -> Result<Vec<PointReport>> {
    points
        .iter()
        .map(|point| {
            let out_of_bounds = || SharedError::PointOutOfBounds {
                name: point.name.clone(),
                row: point.row,
                col: point.col,
                width: frame.width(),
                height: frame.height(),
            };
            let temperature =
                point_temperature(frame, scale, point.row, point.col).ok_or_else(out_of_bounds)?;
            let region = region_stats(frame, scale, point.row, point.col, extension)
                .ok_or_else(out_of_bounds)?;
            Ok(PointReport {
                point: point.clone(),
                temperature,
                region,
            })
        })
        .collect()
}
