/*!
Snapshot-to-disk side effect.

Writes one display frame as an image file, optionally with a temperature
table and a JSON metadata file next to it. With a test name configured, each
snapshot also gets a numbered data log holding the point-of-interest readings
and the full temperature array. Failures are returned to the caller and never
touch the acquisition loop.
*/

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use image::RgbImage;
use lepton_shared::{analyze_points, DisplayFrame, PointReport, RawFrame, SharedError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::SnapshotConfig;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Pixel buffer does not match {width}x{height}")]
    Geometry { width: usize, height: usize },

    #[error("Failed to serialize snapshot metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Point of interest analysis failed: {0}")]
    Analysis(#[from] SharedError),
}

/// Files produced by one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFiles {
    pub image: PathBuf,
    pub temperatures: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
    pub data_log: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SnapshotMetadata<'a> {
    frame_number: u64,
    width: usize,
    height: usize,
    min_raw: u16,
    max_raw: u16,
    min_celsius: f64,
    max_celsius: f64,
    palette: &'a str,
    telemetry_lines: usize,
    captured_at: String,
    points: &'a [PointReport],
}

/// Path for the `sequence`-th snapshot of a session in `dir`
pub fn snapshot_path(dir: &Path, sequence: u32) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("lepton_{}_{:04}.png", timestamp, sequence))
}

/// Write a display frame (and optional sidecars) to `path`.
///
/// The image format follows the file extension; a path without one gets `.png`.
pub fn save_snapshot(
    path: &Path,
    frame: &DisplayFrame,
    raw: &RawFrame,
    palette_name: &str,
    config: &SnapshotConfig,
) -> Result<SnapshotFiles, SnapshotError> {
    let image_path = if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension("png")
    };

    if let Some(parent) = image_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let image = RgbImage::from_raw(
        frame.width as u32,
        frame.height as u32,
        frame.to_rgb_bytes(),
    )
    .ok_or(SnapshotError::Geometry {
        width: frame.width,
        height: frame.height,
    })?;

    image.save(&image_path).map_err(|source| SnapshotError::Encode {
        path: image_path.clone(),
        source,
    })?;

    let captured_at = Local::now();
    let points = analyze_points(
        raw,
        &config.temperature_scale,
        &config.points_of_interest,
        config.region_extension,
    )?;

    let temperatures = if config.write_temperatures {
        let txt_path = image_path.with_extension("txt");
        write_file(&txt_path, temperature_table(raw, config))?;
        Some(txt_path)
    } else {
        None
    };

    let metadata = if config.write_metadata {
        let scale = &config.temperature_scale;
        let meta = SnapshotMetadata {
            frame_number: frame.frame_number,
            width: frame.width,
            height: frame.height,
            min_raw: frame.min,
            max_raw: frame.max,
            min_celsius: scale.celsius(frame.min),
            max_celsius: scale.celsius(frame.max),
            palette: palette_name,
            telemetry_lines: raw.telemetry().len(),
            captured_at: captured_at.to_rfc3339(),
            points: &points,
        };
        let json_path = image_path.with_extension("json");
        write_file(&json_path, serde_json::to_string_pretty(&meta)?)?;
        Some(json_path)
    } else {
        None
    };

    let data_log = match &config.test_name {
        Some(test_name) => {
            let dir = config.output_directory.join(test_name);
            let content = data_log(raw, config, &points, captured_at);
            Some(write_data_log(&dir, test_name, content)?)
        }
        None => None,
    };

    info!("📸 Snapshot of frame {} saved to {}", frame.frame_number, image_path.display());

    Ok(SnapshotFiles {
        image: image_path,
        temperatures,
        metadata,
        data_log,
    })
}

/// Point readings followed by the full temperature array
fn data_log(
    raw: &RawFrame,
    config: &SnapshotConfig,
    points: &[PointReport],
    captured_at: DateTime<Local>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Date: {}", captured_at.format("%m/%d/%Y"));
    let _ = writeln!(out, "Time: {}", captured_at.format("%H:%M:%S"));
    let _ = writeln!(out, "Frame: {}", raw.frame_number);

    for report in points {
        let region = &report.region;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{}: row {} column {}: {:.2} C",
            report.point.name, report.point.row, report.point.col, report.temperature
        );
        let _ = writeln!(
            out,
            "Region rows {}-{} columns {}-{} ({}x{}): max {:.2} C, min {:.2} C, average {:.2} C",
            region.rows.start(),
            region.rows.end(),
            region.cols.start(),
            region.cols.end(),
            region.width(),
            region.height(),
            region.max,
            region.min,
            region.mean
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Full temperature array:");
    out.push_str(&temperature_table(raw, config));
    out
}

/// Write `<dir>/<test_name>Lepton<N>.txt` with the first N (from 1) not yet taken
fn write_data_log(dir: &Path, test_name: &str, content: String) -> Result<PathBuf, SnapshotError> {
    std::fs::create_dir_all(dir).map_err(|source| SnapshotError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let (path, mut file) = create_numbered(dir, test_name)?;
    file.write_all(content.as_bytes())
        .map_err(|source| SnapshotError::Io {
            path: path.clone(),
            source,
        })?;
    info!("📝 Data log written to {}", path.display());
    Ok(path)
}

fn create_numbered(dir: &Path, test_name: &str) -> Result<(PathBuf, File), SnapshotError> {
    let mut number = 1u32;
    loop {
        let path = dir.join(format!("{}Lepton{}.txt", test_name, number));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => number += 1,
            Err(source) => return Err(SnapshotError::Io { path, source }),
        }
    }
}

/// One line per image row, Celsius values separated by two spaces
fn temperature_table(raw: &RawFrame, config: &SnapshotConfig) -> String {
    let temps = raw.to_celsius(&config.temperature_scale);
    let mut out = String::with_capacity(temps.len() * 8);
    for row in temps.chunks(raw.width().max(1)) {
        for (i, t) in row.iter().enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            let _ = write!(out, "{:.2}", t);
        }
        out.push('\n');
    }
    out
}

fn write_file(path: &Path, content: String) -> Result<(), SnapshotError> {
    std::fs::write(path, content).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lepton_shared::{convert, PaletteKind, PointOfInterest};

    fn frames() -> (DisplayFrame, RawFrame) {
        let raw = RawFrame::new(7, 3, 2, vec![27415, 27515, 27615, 29815, 29915, 30015]).unwrap();
        let converted = convert(&raw, &PaletteKind::Grayscale.palette());
        (converted, raw)
    }

    #[test]
    fn test_snapshot_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let (frame, raw) = frames();
        let config = SnapshotConfig::default();

        let files = save_snapshot(&dir.path().join("shot"), &frame, &raw, "grayscale", &config)
            .unwrap();

        assert_eq!(files.image, dir.path().join("shot.png"));
        let img = image::open(&files.image).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(2, 1).0, [255, 255, 255]);

        let txt = std::fs::read_to_string(files.temperatures.unwrap()).unwrap();
        let lines: Vec<&str> = txt.lines().collect();
        assert_eq!(lines, vec!["1.00  2.00  3.00", "25.00  26.00  27.00"]);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(files.metadata.unwrap()).unwrap())
                .unwrap();
        assert_eq!(json["frame_number"], 7);
        assert_eq!(json["min_raw"], 27415);
        assert_eq!(json["palette"], "grayscale");
        assert_eq!(json["points"].as_array().unwrap().len(), 0);
        assert!(files.data_log.is_none());
    }

    #[test]
    fn test_metadata_and_log_report_points() {
        let dir = tempfile::tempdir().unwrap();
        let (frame, raw) = frames();
        let config = SnapshotConfig {
            output_directory: dir.path().to_path_buf(),
            test_name: Some("oven".to_string()),
            points_of_interest: vec![PointOfInterest::new("corner", 1, 2)],
            region_extension: 1,
            ..SnapshotConfig::default()
        };

        let files = save_snapshot(&dir.path().join("shot.png"), &frame, &raw, "grayscale", &config)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(files.metadata.unwrap()).unwrap())
                .unwrap();
        let point = &json["points"][0];
        assert_eq!(point["point"]["name"], "corner");
        let close = |v: &serde_json::Value, expected: f64| (v.as_f64().unwrap() - expected).abs() < 1e-6;
        assert!(close(&point["temperature"], 27.0));
        // Region cut back to the 2x2 bottom-right corner
        assert!(close(&point["region"]["min"], 2.0));
        assert!(close(&point["region"]["max"], 27.0));
        assert_eq!(point["region"]["rows"]["start"], 0);

        let log_path = files.data_log.unwrap();
        assert_eq!(log_path, dir.path().join("oven").join("ovenLepton1.txt"));
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.starts_with("Date: "));
        assert!(log.contains("Frame: 7"));
        assert!(log.contains("corner: row 1 column 2: 27.00 C"));
        assert!(log.contains("Region rows 0-1 columns 1-2 (2x2): max 27.00 C, min 2.00 C, average 14.50 C"));
        assert!(log.ends_with("Full temperature array:\n1.00  2.00  3.00\n25.00  26.00  27.00\n"));
    }

    #[test]
    fn test_data_log_numbers_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (frame, raw) = frames();
        let config = SnapshotConfig {
            output_directory: dir.path().to_path_buf(),
            test_name: Some("run".to_string()),
            write_temperatures: false,
            write_metadata: false,
            ..SnapshotConfig::default()
        };

        let log_dir = dir.path().join("run");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("runLepton1.txt"), b"earlier session").unwrap();

        let second = save_snapshot(&dir.path().join("a.png"), &frame, &raw, "x", &config)
            .unwrap()
            .data_log
            .unwrap();
        let third = save_snapshot(&dir.path().join("b.png"), &frame, &raw, "x", &config)
            .unwrap()
            .data_log
            .unwrap();

        assert_eq!(second, log_dir.join("runLepton2.txt"));
        assert_eq!(third, log_dir.join("runLepton3.txt"));
        assert_eq!(
            std::fs::read_to_string(log_dir.join("runLepton1.txt")).unwrap(),
            "earlier session"
        );
    }

    #[test]
    fn test_point_outside_frame_fails_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (frame, raw) = frames();
        let config = SnapshotConfig {
            points_of_interest: vec![PointOfInterest::new("off", 2, 0)],
            ..SnapshotConfig::default()
        };
        let result = save_snapshot(&dir.path().join("x.png"), &frame, &raw, "x", &config);
        assert!(matches!(result, Err(SnapshotError::Analysis(_))));
    }

    #[test]
    fn test_sidecars_optional() {
        let dir = tempfile::tempdir().unwrap();
        let (frame, raw) = frames();
        let config = SnapshotConfig {
            write_temperatures: false,
            write_metadata: false,
            ..SnapshotConfig::default()
        };

        let files =
            save_snapshot(&dir.path().join("a/b/frame.bmp"), &frame, &raw, "x", &config).unwrap();
        assert!(files.image.exists());
        assert!(files.temperatures.is_none());
        assert!(files.metadata.is_none());
        assert!(!dir.path().join("a/b/frame.txt").exists());
    }

    #[test]
    fn test_unwritable_destination_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let (frame, raw) = frames();

        let result = save_snapshot(
            &blocker.join("shot.png"),
            &frame,
            &raw,
            "x",
            &SnapshotConfig::default(),
        );
        assert!(matches!(result, Err(SnapshotError::Io { .. })));
    }

    #[test]
    fn test_geometry_mismatch() {
        let (mut frame, raw) = frames();
        frame.pixels.pop();
        let dir = tempfile::tempdir().unwrap();
        let result = save_snapshot(
            &dir.path().join("x.png"),
            &frame,
            &raw,
            "x",
            &SnapshotConfig::default(),
        );
        assert!(matches!(result, Err(SnapshotError::Geometry { .. })));
    }

    #[test]
    fn test_snapshot_path_sequence() {
        let path = snapshot_path(Path::new("/tmp/shots"), 3);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("lepton_"));
        assert!(name.ends_with("_0003.png"));
    }
}
