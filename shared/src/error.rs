/*!
Common error types for the thermal acquisition components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// The packet layout is internally inconsistent
    #[error("Invalid packet layout: {0}")]
    InvalidLayout(String),

    /// A block handed to the framer does not match the session packet size
    #[error("Invalid packet length: expected {expected} bytes, got {actual}")]
    InvalidPacketLength { expected: usize, actual: usize },

    /// Palette construction errors
    #[error("Invalid palette: {0}")]
    InvalidPalette(String),

    /// Raw frame does not match its declared geometry
    #[error("Invalid frame data: {0}")]
    InvalidFrame(String),

    /// A point of interest lies outside the frame
    #[error("Point {name} at row {row}, column {col} is outside the {width}x{height} frame")]
    PointOutOfBounds {
        name: String,
        row: usize,
        col: usize,
        width: usize,
        height: usize,
    },

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SharedError {
    /// Create a new invalid layout error
    pub fn invalid_layout(msg: impl Into<String>) -> Self {
        Self::InvalidLayout(msg.into())
    }

    /// Create a new invalid palette error
    pub fn invalid_palette(msg: impl Into<String>) -> Self {
        Self::InvalidPalette(msg.into())
    }

    /// Create a new invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }
}
