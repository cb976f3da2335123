/*!
# Lepton Grabber

Acquisition pipeline for a Lepton-class thermal sensor: SPI packet transport,
frame reassembly, palette conversion, latest-frame publication and snapshots.
The `lepton-grabber` binary is a thin CLI over [`CaptureHandle`].

## Modules

- [`transport`] - SPI packet reads and the device opener seam
- [`cci`] - I2C command interface (flat-field correction)
- [`synthetic`] - Hardware-free sensor for tests and `--debug` runs
- [`frame_sync`] - Frame assembler and desync watchdog
- [`publisher`] - Latest-frame slot and pending-command slot
- [`capture`] - Worker loop and its control handle
- [`control`] - Line-based control commands for an interactive session
- [`snapshot`] - Image, temperature table, metadata and data log writer
- [`config`] - TOML configuration
*/

pub mod capture;
pub mod cci;
pub mod config;
pub mod control;
pub mod frame_sync;
pub mod publisher;
pub mod snapshot;
pub mod synthetic;
pub mod transport;

pub use capture::{CaptureError, CaptureHandle, CaptureSettings, WorkerEvent, WorkerState};
pub use config::AppConfig;
pub use publisher::PendingCommand;
