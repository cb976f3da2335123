/*!
Line-sequence frame synchronization state machine.

The bus carries no frame delimiter other than line index 0, so a frame is
accepted only as an unbroken run of rows 0..N-1. Any gap, repeat or
regression throws the partial frame away and waits for the next row 0.
*/

use std::time::{Duration, Instant};

use lepton_shared::{PacketClass, PacketLayout, RawFrame, TelemetryLine};
use tracing::{debug, info, trace};

/// Frame synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Waiting for row 0
    WaitingForStart,
    /// Collecting rows, expecting `next_row`
    Filling { next_row: usize },
}

/// Outcome of folding one packet into the assembler
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyEvent {
    /// Packet carried nothing for the current frame
    Ignored,
    /// Row or telemetry line accepted into the frame in progress
    Accepted,
    /// Sequence broken; partial frame discarded
    Desync { expected: usize, got: usize },
    /// Final row accepted
    Complete(RawFrame),
}

/// Counters kept by the assembler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames_completed: u64,
    pub desyncs: u64,
    pub discarded_packets: u64,
    pub telemetry_lines: u64,
}

/// Folds classified packets into complete raw frames
pub struct FrameAssembler {
    state: AssemblerState,
    width: usize,
    rows: usize,
    samples: Vec<u16>,
    telemetry: Vec<TelemetryLine>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create an assembler for the geometry of a packet layout
    pub fn new(layout: &PacketLayout) -> Self {
        Self {
            state: AssemblerState::WaitingForStart,
            width: layout.image_width,
            rows: layout.image_rows,
            samples: Vec::with_capacity(layout.image_width * layout.image_rows),
            telemetry: Vec::new(),
            stats: AssemblerStats::default(),
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Rows accumulated for the frame in progress
    pub fn rows_filled(&self) -> usize {
        self.samples.len() / self.width
    }

    /// Drop any partial frame and wait for row 0
    pub fn reset(&mut self) {
        self.samples.clear();
        self.telemetry.clear();
        self.state = AssemblerState::WaitingForStart;
    }

    /// Fold one classified packet
    pub fn push(&mut self, class: PacketClass) -> AssemblyEvent {
        match class {
            PacketClass::Discard(reason) => {
                trace!("Discard packet ({:?})", reason);
                self.stats.discarded_packets += 1;
                AssemblyEvent::Ignored
            }

            PacketClass::Telemetry(line) => match self.state {
                AssemblerState::WaitingForStart => AssemblyEvent::Ignored,
                AssemblerState::Filling { .. } => {
                    self.stats.telemetry_lines += 1;
                    self.telemetry.push(line);
                    AssemblyEvent::Accepted
                }
            },

            PacketClass::Image(line) => match self.state {
                AssemblerState::WaitingForStart => {
                    if line.index != 0 {
                        return AssemblyEvent::Ignored;
                    }
                    trace!("📦 Frame start detected");
                    self.samples.clear();
                    self.telemetry.clear();
                    self.append_row(line.samples);
                    self.advance(1)
                }

                AssemblerState::Filling { next_row } => {
                    if line.index != next_row {
                        self.stats.desyncs += 1;
                        debug!(
                            "⚠️ Line sequence broken: expected {}, got {} ({} rows discarded)",
                            next_row,
                            line.index,
                            self.rows_filled()
                        );
                        self.reset();
                        return AssemblyEvent::Desync {
                            expected: next_row,
                            got: line.index,
                        };
                    }
                    self.append_row(line.samples);
                    self.advance(next_row + 1)
                }
            },
        }
    }

    fn append_row(&mut self, mut samples: Vec<u16>) {
        samples.resize(self.width, 0);
        self.samples.extend_from_slice(&samples);
    }

    fn advance(&mut self, next_row: usize) -> AssemblyEvent {
        if next_row < self.rows {
            self.state = AssemblerState::Filling { next_row };
            return AssemblyEvent::Accepted;
        }

        let frame_number = self.stats.frames_completed;
        self.stats.frames_completed += 1;
        self.state = AssemblerState::WaitingForStart;

        let samples = std::mem::replace(
            &mut self.samples,
            Vec::with_capacity(self.width * self.rows),
        );
        let telemetry = std::mem::take(&mut self.telemetry);

        match RawFrame::new(frame_number, self.width, self.rows, samples) {
            Ok(frame) => {
                trace!("✅ Frame {} complete", frame_number);
                AssemblyEvent::Complete(frame.with_telemetry(telemetry))
            }
            // Rows are padded to the layout width, so the buffer always fits
            Err(_) => AssemblyEvent::Ignored,
        }
    }
}

/// Detects a resync that has not succeeded for too many frame periods.
///
/// Elapsed time is measured on the wall clock from the last completed frame,
/// so inter-frame discard traffic does not shorten the window. Trips once per
/// episode and re-arms when a frame completes.
#[derive(Debug, Clone)]
pub struct DesyncWatchdog {
    frame_period: Duration,
    frame_limit: u32,
    last_frame: Instant,
    last_packet: Instant,
    tripped: bool,
}

impl DesyncWatchdog {
    /// `frame_limit` of zero disables the watchdog
    pub fn new(frame_limit: u32, frame_period: Duration) -> Self {
        Self::starting_at(frame_limit, frame_period, Instant::now())
    }

    /// Watchdog whose first window opens at `now`
    pub fn starting_at(frame_limit: u32, frame_period: Duration, now: Instant) -> Self {
        Self {
            frame_period: frame_period.max(Duration::from_micros(1)),
            frame_limit,
            last_frame: now,
            last_packet: now,
            tripped: false,
        }
    }

    /// Record one packet read; returns true when the limit is first exceeded
    pub fn packet(&mut self) -> bool {
        self.packet_at(Instant::now())
    }

    pub fn packet_at(&mut self, now: Instant) -> bool {
        self.last_packet = now;
        if self.frame_limit == 0 || self.tripped {
            return false;
        }
        if now.saturating_duration_since(self.last_frame) > self.frame_period * self.frame_limit {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn frame_completed(&mut self) {
        self.frame_completed_at(Instant::now());
    }

    pub fn frame_completed_at(&mut self, now: Instant) {
        self.last_packet = now;
        if self.tripped {
            info!(
                "🔒 Resynchronized after {} frame periods",
                self.frame_periods_elapsed()
            );
        }
        self.reset_at(now);
    }

    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.last_frame = now;
        self.last_packet = now;
        self.tripped = false;
    }

    /// Whole frame periods between the last completed frame and the latest packet
    pub fn frame_periods_elapsed(&self) -> u64 {
        let elapsed = self.last_packet.saturating_duration_since(self.last_frame);
        (elapsed.as_nanos() / self.frame_period.as_nanos()) as u64
    }
}
