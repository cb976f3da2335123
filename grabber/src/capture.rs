/*!
Acquisition worker and its control handle.

One dedicated thread runs the loop: read a packet, classify it, fold it into
the frame assembler, and on a complete frame convert and publish it. Control
requests are picked up between packets. The only blocking point is the
transport read.
*/

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use lepton_shared::{
    convert, DisplayFrame, FramerStats, PacketFramer, PacketLayout, Palette, RawFrame,
    SharedError,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, SnapshotConfig};
use crate::frame_sync::{AssemblerStats, AssemblyEvent, DesyncWatchdog, FrameAssembler};
use crate::publisher::{PendingCommand, Publisher};
use crate::snapshot::{save_snapshot, SnapshotFiles};
use crate::transport::{DeviceCommand, PacketTransport, TransportError, TransportOpener};

/// Lifecycle of the acquisition loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker running
    Idle,
    /// Reading packets, waiting for a complete frame
    Syncing,
    /// Frames are completing
    Capturing,
    /// Worker is exiting (or exited after a fatal error)
    Stopping,
}

/// Conditions surfaced to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// No complete frame for `frame_periods` frame periods; the worker keeps retrying
    DesyncWarning { frame_periods: u64 },
    /// The transport failed; the worker has stopped
    Fatal(String),
    /// A device command could not be sent; acquisition continues
    CommandFailed { command: DeviceCommand, error: String },
    SnapshotSaved(SnapshotFiles),
    SnapshotFailed { path: PathBuf, error: String },
    /// The transport was re-opened on request
    Restarted,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] SharedError),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Acquisition worker panicked")]
    WorkerPanicked,

    #[error("Transport opener was lost with a panicked worker")]
    OpenerUnavailable,
}

/// Settings for one acquisition session
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub layout: PacketLayout,
    /// Frame periods without a complete frame before a desync warning (0 disables)
    pub desync_frame_limit: u32,
    /// Nominal time between frames
    pub frame_period: Duration,
    pub reopen_on_desync: bool,
    pub resync_delay: Duration,
    pub stats_interval: Duration,
    pub snapshot: SnapshotConfig,
}

impl CaptureSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            layout: config.device.layout.clone(),
            desync_frame_limit: config.capture.desync_frame_limit,
            frame_period: Duration::from_millis(config.capture.frame_period_ms),
            reopen_on_desync: config.capture.reopen_on_desync,
            resync_delay: Duration::from_millis(config.capture.resync_delay_ms),
            stats_interval: Duration::from_secs(config.capture.stats_interval_seconds.max(1)),
            snapshot: config.snapshot.clone(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Counters of one worker run
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub framer: FramerStats,
    pub assembler: AssemblerStats,
    pub frames_published: u64,
    pub desync_warnings: u64,
    pub reopens: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the handle and the worker thread
#[derive(Clone)]
struct Shared {
    publisher: Publisher,
    palette: Arc<Mutex<Arc<Palette>>>,
    state: Arc<Mutex<WorkerState>>,
    running: Arc<AtomicBool>,
    events: Sender<WorkerEvent>,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        *lock(&self.state) = state;
    }

    fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    fn emit(&self, event: WorkerEvent) {
        // The handle owns a receiver, so the channel never disconnects
        let _ = self.events.send(event);
    }
}

/// What the worker hands back when it exits
struct WorkerExit {
    opener: Box<dyn TransportOpener>,
    stats: WorkerStats,
}

struct Worker {
    settings: CaptureSettings,
    shared: Shared,
    opener: Box<dyn TransportOpener>,
    transport: Option<Box<dyn PacketTransport>>,
    framer: PacketFramer,
    assembler: FrameAssembler,
    watchdog: DesyncWatchdog,
    snapshot_target: Option<PathBuf>,
    stats: WorkerStats,
}

impl Worker {
    fn run(mut self) -> WorkerExit {
        info!("🚀 Acquisition worker started");
        let start_time = Instant::now();
        let mut last_report = Instant::now();
        let mut frames_at_report = 0u64;

        while self.shared.running.load(Ordering::SeqCst) {
            if let Err(e) = self.step() {
                error!("❌ Bus failure, stopping acquisition: {}", e);
                self.shared.set_state(WorkerState::Stopping);
                self.transport = None;
                self.shared.emit(WorkerEvent::Fatal(e.to_string()));
                break;
            }

            if last_report.elapsed() >= self.settings.stats_interval {
                let frames = self.stats.frames_published - frames_at_report;
                let fps = frames as f64 / last_report.elapsed().as_secs_f64();
                info!(
                    "📊 {} frames, {:.1} fps, {} desyncs, {} checksum errors",
                    self.stats.frames_published,
                    fps,
                    self.assembler.stats().desyncs,
                    self.framer.stats().checksum_errors
                );
                frames_at_report = self.stats.frames_published;
                last_report = Instant::now();
            }
        }

        if self.shared.state() != WorkerState::Stopping {
            self.shared.set_state(WorkerState::Stopping);
        }
        self.transport = None;

        self.stats.framer = self.framer.stats();
        self.stats.assembler = self.assembler.stats();
        let stats = self.stats;

        info!("📈 Acquisition worker final stats:");
        info!("   Packets: {}", stats.framer.packets);
        info!("   Frames published: {}", stats.frames_published);
        info!("   Discard packets: {}", stats.framer.discard_markers);
        info!("   Checksum errors: {}", stats.framer.checksum_errors);
        info!("   Desyncs: {}", stats.assembler.desyncs);
        info!("   Desync warnings: {}", stats.desync_warnings);
        info!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());

        WorkerExit {
            opener: self.opener,
            stats,
        }
    }

    fn transport(&mut self) -> Result<&mut Box<dyn PacketTransport>, TransportError> {
        if self.transport.is_none() {
            self.transport = Some(self.opener.open()?);
            self.stats.reopens += 1;
        }
        self.transport.as_mut().ok_or_else(|| {
            TransportError::Io(io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
        })
    }

    /// One loop iteration; an error is fatal to this run
    fn step(&mut self) -> Result<(), TransportError> {
        let packet = self.transport()?.read_packet()?;
        let class = self.framer.classify(&packet);
        let desync_limit_hit = self.watchdog.packet();

        match self.assembler.push(class) {
            AssemblyEvent::Complete(raw) => self.frame_completed(raw),
            AssemblyEvent::Desync { .. } => {
                if self.shared.state() == WorkerState::Capturing {
                    self.shared.set_state(WorkerState::Syncing);
                }
            }
            AssemblyEvent::Accepted | AssemblyEvent::Ignored => {}
        }

        if desync_limit_hit {
            self.persistent_desync()?;
        }

        if let Some(command) = self.shared.publisher.take_command() {
            self.handle_command(command)?;
        }
        Ok(())
    }

    fn frame_completed(&mut self, raw: RawFrame) {
        self.watchdog.frame_completed();
        if self.shared.state() != WorkerState::Capturing {
            info!("🔒 SYNCHRONIZED: frame {} complete", raw.frame_number);
            self.shared.set_state(WorkerState::Capturing);
        }

        let palette = Arc::clone(&*lock(&self.shared.palette));
        let converted = Arc::new(convert(&raw, &palette));
        self.shared.publisher.publish(Arc::clone(&converted));
        self.stats.frames_published += 1;

        if let Some(path) = self.snapshot_target.take() {
            self.write_snapshot(path, &converted, &raw, palette.name());
        }
    }

    fn write_snapshot(&self, path: PathBuf, frame: &DisplayFrame, raw: &RawFrame, palette: &str) {
        match save_snapshot(&path, frame, raw, palette, &self.settings.snapshot) {
            Ok(files) => self.shared.emit(WorkerEvent::SnapshotSaved(files)),
            Err(e) => {
                warn!("⚠️ Snapshot to {} failed: {}", path.display(), e);
                self.shared.emit(WorkerEvent::SnapshotFailed {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    fn persistent_desync(&mut self) -> Result<(), TransportError> {
        let frame_periods = self.watchdog.frame_periods_elapsed();
        warn!(
            "⚠️ No complete frame for {} frame periods, device unresponsive",
            frame_periods
        );
        self.stats.desync_warnings += 1;
        self.shared.set_state(WorkerState::Syncing);
        self.shared.emit(WorkerEvent::DesyncWarning { frame_periods });

        if self.settings.reopen_on_desync {
            info!(
                "🔄 Re-opening bus after {} ms idle",
                self.settings.resync_delay.as_millis()
            );
            self.transport = None;
            thread::sleep(self.settings.resync_delay);
            self.assembler.reset();
            self.transport()?;
        }
        Ok(())
    }

    fn handle_command(&mut self, command: PendingCommand) -> Result<(), TransportError> {
        debug!("Handling command {:?}", command);
        match command {
            PendingCommand::Ffc => {
                let result = self.transport()?.send_command(DeviceCommand::RunFfc);
                match result {
                    Ok(()) => info!("🎯 Flat-field correction requested"),
                    Err(e) => {
                        warn!("⚠️ Flat-field correction failed: {}", e);
                        self.shared.emit(WorkerEvent::CommandFailed {
                            command: DeviceCommand::RunFfc,
                            error: e.to_string(),
                        });
                    }
                }
            }
            PendingCommand::Snapshot(path) => {
                if let Some(previous) = self.snapshot_target.replace(path) {
                    debug!("Snapshot to {} replaced before a frame completed", previous.display());
                }
            }
            PendingCommand::Restart => {
                info!("🔄 Restarting acquisition");
                self.transport = None;
                self.assembler.reset();
                self.watchdog.reset();
                self.shared.set_state(WorkerState::Syncing);
                self.transport()?;
                self.shared.emit(WorkerEvent::Restarted);
            }
        }
        Ok(())
    }
}

/// Owns the acquisition worker's lifecycle; the consumer's single entry point
pub struct CaptureHandle {
    settings: CaptureSettings,
    shared: Shared,
    events_rx: Receiver<WorkerEvent>,
    opener: Option<Box<dyn TransportOpener>>,
    worker: Option<JoinHandle<WorkerExit>>,
    last_stats: Option<WorkerStats>,
}

impl CaptureHandle {
    /// Create an idle handle; nothing is opened until [`CaptureHandle::start`]
    pub fn new(
        opener: impl TransportOpener + 'static,
        settings: CaptureSettings,
        palette: Palette,
    ) -> Result<Self, CaptureError> {
        settings.layout.validate()?;
        let (events, events_rx) = unbounded();

        Ok(Self {
            settings,
            shared: Shared {
                publisher: Publisher::new(),
                palette: Arc::new(Mutex::new(Arc::new(palette))),
                state: Arc::new(Mutex::new(WorkerState::Idle)),
                running: Arc::new(AtomicBool::new(false)),
                events,
            },
            events_rx,
            opener: Some(Box::new(opener)),
            worker: None,
            last_stats: None,
        })
    }

    /// Open the transport and spawn the worker. No-op while a worker is capturing;
    /// a worker on its way out is joined first.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.accepts_commands() {
            return Ok(());
        }
        self.reap()?;

        let framer = PacketFramer::new(self.settings.layout.clone())?;
        let mut opener = self.opener.take().ok_or(CaptureError::OpenerUnavailable)?;
        let transport = match opener.open() {
            Ok(transport) => transport,
            Err(e) => {
                self.opener = Some(opener);
                return Err(e.into());
            }
        };

        let worker = Worker {
            framer,
            assembler: FrameAssembler::new(&self.settings.layout),
            watchdog: DesyncWatchdog::new(self.settings.desync_frame_limit, self.settings.frame_period),
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            opener,
            transport: Some(transport),
            snapshot_target: None,
            stats: WorkerStats::default(),
        };

        // A restart left behind by an exited worker is satisfied by this start
        if self.shared.publisher.withdraw(&PendingCommand::Restart) {
            debug!("Dropped restart request left by the previous worker");
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(WorkerState::Syncing);

        let handle = thread::Builder::new()
            .name("lepton-capture".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.set_state(WorkerState::Idle);
                CaptureError::Spawn(e)
            })?;

        self.worker = Some(handle);
        Ok(())
    }

    /// Signal the worker to exit after its current read, then wait for it
    pub fn stop(&mut self) -> Result<Option<WorkerStats>, CaptureError> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.reap()?;
        self.shared.set_state(WorkerState::Idle);
        Ok(self.last_stats)
    }

    /// Re-open the transport. Restarts a worker that stopped on a fatal error.
    ///
    /// A running worker gets a restart request; the pending command it replaced
    /// is returned.
    pub fn restart(&mut self) -> Result<Option<PendingCommand>, CaptureError> {
        if !self.accepts_commands() {
            self.start()?;
            return Ok(None);
        }

        let replaced = self.shared.publisher.request_restart();
        if !self.accepts_commands() {
            // The worker left between the check and the request
            self.start()?;
        }
        Ok(replaced)
    }

    /// Worker is alive and will still consume requests
    fn accepts_commands(&self) -> bool {
        self.is_running()
            && self.shared.running.load(Ordering::SeqCst)
            && self.shared.state() != WorkerState::Stopping
    }

    /// Join a finished worker and take back its opener
    fn reap(&mut self) -> Result<(), CaptureError> {
        if let Some(worker) = self.worker.take() {
            let exit = worker.join().map_err(|_| CaptureError::WorkerPanicked)?;
            self.opener = Some(exit.opener);
            self.last_stats = Some(exit.stats);
        }
        Ok(())
    }

    /// Whether the worker thread is alive
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn request_ffc(&self) -> Option<PendingCommand> {
        self.shared.publisher.request_ffc()
    }

    pub fn request_snapshot(&self, path: impl Into<PathBuf>) -> Option<PendingCommand> {
        self.shared.publisher.request_snapshot(path)
    }

    pub fn request_restart(&self) -> Option<PendingCommand> {
        self.shared.publisher.request_restart()
    }

    pub fn take_latest(&self) -> Option<Arc<DisplayFrame>> {
        self.shared.publisher.take_latest()
    }

    pub fn subscribe(&self) -> Receiver<Arc<DisplayFrame>> {
        self.shared.publisher.subscribe()
    }

    pub fn events(&self) -> Receiver<WorkerEvent> {
        self.events_rx.clone()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.shared.publisher
    }

    /// Palette used for frames converted from now on
    pub fn set_palette(&self, palette: Palette) {
        info!("🎨 Palette set to {}", palette.name());
        *lock(&self.shared.palette) = Arc::new(palette);
    }

    /// Flag the worker polls between packets, for external shutdown (Ctrl+C)
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.running)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to stop acquisition worker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticSensor;
    use lepton_shared::{Packet, PaletteKind};
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn opener<F>(f: F) -> F
    where
        F: FnMut() -> Result<Box<dyn PacketTransport>, TransportError> + Send + 'static,
    {
        f
    }

    /// Watchdog off; the desync tests turn it on with a short frame period
    fn settings() -> CaptureSettings {
        CaptureSettings {
            desync_frame_limit: 0,
            resync_delay: Duration::ZERO,
            ..CaptureSettings::default()
        }
    }

    fn desync_settings(reopen_on_desync: bool) -> CaptureSettings {
        CaptureSettings {
            desync_frame_limit: 2,
            frame_period: Duration::from_millis(5),
            reopen_on_desync,
            ..settings()
        }
    }

    /// Hands out pre-built transports, one per open
    fn scripted(transports: Vec<Box<dyn PacketTransport>>, opens: Arc<AtomicUsize>) -> impl TransportOpener {
        let mut transports = transports.into_iter();
        opener(move || {
            opens.fetch_add(1, Ordering::SeqCst);
            transports.next().ok_or_else(|| {
                TransportError::Io(io::Error::new(io::ErrorKind::NotFound, "no device"))
            })
        })
    }

    fn sensor() -> SyntheticSensor {
        SyntheticSensor::new(PacketLayout::default())
    }

    fn wait_event<P>(rx: &Receiver<WorkerEvent>, pred: P) -> WorkerEvent
    where
        P: Fn(&WorkerEvent) -> bool,
    {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("no matching event: {}", e),
            }
        }
    }

    fn wait_until<P: Fn() -> bool>(pred: P) {
        let deadline = Instant::now() + TIMEOUT;
        while !pred() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Counts reads of the wrapped transport
    struct Counting<T> {
        inner: T,
        reads: Arc<AtomicUsize>,
    }

    impl<T: PacketTransport> PacketTransport for Counting<T> {
        fn read_packet(&mut self) -> Result<Packet, TransportError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_packet()
        }

        fn send_command(&mut self, command: DeviceCommand) -> Result<(), TransportError> {
            self.inner.send_command(command)
        }
    }

    /// Blocks every read until the gate is opened; a closed gate fails the read
    struct Gated {
        inner: SyntheticSensor,
        gate: Receiver<()>,
    }

    impl PacketTransport for Gated {
        fn read_packet(&mut self) -> Result<Packet, TransportError> {
            self.gate
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?;
            self.inner.read_packet()
        }

        fn send_command(&mut self, command: DeviceCommand) -> Result<(), TransportError> {
            self.inner.send_command(command)
        }
    }

    /// Panics on the first read
    struct Panicking;

    impl PacketTransport for Panicking {
        fn read_packet(&mut self) -> Result<Packet, TransportError> {
            panic!("transport panic");
        }

        fn send_command(&mut self, _command: DeviceCommand) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Transport without a command channel
    struct NoCommands(SyntheticSensor);

    impl PacketTransport for NoCommands {
        fn read_packet(&mut self) -> Result<Packet, TransportError> {
            self.0.read_packet()
        }

        fn send_command(&mut self, command: DeviceCommand) -> Result<(), TransportError> {
            Err(TransportError::Unsupported(format!("{:?}", command)))
        }
    }

    #[test]
    fn test_publishes_frames() {
        let opens = Arc::new(AtomicUsize::new(0));
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(sensor())], Arc::clone(&opens)),
            settings(),
            Palette::default(),
        )
        .unwrap();
        assert_eq!(handle.state(), WorkerState::Idle);

        let frames = handle.subscribe();
        handle.start().unwrap();

        let frame = frames.recv_timeout(TIMEOUT).unwrap();
        assert_eq!((frame.width, frame.height), (80, 60));
        assert_eq!(frame.pixels.len(), 80 * 60);
        assert!(frame.min < frame.max);
        wait_until(|| handle.state() == WorkerState::Capturing);

        let latest = handle.take_latest().unwrap();
        let again = handle.take_latest().unwrap();
        assert!(latest.frame_number >= frame.frame_number);
        assert!(again.frame_number >= latest.frame_number);

        let stats = handle.stop().unwrap().unwrap();
        assert!(stats.frames_published >= 1);
        assert_eq!(stats.assembler.desyncs, 0);
        assert_eq!(handle.state(), WorkerState::Idle);
        assert!(!handle.is_running());
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transport_failure_is_fatal_once() {
        let reads = Arc::new(AtomicUsize::new(0));
        let transport = Counting {
            inner: sensor().with_fail_after(100),
            reads: Arc::clone(&reads),
        };
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(transport)], Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();

        let event = wait_event(&events, |e| matches!(e, WorkerEvent::Fatal(_)));
        assert!(matches!(event, WorkerEvent::Fatal(msg) if msg.contains("synthetic bus failure")));

        wait_until(|| !handle.is_running());
        assert_eq!(handle.state(), WorkerState::Stopping);
        assert_eq!(reads.load(Ordering::SeqCst), 101);
        assert!(events
            .try_iter()
            .all(|e| !matches!(e, WorkerEvent::Fatal(_))));

        // A frame completed before the failure stays available
        assert!(handle.take_latest().is_some());
    }

    #[test]
    fn test_restart_after_fatal() {
        let opens = Arc::new(AtomicUsize::new(0));
        let mut handle = CaptureHandle::new(
            scripted(
                vec![Box::new(sensor().with_fail_after(10)), Box::new(sensor())],
                Arc::clone(&opens),
            ),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();
        wait_event(&events, |e| matches!(e, WorkerEvent::Fatal(_)));
        wait_until(|| !handle.is_running());
        assert!(handle.take_latest().is_none());

        assert_eq!(handle.restart().unwrap(), None);
        let frames = handle.subscribe();
        frames.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        handle.stop().unwrap();
    }

    #[test]
    fn test_start_fails_without_device() {
        let mut handle = CaptureHandle::new(
            scripted(Vec::new(), Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();

        assert!(matches!(handle.start(), Err(CaptureError::Transport(_))));
        assert_eq!(handle.state(), WorkerState::Idle);
        assert!(!handle.is_running());
    }

    #[test]
    fn test_restart_request_reopens_transport() {
        let opens = Arc::new(AtomicUsize::new(0));
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(sensor()), Box::new(sensor())], Arc::clone(&opens)),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();

        assert_eq!(handle.restart().unwrap(), None);
        wait_event(&events, |e| *e == WorkerEvent::Restarted);
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        // Frames keep flowing from the new transport
        let published = handle.publisher().frames_published();
        wait_until(|| handle.publisher().frames_published() > published);
        handle.stop().unwrap();
    }

    #[test]
    fn test_restart_returns_superseded_command() {
        let (gate, gate_rx) = crossbeam_channel::unbounded();
        let opens = Arc::new(AtomicUsize::new(0));
        let gated = Gated {
            inner: sensor(),
            gate: gate_rx,
        };
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(gated), Box::new(sensor())], Arc::clone(&opens)),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();

        // Worker is parked in its first read, so nothing is consumed yet
        assert_eq!(handle.request_ffc(), None);
        assert_eq!(handle.restart().unwrap(), Some(PendingCommand::Ffc));

        // The worker dies with the restart still queued
        drop(gate);
        wait_event(&events, |e| matches!(e, WorkerEvent::Fatal(_)));
        wait_until(|| !handle.is_running());
        assert!(handle.publisher().has_pending_command());

        // Starting fresh satisfies the stale restart instead of re-opening again
        assert_eq!(handle.restart().unwrap(), None);
        assert!(!handle.publisher().has_pending_command());
        let frames = handle.subscribe();
        frames.recv_timeout(TIMEOUT).unwrap();
        let published = handle.publisher().frames_published();
        wait_until(|| handle.publisher().frames_published() > published + 1);

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(handle.is_running());
        assert!(events.try_iter().all(|e| e != WorkerEvent::Restarted));
        handle.stop().unwrap();
    }

    #[test]
    fn test_start_after_panic_reports_lost_opener() {
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(Panicking)], Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();
        handle.start().unwrap();
        wait_until(|| handle.worker.as_ref().map_or(true, |w| w.is_finished()));

        assert!(matches!(handle.stop(), Err(CaptureError::WorkerPanicked)));
        assert!(matches!(handle.start(), Err(CaptureError::OpenerUnavailable)));
    }

    #[test]
    fn test_ffc_reaches_device() {
        let sensor = sensor();
        let log = sensor.command_log();
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(sensor)], Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();
        handle.start().unwrap();

        assert_eq!(handle.request_ffc(), None);
        wait_until(|| lock(&log).contains(&DeviceCommand::RunFfc));

        let published = handle.publisher().frames_published();
        wait_until(|| handle.publisher().frames_published() > published);
        assert_eq!(handle.state(), WorkerState::Capturing);
        handle.stop().unwrap();
    }

    #[test]
    fn test_ffc_failure_is_not_fatal() {
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(NoCommands(sensor()))], Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();
        handle.request_ffc();

        let event = wait_event(&events, |e| matches!(e, WorkerEvent::CommandFailed { .. }));
        assert!(matches!(
            event,
            WorkerEvent::CommandFailed { command: DeviceCommand::RunFfc, .. }
        ));

        let published = handle.publisher().frames_published();
        wait_until(|| handle.publisher().frames_published() > published);
        assert!(handle.is_running());
        handle.stop().unwrap();
    }

    #[test]
    fn test_snapshot_of_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("snap.png");
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(sensor())], Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();
        handle.request_snapshot(&target);

        match wait_event(&events, |e| matches!(e, WorkerEvent::SnapshotSaved(_))) {
            WorkerEvent::SnapshotSaved(files) => {
                assert_eq!(files.image, target);
                assert!(target.exists());
                assert!(files.temperatures.unwrap().exists());
            }
            other => panic!("unexpected event {:?}", other),
        }
        handle.stop().unwrap();
    }

    #[test]
    fn test_snapshot_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(sensor())], Arc::new(AtomicUsize::new(0))),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();
        handle.request_snapshot(blocker.join("snap.png"));

        wait_event(&events, |e| matches!(e, WorkerEvent::SnapshotFailed { .. }));
        let published = handle.publisher().frames_published();
        wait_until(|| handle.publisher().frames_published() > published);
        assert!(handle.is_running());
        handle.stop().unwrap();
    }

    #[test]
    fn test_persistent_desync_warns_and_keeps_running() {
        let settings = desync_settings(false);
        let mut handle = CaptureHandle::new(
            scripted(
                vec![Box::new(sensor().with_stall_after(1))],
                Arc::new(AtomicUsize::new(0)),
            ),
            settings,
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        handle.start().unwrap();

        match wait_event(&events, |e| matches!(e, WorkerEvent::DesyncWarning { .. })) {
            WorkerEvent::DesyncWarning { frame_periods } => assert!(frame_periods >= 2),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(handle.is_running());
        assert_eq!(handle.state(), WorkerState::Syncing);

        let stats = handle.stop().unwrap().unwrap();
        assert_eq!(stats.desync_warnings, 1);
    }

    #[test]
    fn test_persistent_desync_reopens_bus() {
        let settings = desync_settings(true);
        let opens = Arc::new(AtomicUsize::new(0));
        let mut handle = CaptureHandle::new(
            scripted(
                vec![Box::new(sensor().with_stall_after(0)), Box::new(sensor())],
                Arc::clone(&opens),
            ),
            settings,
            Palette::default(),
        )
        .unwrap();
        let events = handle.events();
        let frames = handle.subscribe();
        handle.start().unwrap();

        wait_event(&events, |e| matches!(e, WorkerEvent::DesyncWarning { .. }));
        frames.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        handle.stop().unwrap();
    }

    #[test]
    fn test_dropped_row_loses_only_that_frame() {
        let mut handle = CaptureHandle::new(
            scripted(
                vec![Box::new(sensor().with_dropped_row(0, 2))],
                Arc::new(AtomicUsize::new(0)),
            ),
            settings(),
            Palette::default(),
        )
        .unwrap();
        let frames = handle.subscribe();
        handle.start().unwrap();

        frames.recv_timeout(TIMEOUT).unwrap();
        let stats = handle.stop().unwrap().unwrap();
        assert_eq!(stats.assembler.desyncs, 1);
        assert!(stats.frames_published >= 1);
    }

    #[test]
    fn test_palette_change_applies_to_new_frames() {
        let mut handle = CaptureHandle::new(
            scripted(vec![Box::new(sensor())], Arc::new(AtomicUsize::new(0))),
            settings(),
            PaletteKind::Rainbow.palette(),
        )
        .unwrap();
        handle.set_palette(PaletteKind::Grayscale.palette());
        let frames = handle.subscribe();
        handle.start().unwrap();

        let frame = frames.recv_timeout(TIMEOUT).unwrap();
        assert!(frame.pixels.iter().all(|p| p[0] == p[1] && p[1] == p[2]));
        handle.stop().unwrap();
    }
}
