/*!
Single-slot frame publication and control-request intake.

The worker publishes every converted frame into one slot; the consumer only
ever sees the most recent one. Control requests share the same single-slot
discipline: a new request replaces an unconsumed one, and the replaced
request is handed back to the caller.
*/

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use lepton_shared::DisplayFrame;
use tracing::debug;

/// Control request queued for the worker loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCommand {
    /// Run a flat-field correction
    Ffc,
    /// Write the next completed frame to this path
    Snapshot(PathBuf),
    /// Re-open the transport and resynchronize
    Restart,
}

struct PublisherInner {
    latest: Mutex<Option<Arc<DisplayFrame>>>,
    pending: Mutex<Option<PendingCommand>>,
    notify_tx: Sender<Arc<DisplayFrame>>,
    notify_rx: Receiver<Arc<DisplayFrame>>,
    published: AtomicU64,
}

/// Shared between the worker and the consumer
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Publisher {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = bounded(1);
        Self {
            inner: Arc::new(PublisherInner {
                latest: Mutex::new(None),
                pending: Mutex::new(None),
                notify_tx,
                notify_rx,
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the latest frame and notify subscribers
    pub fn publish(&self, frame: Arc<DisplayFrame>) {
        *lock(&self.inner.latest) = Some(Arc::clone(&frame));
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        // Latest wins: evict an unread notification rather than block
        if let Err(TrySendError::Full(frame)) = self.inner.notify_tx.try_send(frame) {
            let _ = self.inner.notify_rx.try_recv();
            let _ = self.inner.notify_tx.try_send(frame);
        }
    }

    /// Most recently published frame; repeatable
    pub fn take_latest(&self) -> Option<Arc<DisplayFrame>> {
        lock(&self.inner.latest).clone()
    }

    /// Notification channel holding at most the newest unread frame.
    ///
    /// All subscribers share one channel, so each frame is delivered to one of them.
    pub fn subscribe(&self) -> Receiver<Arc<DisplayFrame>> {
        self.inner.notify_rx.clone()
    }

    pub fn frames_published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn request_ffc(&self) -> Option<PendingCommand> {
        self.request(PendingCommand::Ffc)
    }

    pub fn request_restart(&self) -> Option<PendingCommand> {
        self.request(PendingCommand::Restart)
    }

    pub fn request_snapshot(&self, path: impl Into<PathBuf>) -> Option<PendingCommand> {
        self.request(PendingCommand::Snapshot(path.into()))
    }

    /// Set the pending command, returning the one it replaced
    pub fn request(&self, command: PendingCommand) -> Option<PendingCommand> {
        let replaced = lock(&self.inner.pending).replace(command);
        if let Some(old) = &replaced {
            debug!("Pending command {:?} superseded before the worker consumed it", old);
        }
        replaced
    }

    /// Consume the pending command (worker side)
    pub fn take_command(&self) -> Option<PendingCommand> {
        lock(&self.inner.pending).take()
    }

    /// Remove the pending command only if it equals `command`
    pub fn withdraw(&self, command: &PendingCommand) -> bool {
        let mut pending = lock(&self.inner.pending);
        if pending.as_ref() == Some(command) {
            *pending = None;
            return true;
        }
        false
    }

    pub fn has_pending_command(&self) -> bool {
        lock(&self.inner.pending).is_some()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}
