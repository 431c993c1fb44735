/// Signal handling for graceful worker shutdown.
///
/// First SIGTERM or SIGINT: finish the current tick, then exit at the next
/// loop boundary.
/// Second signal within 3s: abort the in-flight task immediately.
use crate::heartbeat::{StatusTracker, WorkerState};
use crate::lock::LockHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// Window in which a repeated signal escalates to an immediate abort.
const ESCALATION_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    urgent: AtomicBool,
    first: Mutex<Option<(&'static str, Instant)>>,
    notify: Notify,
}

/// Shared shutdown flag. Cheap to clone; every clone sees the same state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a shutdown request. A second request within the escalation
    /// window makes the shutdown urgent.
    pub fn request(&self, name: &'static str) {
        let now = Instant::now();
        let mut first = self
            .inner
            .first
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *first {
            None => {
                *first = Some((name, now));
                self.inner.requested.store(true, Ordering::SeqCst);
                tracing::info!(signal = name, "shutdown requested, finishing current tick");
            }
            Some((_, at)) if now.duration_since(at) <= ESCALATION_WINDOW => {
                self.inner.urgent.store(true, Ordering::SeqCst);
                tracing::warn!(signal = name, "second signal received, aborting current task");
            }
            Some(_) => {
                // Outside the window: refresh so a quick follow-up escalates.
                *first = Some((name, now));
                tracing::info!(signal = name, "shutdown already in progress");
            }
        }
        drop(first);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn is_urgent(&self) -> bool {
        self.inner.urgent.load(Ordering::SeqCst)
    }

    /// Name of the signal that started the shutdown.
    pub fn signal_name(&self) -> Option<&'static str> {
        let first = *self
            .inner
            .first
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        first.map(|(name, _)| name)
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once shutdown has become urgent.
    pub async fn urgent(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_urgent() {
                return;
            }
            notified.await;
        }
    }

    /// Listen for SIGTERM and SIGINT on a background task.
    pub fn install(&self) -> std::io::Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let shutdown = self.clone();
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = term.recv() => "SIGTERM",
                    Some(()) = int.recv() => "SIGINT",
                    else => break,
                };
                shutdown.request(name);
            }
        });
        Ok(())
    }
}

/// Shutdown sequence: final status record, then lock release. The record
/// goes first so a watchdog never sees a free lock next to a "running"
/// status.
pub fn finish(tracker: &mut StatusTracker, lock: &mut LockHandle, reason: &str) {
    tracker.update(WorkerState::Stopped, reason);
    if let Err(e) = lock.release() {
        tracing::warn!(error = %e, "failed to release worker lock");
    }
    tracing::info!(reason, "worker stopped");
}
