//! Timer-backed notification queue.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::ScheduledNotification;
use crate::host::ForegroundExecutor;
use crate::Result;

/// Maps wall-clock instants onto the monotonic clock timers run on.
#[derive(Debug, Clone, Copy)]
struct ClockAnchor {
    wall_millis: i64,
    monotonic: Instant,
}

impl ClockAnchor {
    fn now() -> Self {
        Self {
            wall_millis: Utc::now().timestamp_millis(),
            monotonic: Instant::now(),
        }
    }

    fn deadline(&self, instant: i64) -> Instant {
        let delta = instant.saturating_sub(self.wall_millis);
        if delta <= 0 {
            self.monotonic
        } else {
            self.monotonic + Duration::from_millis(delta.unsigned_abs())
        }
    }
}

struct Pending {
    seq: u64,
    notification: ScheduledNotification,
    timer: Option<AbortHandle>,
}

impl Pending {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct State {
    /// Sorted by instant, then by scheduling order.
    pending: Vec<Pending>,
    next_seq: u64,
    anchor: Option<ClockAnchor>,
}

/// Pending notifications of one game instance.
///
/// Timers run on the host runtime and post to the foreground queue; fired
/// notifications are collected with [`take_due`](Self::take_due).
pub struct NotificationScheduler {
    executor: ForegroundExecutor,
    state: Mutex<State>,
    fired_tx: Sender<u64>,
    fired_rx: Receiver<u64>,
}

impl std::fmt::Debug for NotificationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NotificationScheduler")
            .field("pending", &state.pending.len())
            .field("armed", &state.anchor.is_some())
            .finish()
    }
}

impl NotificationScheduler {
    /// An empty, disarmed scheduler.
    pub fn new(executor: ForegroundExecutor) -> Self {
        let (fired_tx, fired_rx) = mpsc::channel();
        Self {
            executor,
            state: Mutex::new(State::default()),
            fired_tx,
            fired_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, anchor: &ClockAnchor, entry: &mut Pending) {
        entry.disarm();
        let fired = self.fired_tx.clone();
        let seq = entry.seq;
        let deadline = anchor.deadline(entry.notification.instant);

        entry.timer = Some(self.executor.spawn_timer(deadline, move || {
            // the scheduler may be gone by the time the timer fires
            let _ = fired.send(seq);
        }));
    }

    /// Re-anchor wall-clock instants to the monotonic clock and re-arm every
    /// pending timer. Call whenever the host returns to the foreground.
    pub fn recalibrate(&self) {
        let anchor = ClockAnchor::now();
        let mut state = self.lock();
        state.anchor = Some(anchor);

        let mut pending = std::mem::take(&mut state.pending);
        for entry in &mut pending {
            self.arm(&anchor, entry);
        }
        state.pending = pending;
        debug!(count = state.pending.len(), "notification timers armed");
    }

    /// Disarm every timer. Pending notifications are kept.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.anchor = None;
        for entry in &mut state.pending {
            entry.disarm();
        }
    }

    /// Whether timers are currently armed.
    pub fn is_running(&self) -> bool {
        self.lock().anchor.is_some()
    }

    /// Add a notification, replacing any pending one with the same id.
    ///
    /// Returns the replaced notification.
    pub fn schedule(&self, notification: ScheduledNotification) -> Option<ScheduledNotification> {
        let mut state = self.lock();

        let replaced = match &notification.id {
            Some(id) => Self::remove_by_id(&mut state, id),
            None => None,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let mut entry = Pending {
            seq,
            notification,
            timer: None,
        };
        if let Some(anchor) = state.anchor {
            self.arm(&anchor, &mut entry);
        }

        let key = (entry.notification.instant, seq);
        let index = state
            .pending
            .partition_point(|p| (p.notification.instant, p.seq) <= key);
        debug!(
            id = ?entry.notification.id,
            instant = entry.notification.instant,
            replaced = replaced.is_some(),
            "notification scheduled"
        );
        state.pending.insert(index, entry);

        replaced
    }

    fn remove_by_id(state: &mut State, id: &str) -> Option<ScheduledNotification> {
        let index = state
            .pending
            .iter()
            .position(|p| p.notification.id.as_deref() == Some(id))?;
        let mut entry = state.pending.remove(index);
        entry.disarm();
        Some(entry.notification)
    }

    /// The pending notification with `id`.
    pub fn get(&self, id: &str) -> Option<ScheduledNotification> {
        self.lock()
            .pending
            .iter()
            .find(|p| p.notification.id.as_deref() == Some(id))
            .map(|p| p.notification.clone())
    }

    /// Remove the pending notification with `id` and disarm its timer.
    pub fn cancel(&self, id: &str) -> Option<ScheduledNotification> {
        let cancelled = Self::remove_by_id(&mut self.lock(), id);
        if cancelled.is_some() {
            debug!(id, "notification cancelled");
        }
        cancelled
    }

    /// Snapshot of pending notifications in delivery order.
    pub fn pending(&self) -> Vec<ScheduledNotification> {
        self.lock()
            .pending
            .iter()
            .map(|p| p.notification.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Remove and return notifications whose timers have fired, in delivery
    /// order.
    ///
    /// Everything ordered before a fired notification is due as well and is
    /// returned with it. A fired timer whose notification was cancelled in
    /// the meantime is ignored. While stopped, fired timers are discarded and
    /// their notifications stay pending until the next start.
    pub fn take_due(&self) -> Vec<ScheduledNotification> {
        let fired: Vec<u64> = self.fired_rx.try_iter().collect();
        if fired.is_empty() {
            return Vec::new();
        }

        let mut state = self.lock();
        if state.anchor.is_none() {
            return Vec::new();
        }

        let last = fired
            .iter()
            .filter_map(|&seq| {
                let index = state.pending.iter().position(|p| p.seq == seq);
                if index.is_none() {
                    debug!(seq, "fired notification is no longer pending");
                }
                index
            })
            .max();
        let Some(last) = last else {
            return Vec::new();
        };

        state
            .pending
            .drain(..=last)
            .map(|mut entry| {
                entry.disarm();
                entry.notification
            })
            .collect()
    }

    /// Replace the pending set with the notifications stored in `reader`
    /// (a JSON array) and arm their timers.
    pub fn load(&self, reader: impl Read) -> Result<()> {
        let stored: Vec<ScheduledNotification> = serde_json::from_reader(reader)?;
        self.reset(stored);
        Ok(())
    }

    /// Start with no stored notifications.
    pub fn start_empty(&self) {
        self.reset(Vec::new());
    }

    fn reset(&self, stored: Vec<ScheduledNotification>) {
        {
            let mut state = self.lock();
            for entry in &mut state.pending {
                entry.disarm();
            }
            state.pending.clear();
        }
        // drop fires of the previous generation
        let _ = self.fired_rx.try_iter().count();

        self.recalibrate();
        let count = stored.len();
        for notification in stored {
            self.schedule(notification);
        }
        info!(count, "notifications loaded");
    }

    /// Write pending notifications to `writer` as a JSON array.
    pub fn commit(&self, writer: impl Write) -> Result<()> {
        serde_json::to_writer(writer, &self.pending())?;
        Ok(())
    }
}

impl Drop for NotificationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
