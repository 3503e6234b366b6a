/// Per-source activity throttle.
///
/// Each [`SourceId`] gets its own cooldown: at most one notification per
/// [`COOLDOWN`]. A signal that lands in the last [`DEFER_WINDOW`] of a
/// cooldown is not dropped; it arms a single catch-up timer that fires at the
/// earliest legal instant plus [`DEFER_MARGIN`]. Signals earlier in the
/// cooldown are dropped.
///
/// The throttle owns no clock and no timers. Callers pass `now` explicitly and
/// timers are delegated to a [`Scheduler`], which reports back through
/// [`ActivityThrottle::deferred_elapsed`]. All methods take `&mut self`; the
/// daemon drives one instance from its event loop only.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::event::DaemonEvent;
use crate::sink::NotificationSink;
use crate::source::SourceId;

pub const COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFER_WINDOW: Duration = Duration::from_secs(3);
pub const DEFER_MARGIN: Duration = Duration::from_millis(50);

/// Outcome of feeding one signal to the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Cooldown had expired; the sink was asked to fire.
    Fired,
    /// Near the end of the cooldown; a catch-up fire is armed after the delay.
    Deferred(Duration),
    /// Inside the cooldown with a catch-up already armed.
    AlreadyDeferred,
    /// Too early in the cooldown to be worth deferring.
    Dropped,
    /// Notifications are globally disabled.
    Disabled,
}

/// Identifies one armed catch-up timer. Tokens are never reused, so a timer
/// that fires after being cancelled is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferredFire {
    pub source: SourceId,
    pub token: u64,
}

/// One-shot timer primitive used for deferred fires.
pub trait Scheduler {
    /// Arrange for `fire` to be delivered back after `delay`.
    fn schedule_once(&mut self, delay: Duration, fire: DeferredFire);
    /// Cancel a pending timer and release its handle. Cancelling a timer that
    /// already fired is a no-op.
    fn cancel(&mut self, fire: DeferredFire);
}

#[derive(Debug, Default)]
struct ThrottleState {
    /// `None` until the first fire; behaves like a fire long in the past.
    last_fired: Option<Instant>,
    deferred: Option<u64>,
}

impl ThrottleState {
    fn remaining(&self, now: Instant) -> Duration {
        match self.last_fired {
            Some(last) => COOLDOWN.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    fn mark_fired(&mut self, now: Instant) {
        self.last_fired = Some(match self.last_fired {
            Some(last) => last.max(now),
            None => now,
        });
    }
}

pub struct ActivityThrottle<S: Scheduler> {
    states: HashMap<SourceId, ThrottleState>,
    scheduler: S,
    sink: Arc<dyn NotificationSink>,
    enabled: bool,
    next_token: u64,
}

impl<S: Scheduler> ActivityThrottle<S> {
    pub fn new(scheduler: S, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            states: HashMap::new(),
            scheduler,
            sink,
            enabled: true,
            next_token: 1,
        }
    }

    /// Applies one activity signal for `source` observed at `now`.
    pub fn signal(&mut self, source: SourceId, now: Instant) -> Decision {
        if !self.enabled {
            return Decision::Disabled;
        }

        let state = self.states.entry(source).or_default();
        let remaining = state.remaining(now);

        let decision = if remaining.is_zero() {
            // An immediate fire supersedes any pending catch-up.
            if let Some(token) = state.deferred.take() {
                self.scheduler.cancel(DeferredFire { source, token });
            }
            state.mark_fired(now);
            self.sink.fire();
            Decision::Fired
        } else if state.deferred.is_some() {
            Decision::AlreadyDeferred
        } else if remaining <= DEFER_WINDOW {
            let token = self.next_token;
            self.next_token += 1;
            let delay = remaining + DEFER_MARGIN;
            state.deferred = Some(token);
            self.scheduler
                .schedule_once(delay, DeferredFire { source, token });
            Decision::Deferred(delay)
        } else {
            Decision::Dropped
        };

        match decision {
            Decision::Fired => tracing::info!(source = %source, "activity: notifying"),
            Decision::Deferred(delay) => tracing::debug!(
                source = %source,
                delay_ms = delay.as_millis() as u64,
                "activity near end of cooldown: deferred"
            ),
            other => tracing::trace!(source = %source, decision = ?other, "activity throttled"),
        }
        decision
    }

    /// Handles an elapsed catch-up timer. Returns `true` if it fired.
    pub fn deferred_elapsed(&mut self, fire: DeferredFire, now: Instant) -> bool {
        let Some(state) = self.states.get_mut(&fire.source) else {
            return false;
        };
        if state.deferred != Some(fire.token) {
            tracing::trace!(source = %fire.source, token = fire.token, "stale deferred timer ignored");
            return false;
        }
        state.deferred = None;
        self.scheduler.cancel(fire);

        // A later immediate fire may already have restarted the cooldown.
        if !self.enabled || !state.remaining(now).is_zero() {
            return false;
        }
        state.mark_fired(now);
        self.sink.fire();
        tracing::info!(source = %fire.source, "deferred activity: notifying");
        true
    }

    /// Globally enables or disables notifications. Disabling cancels every
    /// armed catch-up timer but keeps cooldown bookkeeping.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.cancel_all();
        }
        tracing::info!(enabled, "notifications toggled");
    }

    /// Cancels every armed catch-up timer, for shutdown.
    pub fn cancel_all(&mut self) {
        for (source, state) in self.states.iter_mut() {
            if let Some(token) = state.deferred.take() {
                self.scheduler.cancel(DeferredFire {
                    source: *source,
                    token,
                });
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_fired(&self, source: SourceId) -> Option<Instant> {
        self.states.get(&source).and_then(|s| s.last_fired)
    }

    pub fn is_deferred(&self, source: SourceId) -> bool {
        self.states
            .get(&source)
            .is_some_and(|s| s.deferred.is_some())
    }
}

/// Production [`Scheduler`]: one tokio sleep task per timer, posting
/// [`DaemonEvent::DeferredElapsed`] back to the event loop.
///
/// Must be used from within a tokio runtime.
pub struct TokioScheduler {
    tx: mpsc::Sender<DaemonEvent>,
    timers: HashMap<DeferredFire, AbortHandle>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            tx,
            timers: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&mut self, delay: Duration, fire: DeferredFire) {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DaemonEvent::DeferredElapsed(fire)).await;
        });
        self.timers.insert(fire, task.abort_handle());
    }

    fn cancel(&mut self, fire: DeferredFire) {
        if let Some(handle) = self.timers.remove(&fire) {
            handle.abort();
        }
    }
}
