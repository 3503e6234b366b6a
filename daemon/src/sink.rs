/// Notification sink: turns a fire decision into a 10 second sequence of short
/// beeps at random pitches separated by random silences.
///
/// Only one sequence plays at a time. `fire` while a sequence is running is
/// a no-op and does not extend it; the guard lives here, not in the callers.
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::watch;

pub const SEQUENCE_LENGTH: Duration = Duration::from_secs(10);
pub const BEEP_LENGTH: Duration = Duration::from_millis(50);
pub const MIN_FREQUENCY_HZ: u32 = 400;
pub const MAX_FREQUENCY_HZ: u32 = 1600;
const MIN_GAP_SECS: f64 = 0.2;
const MAX_GAP_SECS: f64 = 1.0;

/// Where fire decisions go. Implementations must be callable from any thread.
pub trait NotificationSink: Send + Sync {
    /// Start a sequence, or do nothing if one is already playing.
    fn fire(&self);
    /// Abort the current sequence, if any.
    fn stop(&self);
    fn is_active(&self) -> bool;
}

/// Renders a single tone. Called on the runtime; must not block.
///
/// `frequency_hz` and `length` are advisory: an output that cannot shape
/// its tone (the terminal bell) plays its own fixed sound instead.
pub trait ToneOutput: Send + Sync {
    fn play(&self, frequency_hz: u32, length: Duration);
}

/// Rings the terminal bell. Pitch and length are up to the terminal.
pub struct TerminalBell;

impl ToneOutput for TerminalBell {
    fn play(&self, frequency_hz: u32, _length: Duration) {
        let mut stderr = std::io::stderr();
        if let Err(e) = stderr.write_all(b"\x07").and_then(|()| stderr.flush()) {
            tracing::debug!(error = %e, "terminal bell failed");
        }
        tracing::trace!(frequency_hz, "beep");
    }
}

/// Logs beeps without producing sound.
pub struct Silent;

impl ToneOutput for Silent {
    fn play(&self, frequency_hz: u32, _length: Duration) {
        tracing::trace!(frequency_hz, "beep (silent)");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Bell,
    Silent,
}

impl OutputKind {
    pub fn build(self) -> Arc<dyn ToneOutput> {
        match self {
            OutputKind::Bell => Arc::new(TerminalBell),
            OutputKind::Silent => Arc::new(Silent),
        }
    }
}

/// One planned beep, relative to the start of its sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beep {
    pub offset: Duration,
    pub frequency_hz: u32,
}

/// Plans a sequence: a beep at a random pitch, then a random silence, until
/// `total` is reached. No beep starts at or after `total`.
pub fn plan_sequence<R: Rng + ?Sized>(rng: &mut R, total: Duration) -> Vec<Beep> {
    let mut beeps = Vec::new();
    let mut offset = Duration::ZERO;
    while offset < total {
        beeps.push(Beep {
            offset,
            frequency_hz: rng.gen_range(MIN_FREQUENCY_HZ..MAX_FREQUENCY_HZ),
        });
        let gap = Duration::from_secs_f64(rng.gen_range(MIN_GAP_SECS..MAX_GAP_SECS));
        offset += BEEP_LENGTH + gap;
    }
    beeps
}

pub struct BeepSink {
    output: RwLock<Arc<dyn ToneOutput>>,
    /// Id of the playing sequence, `0` when idle.
    active: Arc<AtomicU64>,
    next_id: AtomicU64,
    /// Serializes fire/stop and holds the running sequence's stop signal.
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    /// Mirrors `active != 0` for observers outside the sink.
    playing: Arc<watch::Sender<bool>>,
    runtime: Handle,
}

impl BeepSink {
    pub fn new(output: Arc<dyn ToneOutput>, runtime: Handle) -> Self {
        Self {
            output: RwLock::new(output),
            active: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
            stop_tx: Mutex::new(None),
            playing: Arc::new(watch::channel(false).0),
            runtime,
        }
    }

    /// Playing flag as a watch channel: `true` from the moment a sequence
    /// starts until it ends or is stopped.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.playing.subscribe()
    }

    /// Swaps the tone output. Takes effect from the next sequence.
    pub fn set_output(&self, output: Arc<dyn ToneOutput>) {
        *self.output.write() = output;
    }
}

impl NotificationSink for BeepSink {
    fn fire(&self) {
        let mut stop_slot = self.stop_tx.lock();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self
            .active
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::trace!("beep sequence already playing");
            return;
        }

        let beeps = plan_sequence(&mut rand::thread_rng(), SEQUENCE_LENGTH);
        let (tx, rx) = watch::channel(false);
        *stop_slot = Some(tx);
        publish_playing(&self.playing, &self.active);

        tracing::debug!(sequence = id, beeps = beeps.len(), "beep sequence started");
        self.runtime.spawn(play(
            id,
            beeps,
            self.output.read().clone(),
            Arc::clone(&self.active),
            Arc::clone(&self.playing),
            rx,
        ));
    }

    fn stop(&self) {
        let mut stop_slot = self.stop_tx.lock();
        self.active.store(0, Ordering::SeqCst);
        if let Some(tx) = stop_slot.take() {
            let _ = tx.send(true);
        }
        publish_playing(&self.playing, &self.active);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }
}

/// Re-reads `active` under the watch lock, so the last writer always
/// publishes the current state even when a sequence ends while another
/// starts.
fn publish_playing(playing: &watch::Sender<bool>, active: &AtomicU64) {
    playing.send_if_modified(|p| {
        let now = active.load(Ordering::SeqCst) != 0;
        std::mem::replace(p, now) != now
    });
}

async fn play(
    id: u64,
    beeps: Vec<Beep>,
    output: Arc<dyn ToneOutput>,
    active: Arc<AtomicU64>,
    playing: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now();
    let mut stopped = false;

    for beep in beeps {
        tokio::select! {
            _ = tokio::time::sleep_until(start + beep.offset) => {}
            _ = stop_rx.changed() => { stopped = true; break; }
        }
        if active.load(Ordering::SeqCst) != id {
            stopped = true;
            break;
        }
        output.play(beep.frequency_hz, BEEP_LENGTH);
    }

    // Stay active for the whole sequence length, not just until the last beep.
    if !stopped {
        tokio::select! {
            _ = tokio::time::sleep_until(start + SEQUENCE_LENGTH) => {}
            _ = stop_rx.changed() => {}
        }
    }

    if active
        .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        publish_playing(&playing, &active);
    }
    tracing::debug!(sequence = id, stopped, "beep sequence finished");
}
