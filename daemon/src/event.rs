use crate::config::Config;
use crate::source::ChangeSignal;
use crate::throttle::DeferredFire;

pub enum DaemonEvent {
    /// A change source observed activity.
    Activity(ChangeSignal),
    /// A deferred catch-up timer armed by the throttle has elapsed.
    DeferredElapsed(DeferredFire),
    /// The notification sink started or finished a beep sequence.
    PlaybackChanged(bool),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C or SIGTERM received; stop sources and exit.
    Shutdown,
}
