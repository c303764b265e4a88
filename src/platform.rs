//! Clock and device-control seams.

use std::time::Instant;

/// Monotonic time source. The engine polls deadlines against it and never
/// sleeps.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Device identity and control.
pub trait Platform {
    /// Stable hardware identifier, used to derive the topic set when the
    /// configuration does not override it.
    fn device_id(&self) -> String;

    /// Restart into the freshly written image. Does not return on real
    /// hardware; doubles record the call instead.
    fn reboot(&mut self);
}
