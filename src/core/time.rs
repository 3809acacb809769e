use std::time::{Duration, Instant};

/// Time source for everything that schedules or measures.
///
/// Renewal cadence, prune cadence, and reconnect backoff all take their
/// notion of "now" and their sleeps from this trait so tests can substitute
/// a manually driven clock.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

/// Wall-clock implementation used outside of tests.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}
