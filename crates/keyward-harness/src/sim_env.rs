//! Virtual clock implementation of [`Environment`].
//!
//! Time only moves when something sleeps or a test calls
//! [`SimEnv::advance`]. Sleeping returns immediately after moving the clock,
//! so backoff schedules run in zero real time and are fully reproducible.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use keyward_core::Environment;

/// Unix seconds the virtual wall clock starts at.
const WALL_CLOCK_EPOCH: u64 = 1_700_000_000;

/// Deterministic environment with a shared virtual clock.
///
/// Clones share the clock, so every machine of a simulation sees the same
/// time.
#[derive(Debug, Clone, Default)]
pub struct SimEnv {
    elapsed_nanos: Arc<AtomicU64>,
    sleeps: Arc<AtomicU64>,
}

impl SimEnv {
    /// A clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time since the simulation started.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_nanos.fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Number of completed sleeps.
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        std::future::ready(())
    }

    fn wall_clock_secs(&self) -> u64 {
        WALL_CLOCK_EPOCH + self.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeping_advances_shared_clock() {
        let env = SimEnv::new();
        let clone = env.clone();

        let start = env.now();
        drop(clone.sleep(Duration::from_millis(250)));

        assert_eq!(env.now() - start, Duration::from_millis(250));
        assert_eq!(env.sleep_count(), 1);
        assert_eq!(env.wall_clock_secs(), WALL_CLOCK_EPOCH);
    }

    #[test]
    fn wall_clock_follows_virtual_time() {
        let env = SimEnv::new();
        env.advance(Duration::from_secs(90));
        assert_eq!(env.wall_clock_secs(), WALL_CLOCK_EPOCH + 90);
    }
}
