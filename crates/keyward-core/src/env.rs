//! Environment abstraction for deterministic testing.
//!
//! Decouples the state manager from system time. The sync driver's backoff and
//! the directory's last-update stamps go through this trait so simulation can
//! run them against a virtual clock.

use std::time::Duration;

/// Abstract environment providing time and async sleep.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `wall_clock_secs()` is only used for persisted timestamps, never for
///   ordering decisions
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`, simulation a virtual instant.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `earlier`, a value previously returned by
    /// [`now`](Self::now).
    fn since(&self, earlier: Self::Instant) -> Duration {
        self.now() - earlier
    }

    /// Sleeps for the specified duration.
    ///
    /// Only the sync driver sleeps. Session and directory logic never waits.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;
}
