//! Clock abstraction shared by every worker.
//!
//! Rate-limit windows, dedup expiry, backoff sleeps and schedule evaluation
//! all read time through [`Clock`], so tests can drive hours of retry
//! behaviour without waiting on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// Production maps this to `tokio::time::sleep`; the test clock advances
    /// virtual time and yields instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Controllable clock for deterministic tests.
///
/// Clones share the same underlying time, so a clock handed to the engine
/// can be advanced from the test body. Wall-clock time may be moved
/// backwards with [`TestClock::set`]; monotonic time only moves forward.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    wall_ms: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Creates a test clock starting at a specific UTC instant.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            base_instant: Instant::now(),
        }
    }

    /// Advances both monotonic and wall-clock time.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);

        self.elapsed_ns.fetch_add(nanos, Ordering::AcqRel);
        self.wall_ms.fetch_add(millis, Ordering::AcqRel);
    }

    /// Moves wall-clock time to `time`, forwards or backwards.
    pub fn set(&self, time: DateTime<Utc>) {
        self.wall_ms.store(time.timestamp_millis(), Ordering::Release);
    }

    /// Total virtual time slept or advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        let millis = self.wall_ms.load(Ordering::Acquire);
        match u64::try_from(millis) {
            Ok(ms) => UNIX_EPOCH + Duration::from_millis(ms),
            Err(_) => UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs()),
        }
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let millis = self.wall_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::at(start());
        let before = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(90));
        assert_eq!(clock.now_utc(), start() + chrono::Duration::seconds(90));
    }

    #[test]
    fn set_can_rewind_wall_clock_only() {
        let clock = TestClock::at(start());
        clock.advance(Duration::from_secs(10));

        clock.set(start() - chrono::Duration::hours(1));

        assert_eq!(clock.now_utc(), start() - chrono::Duration::hours(1));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn system_time_matches_utc_view() {
        let clock = TestClock::at(start());
        assert_eq!(DateTime::<Utc>::from(clock.now_system()), clock.now_utc());
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::at(start());

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(5));
        assert_eq!(clock.now_utc(), start() + chrono::Duration::seconds(5));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::at(start());
        let handle = clock.clone();

        handle.advance(Duration::from_secs(30));

        assert_eq!(clock.now_utc(), start() + chrono::Duration::seconds(30));
    }
}
