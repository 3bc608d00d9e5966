//! Per-client fixed-window rate limiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::identity::ClientIdentity;

/// Source of monotonic time for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

/// Rate-limit state for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
    pub limit: u32,
    pub window_duration: Duration,
}

impl RateWindow {
    fn new(now: Instant, limit: u32, window_duration: Duration) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit,
            window_duration,
        }
    }

    /// Time since the window opened. A clock that moved backwards reads as zero.
    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.window_start)
    }

    fn admit(&mut self, now: Instant) -> Admission {
        if self.elapsed(now) >= self.window_duration {
            self.window_start = now;
            self.count = 0;
        }

        if self.count < self.limit {
            self.count += 1;
            Admission::Allowed
        } else {
            Admission::Rejected {
                retry_after: self.window_duration - self.elapsed(now),
            }
        }
    }
}

/// Fixed-window counter keyed by client identity.
///
/// Each client's window sits behind its own mutex. Admission holds the map
/// entry (a shared shard guard on the fast path) while the window is locked,
/// so `sweep` can never evict a window that a request is counting against.
pub struct RateLimiter {
    windows: DashMap<ClientIdentity, Arc<Mutex<RateWindow>>>,
    limit: u32,
    window_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_duration: Duration) -> Self {
        Self::with_clock(limit, window_duration, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: u32, window_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window_duration,
            clock,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Count a request from `identity` against its window.
    pub fn admit(&self, identity: &ClientIdentity) -> Admission {
        let now = self.clock.now();
        let admission = match self.windows.get(identity) {
            Some(entry) => entry.value().lock().admit(now),
            None => self
                .windows
                .entry(identity.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(RateWindow::new(now, self.limit, self.window_duration)))
                })
                .value()
                .lock()
                .admit(now),
        };

        if let Admission::Rejected { retry_after } = admission {
            tracing::debug!(
                client = %identity,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        admission
    }

    /// Current window for `identity`, if the client has been seen.
    pub fn window(&self, identity: &ClientIdentity) -> Option<RateWindow> {
        self.windows.get(identity).map(|entry| *entry.value().lock())
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows idle for at least two window durations. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let stale_after = self.window_duration.saturating_mul(2);
        let before = self.windows.len();

        self.windows
            .retain(|_, window| window.lock().elapsed(now) < stale_after);

        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, "Evicted stale rate-limit windows");
        }
        removed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
        rewind: Mutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now() + Duration::from_secs(3600),
                offset: Mutex::new(Duration::ZERO),
                rewind: Mutex::new(Duration::ZERO),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }

        fn rewind(&self, by: Duration) {
            *self.rewind.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock() - *self.rewind.lock()
        }
    }

    fn client(name: &str) -> ClientIdentity {
        ClientIdentity::new(name)
    }

    fn limiter(limit: u32, secs: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(limit, Duration::from_secs(secs), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let (limiter, _clock) = limiter(10, 60);
        let a = client("10.0.0.1");

        for _ in 0..10 {
            assert_eq!(limiter.admit(&a), Admission::Allowed);
        }
        match limiter.admit(&a) {
            Admission::Rejected { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_counts_down_from_window_start() {
        let (limiter, clock) = limiter(1, 60);
        let a = client("a");

        assert_eq!(limiter.admit(&a), Admission::Allowed);
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            limiter.admit(&a),
            Admission::Rejected {
                retry_after: Duration::from_secs(59)
            }
        );
    }

    #[test]
    fn test_window_resets_after_duration() {
        let (limiter, clock) = limiter(2, 60);
        let a = client("a");

        assert_eq!(limiter.admit(&a), Admission::Allowed);
        assert_eq!(limiter.admit(&a), Admission::Allowed);
        assert!(matches!(limiter.admit(&a), Admission::Rejected { .. }));

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.admit(&a), Admission::Allowed);
        assert_eq!(limiter.window(&a).unwrap().count, 1);
    }

    #[test]
    fn test_clients_are_isolated() {
        let (limiter, _clock) = limiter(3, 60);
        let a = client("a");
        let b = client("b");

        for _ in 0..50 {
            limiter.admit(&b);
        }
        for _ in 0..3 {
            assert_eq!(limiter.admit(&a), Admission::Allowed);
        }
        assert_eq!(limiter.window(&a).unwrap().count, 3);
        assert_eq!(limiter.window(&b).unwrap().count, 3);
    }

    #[test]
    fn test_clock_rollback_does_not_reset_window() {
        let (limiter, clock) = limiter(2, 60);
        let a = client("a");

        assert_eq!(limiter.admit(&a), Admission::Allowed);
        assert_eq!(limiter.admit(&a), Admission::Allowed);

        clock.rewind(Duration::from_secs(600));
        match limiter.admit(&a) {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(60)),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(limiter.window(&a).unwrap().count, 2);
    }

    #[test]
    fn test_window_created_lazily() {
        let (limiter, _clock) = limiter(5, 60);
        let a = client("a");

        assert!(limiter.window(&a).is_none());
        assert_eq!(limiter.tracked_clients(), 0);
        limiter.admit(&a);
        assert_eq!(limiter.tracked_clients(), 1);

        let window = limiter.window(&a).unwrap();
        assert_eq!(window.limit, 5);
        assert_eq!(window.window_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_sweep_evicts_only_stale_windows() {
        let (limiter, clock) = limiter(5, 60);
        limiter.admit(&client("old"));
        clock.advance(Duration::from_secs(100));
        limiter.admit(&client("fresh"));
        clock.advance(Duration::from_secs(30));

        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.window(&client("old")).is_none());
        assert!(limiter.window(&client("fresh")).is_some());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        let a = client("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let a = a.clone();
                thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.admit(&a) == Admission::Allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
        assert_eq!(limiter.window(&a).unwrap().count, 100);
    }

    #[test]
    fn test_sweep_racing_admission_never_exceeds_limit() {
        for _ in 0..50 {
            let (limiter, clock) = limiter(5, 60);
            let limiter = Arc::new(limiter);
            let a = client("racer");
            for _ in 0..5 {
                limiter.admit(&a);
            }
            // Window is now stale and eligible for eviction
            clock.advance(Duration::from_secs(130));

            let sweeper = {
                let limiter = limiter.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        limiter.sweep();
                    }
                })
            };
            let admitters: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = limiter.clone();
                    let a = a.clone();
                    thread::spawn(move || {
                        (0..4)
                            .filter(|_| limiter.admit(&a) == Admission::Allowed)
                            .count()
                    })
                })
                .collect();

            let allowed: usize = admitters.into_iter().map(|h| h.join().unwrap()).sum();
            sweeper.join().unwrap();
            assert_eq!(allowed, 5);
            assert_eq!(limiter.window(&a).unwrap().count, 5);
        }
    }
}
