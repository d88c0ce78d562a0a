use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default failures before lockout.
pub const MAX_FAILURES: u32 = 5;
/// Sliding window over which failures are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Default lockout after exceeding the failure limit.
pub const LOCKOUT: Duration = Duration::from_secs(300);

struct SessionRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl SessionRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Per-session limiter for handshake attempts.
///
/// After `max_failures` bad tokens within WINDOW the session is locked for
/// `lockout`. Only credential failures count; unknown or expired sessions do
/// not.
pub struct HandshakeLimiter {
    records: HashMap<String, SessionRecord>,
    max_failures: u32,
    lockout: Duration,
}

impl HandshakeLimiter {
    pub fn new(max_failures: u32, lockout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            max_failures: max_failures.max(1),
            lockout,
        }
    }

    /// `Ok(())` if the session may attempt a handshake, otherwise the time
    /// remaining on its lockout.
    pub fn check(&mut self, session: &str) -> Result<(), Duration> {
        self.check_at(session, Instant::now())
    }

    fn check_at(&mut self, session: &str, now: Instant) -> Result<(), Duration> {
        let Some(record) = self.records.get_mut(session) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(locked_until.duration_since(now));
            }
            // Lockout expired
            *record = SessionRecord::fresh(now);
        } else if now.duration_since(record.window_start) >= WINDOW {
            record.failures = 0;
            record.window_start = now;
        }
        Ok(())
    }

    /// Record a bad token. May trigger a lockout.
    pub fn record_failure(&mut self, session: &str) {
        self.record_failure_at(session, Instant::now());
    }

    fn record_failure_at(&mut self, session: &str, now: Instant) {
        let record = self
            .records
            .entry(session.to_string())
            .or_insert_with(|| SessionRecord::fresh(now));

        if now.duration_since(record.window_start) >= WINDOW {
            record.failures = 0;
            record.window_start = now;
        }

        record.failures += 1;
        if record.failures >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            tracing::warn!(
                session,
                failures = record.failures,
                lockout_secs = self.lockout.as_secs(),
                "handshake limit reached, locking session"
            );
        } else {
            tracing::debug!(
                session,
                failures = record.failures,
                max = self.max_failures,
                "bad session token"
            );
        }
    }

    /// A successful handshake clears the counter.
    pub fn record_success(&mut self, session: &str) {
        self.records.remove(session);
    }

    /// Drop state for a session that no longer exists.
    pub fn forget(&mut self, session: &str) {
        self.records.remove(session);
    }
}

impl Default for HandshakeLimiter {
    fn default() -> Self {
        Self::new(MAX_FAILURES, LOCKOUT)
    }
}

/// Fixed one-second window frame counter for the binary frame path.
#[derive(Debug)]
pub struct FrameThrottle {
    max_fps: u32,
    window_start: Option<Instant>,
    count: u32,
}

impl FrameThrottle {
    pub fn new(max_fps: u32) -> Self {
        Self {
            max_fps: max_fps.max(1),
            window_start: None,
            count: 0,
        }
    }

    pub fn max_fps(&self) -> u32 {
        self.max_fps
    }

    /// Whether a frame arriving at `now` is within the rate.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < Duration::from_secs(1) => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
        if self.count < self.max_fps {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_under_limit() {
        let mut rl = HandshakeLimiter::default();
        for _ in 0..4 {
            assert!(rl.check("s1").is_ok());
            rl.record_failure("s1");
        }
        assert!(rl.check("s1").is_ok());
    }

    #[test]
    fn test_locks_after_max_failures() {
        let mut rl = HandshakeLimiter::default();
        for _ in 0..MAX_FAILURES {
            rl.record_failure("s1");
        }
        let remaining = rl.check("s1").unwrap_err();
        assert!(remaining <= LOCKOUT);
    }

    #[test]
    fn test_lockout_expires() {
        let mut rl = HandshakeLimiter::new(2, Duration::from_secs(10));
        let t0 = Instant::now();
        rl.record_failure_at("s1", t0);
        rl.record_failure_at("s1", t0);
        assert!(rl.check_at("s1", t0 + Duration::from_secs(5)).is_err());
        assert!(rl.check_at("s1", t0 + Duration::from_secs(11)).is_ok());
    }

    #[test]
    fn test_success_clears_counter() {
        let mut rl = HandshakeLimiter::default();
        for _ in 0..4 {
            rl.record_failure("s1");
        }
        rl.record_success("s1");
        rl.record_failure("s1");
        assert!(rl.check("s1").is_ok());
    }

    #[test]
    fn test_independent_per_session() {
        let mut rl = HandshakeLimiter::default();
        for _ in 0..MAX_FAILURES {
            rl.record_failure("s1");
        }
        assert!(rl.check("s2").is_ok());
        assert!(rl.check("s1").is_err());
    }

    #[test]
    fn test_throttle_caps_per_second() {
        let mut t = FrameThrottle::new(3);
        let t0 = Instant::now();
        assert!(t.admit(t0));
        assert!(t.admit(t0 + Duration::from_millis(100)));
        assert!(t.admit(t0 + Duration::from_millis(200)));
        assert!(!t.admit(t0 + Duration::from_millis(300)));
        assert!(t.admit(t0 + Duration::from_millis(1_001)));
    }
}
