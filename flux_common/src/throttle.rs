//! Rate-limited logging token.
//!
//! Hot loops must not spam the log on repeated failures. A [`LogThrottle`]
//! gates a log statement to at most one emission per interval and reports
//! how many emissions were suppressed in between.
//!
//! ```
//! use flux_common::throttle::LogThrottle;
//! use std::time::Duration;
//!
//! let throttle = LogThrottle::new(Duration::from_secs(10));
//! if let Some(suppressed) = throttle.allow() {
//!     tracing::warn!(suppressed, "no free page");
//! }
//! ```

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct ThrottleState {
    last_emit: Option<Instant>,
    suppressed: u64,
}

/// Gate allowing one log emission per interval.
pub struct LogThrottle {
    min_interval: Duration,
    state: Mutex<ThrottleState>,
}

impl LogThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(ThrottleState {
                last_emit: None,
                suppressed: 0,
            }),
        }
    }

    /// Returns `Some(suppressed_count)` when the caller may log now,
    /// `None` when the emission must be suppressed.
    pub fn allow(&self) -> Option<u64> {
        let mut st = self.state.lock();
        let now = Instant::now();
        match st.last_emit {
            Some(t) if now.duration_since(t) < self.min_interval => {
                st.suppressed += 1;
                None
            }
            _ => {
                let suppressed = st.suppressed;
                st.suppressed = 0;
                st.last_emit = Some(now);
                Some(suppressed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emission_allowed() {
        let t = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(t.allow(), Some(0));
    }

    #[test]
    fn burst_is_suppressed_then_counted() {
        let t = LogThrottle::new(Duration::from_secs(60));
        assert!(t.allow().is_some());
        for _ in 0..5 {
            assert!(t.allow().is_none());
        }
        // zero interval variant reports the suppressed count
        let t = LogThrottle::new(Duration::ZERO);
        assert_eq!(t.allow(), Some(0));
        assert_eq!(t.allow(), Some(0));
    }
}
