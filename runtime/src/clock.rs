//! Wall clock for persisted deadlines and signal timestamps
//!
//! Timer deadlines and signal send times are persisted as absolute UTC
//! instants and compared across processes. Two sources exist:
//!
//! - [`Clock::host`] reads the host clock on every call. Processes on the
//!   same host agree on it however long they have been running, so a worker
//!   and a signalling CLI judge the signal/timer race consistently. Use it for
//!   anything that shares a store with another process.
//! - [`Clock::new`] anchors the host time once and advances it with the tokio
//!   clock, so it follows paused test time. It drifts from the host clock
//!   whenever the monotonic clock does (host suspend, NTP steps) and must not
//!   be compared with timestamps taken by another process.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Source {
    Host,
    Anchored {
        origin_utc: DateTime<Utc>,
        origin: Instant,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    source: Source,
}

impl Clock {
    /// Host time anchored to the tokio clock.
    pub fn new() -> Self {
        Self {
            source: Source::Anchored {
                origin_utc: Utc::now(),
                origin: Instant::now(),
            },
        }
    }

    /// The host clock, read on every call.
    pub fn host() -> Self {
        Self {
            source: Source::Host,
        }
    }

    /// Current UTC time.
    pub fn now(&self) -> DateTime<Utc> {
        match self.source {
            Source::Host => Utc::now(),
            Source::Anchored { origin_utc, origin } => {
                let elapsed = chrono::Duration::from_std(origin.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                origin_utc + elapsed
            }
        }
    }

    /// Time left until `deadline`, zero if it has passed.
    pub fn until(&self, deadline: DateTime<Utc>) -> std::time::Duration {
        (deadline - self.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_time() {
        let clock = Clock::new();
        let start = clock.now();
        let deadline = start + chrono::Duration::seconds(60);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(clock.until(deadline), Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.until(deadline), Duration::ZERO);
        assert_eq!(clock.now() - start, chrono::Duration::seconds(75));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_clock_ignores_monotonic_drift() {
        let host = Clock::host();
        let anchored = Clock::new();

        // Monotonic time moves a day ahead of the host clock.
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;

        let skew = (host.now() - Utc::now()).num_seconds().abs();
        assert!(skew < 5, "host clock skewed by {skew}s");
        assert!(anchored.now() - host.now() > chrono::Duration::hours(23));
    }
}
