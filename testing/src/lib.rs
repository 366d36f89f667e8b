//! # Duplex RPC Testing
//!
//! Testing utilities for the duplex-rpc protocol engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory transports: connected [`memory::pair`]s, a reconnectable
//!   [`memory::connector`] and a [`memory::raw`] peer that scripts the wire
//!   by hand
//! - [`init_tracing`] for readable logs in failing tests
//!
//! ## Example
//!
//! ```
//! use duplex_rpc_core::envelope::Envelope;
//! use duplex_rpc_testing::memory;
//! use futures::{SinkExt, StreamExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (mut a, mut b) = memory::pair(8);
//! a.outbound.send(Envelope::notification("hello", None)).await.unwrap();
//! let received = b.inbound.next().await.unwrap().unwrap();
//! assert_eq!(received.method(), Some("hello"));
//! # }
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use duplex_rpc_core::environment::Clock;

pub mod memory;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, TimeDelta, Utc};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use duplex_rpc_testing::mocks::FixedClock;
    /// use duplex_rpc_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_089)
    }

    /// Clock that only moves when told to.
    ///
    /// Drives ttl expiry and event ordering tests without sleeping.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::TimeDelta;
    /// use duplex_rpc_core::environment::Clock;
    /// use duplex_rpc_testing::mocks::{ManualClock, epoch};
    ///
    /// let clock = ManualClock::new(epoch());
    /// clock.advance(TimeDelta::seconds(5));
    /// assert_eq!(clock.now(), epoch() + TimeDelta::seconds(5));
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock reading `time` until moved.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock by `delta`; negative deltas go back in time.
        pub fn advance(&self, delta: TimeDelta) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honours `RUST_LOG`; defaults to `debug` for the duplex-rpc crates. Safe
/// to call from every test: only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("duplex_rpc_runtime=debug,duplex_rpc_core=debug")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, epoch, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn epoch_is_new_year_2025() {
        assert_eq!(Some(epoch()), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single());
    }

    #[test]
    fn manual_clock_moves_both_ways() {
        let clock = ManualClock::default();
        clock.advance(TimeDelta::minutes(2));
        clock.advance(TimeDelta::minutes(-1));
        assert_eq!(clock.now(), epoch() + TimeDelta::minutes(1));
        clock.set(epoch());
        assert_eq!(clock.now(), epoch());
    }
}
