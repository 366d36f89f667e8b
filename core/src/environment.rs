//! Injected dependencies.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability.
///
/// The task engine reads every timestamp (creation, status changes, expiry)
/// through a `Clock`, so tests can pin or advance time explicitly.
///
/// # Examples
///
/// ```
/// use duplex_rpc_core::environment::{Clock, SystemClock};
///
/// let now = SystemClock.now();
/// assert!(now.timestamp() > 0);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
