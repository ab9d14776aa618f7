//! Client-side ARM throttling
//!
//! ARM answers an over-eager client with HTTP 429 and a `Retry-After`
//! header. The client records the instant it may call again and refuses
//! calls of the same kind until then, without touching the network.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// Back-off applied when ARM throttles without a usable `Retry-After`
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

/// Kind of ARM call; reads and writes are throttled independently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// GET requests
    Read,
    /// PATCH/PUT requests
    Write,
}

impl CallKind {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug, Default)]
struct RetryAfter {
    reader: Option<DateTime<Utc>>,
    writer: Option<DateTime<Utc>>,
}

impl RetryAfter {
    fn slot(&mut self, kind: CallKind) -> &mut Option<DateTime<Utc>> {
        match kind {
            CallKind::Read => &mut self.reader,
            CallKind::Write => &mut self.writer,
        }
    }
}

/// Per-client retry-after instants for reads and writes
///
/// Starts unthrottled. Instants only ever move forward and simply expire;
/// they are never cleared.
#[derive(Debug, Default)]
pub struct Throttle {
    state: Mutex<RetryAfter>,
}

impl Throttle {
    /// Create an unthrottled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ok when a call of `kind` may be sent at `now`, otherwise the instant
    /// it may be sent again
    pub fn check(&self, kind: CallKind, now: DateTime<Utc>) -> Result<(), DateTime<Utc>> {
        match *self.state.lock().slot(kind) {
            Some(until) if now < until => Err(until),
            _ => Ok(()),
        }
    }

    /// Refuse calls of `kind` until `until`
    ///
    /// An earlier instant than the one already recorded is ignored.
    pub fn defer_until(&self, kind: CallKind, until: DateTime<Utc>) {
        let mut state = self.state.lock();
        let slot = state.slot(kind);
        if slot.map_or(true, |current| until > current) {
            *slot = Some(until);
        }
    }

    /// Refuse calls of `kind` for `retry_after` from `now`
    ///
    /// Returns the recorded instant.
    pub fn defer_for(
        &self,
        kind: CallKind,
        now: DateTime<Utc>,
        retry_after: Duration,
    ) -> DateTime<Utc> {
        let delta = TimeDelta::from_std(retry_after).unwrap_or_else(|_| {
            warn!(
                kind = kind.as_str(),
                retry_after_secs = retry_after.as_secs(),
                "Retry-After out of range, using default"
            );
            TimeDelta::seconds(DEFAULT_RETRY_AFTER.as_secs() as i64)
        });
        let until = now + delta;
        self.defer_until(kind, until);
        until
    }

    /// Instant reads are blocked until, if any was ever recorded
    pub fn retry_after_reader(&self) -> Option<DateTime<Utc>> {
        self.state.lock().reader
    }

    /// Instant writes are blocked until, if any was ever recorded
    pub fn retry_after_writer(&self) -> Option<DateTime<Utc>> {
        self.state.lock().writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_not_throttled() {
        let throttle = Throttle::new();
        let now = Utc::now();
        assert!(throttle.check(CallKind::Read, now).is_ok());
        assert!(throttle.check(CallKind::Write, now).is_ok());
        assert!(throttle.retry_after_reader().is_none());
        assert!(throttle.retry_after_writer().is_none());
    }

    #[test]
    fn reads_and_writes_are_throttled_independently() {
        let throttle = Throttle::new();
        let now = Utc::now();
        let until = throttle.defer_for(CallKind::Write, now, Duration::from_secs(10));

        assert_eq!(throttle.check(CallKind::Write, now), Err(until));
        assert!(throttle.check(CallKind::Read, now).is_ok());
    }

    #[test]
    fn throttle_expires_without_being_cleared() {
        let throttle = Throttle::new();
        let now = Utc::now();
        let until = throttle.defer_for(CallKind::Read, now, Duration::from_secs(5));

        assert!(throttle.check(CallKind::Read, until).is_ok());
        assert!(throttle.check(CallKind::Read, until + TimeDelta::seconds(1)).is_ok());
        assert_eq!(throttle.retry_after_reader(), Some(until));
    }

    #[test]
    fn throttle_never_moves_backwards() {
        let throttle = Throttle::new();
        let now = Utc::now();
        let later = now + TimeDelta::seconds(60);
        throttle.defer_until(CallKind::Read, later);
        throttle.defer_until(CallKind::Read, now + TimeDelta::seconds(1));

        assert_eq!(throttle.retry_after_reader(), Some(later));
    }
}
