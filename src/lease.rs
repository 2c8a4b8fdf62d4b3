//! Lease records and lease time arithmetic.
//!
//! The free functions in this module never read a wall clock: every
//! question about validity takes an explicit `now`. The engine obtains
//! `now` from a [`Clock`], which tests replace with a [`ManualClock`].
//!
//! # Lease states
//!
//! ```text
//! active --renew--> active            (at most max_renewals times)
//! active --end passes, sweep/access--> expired   (terminal)
//! ```
//!
//! The stored `expired` flag is a cached sweep result. Whether a lease is
//! still valid is always recomputed from `(end, now)`.

use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Renewals allowed per lease unless configured otherwise.
pub const DEFAULT_MAX_RENEWALS: u32 = 3;

/// Time-bounded validity attached one-to-one to an [`Allocation`](crate::Allocation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: u64,
    pub pool_id: u64,
    pub allocation_id: u64,
    pub start: DateTime<Utc>,
    pub duration_seconds: u32,
    /// `start + duration` at creation; `renewal time + extension` after a renewal.
    pub end: DateTime<Utc>,
    pub renewal_count: u32,
    pub max_renewals: u32,
    /// Set by the expiry sweep or by release; never cleared once the end has passed.
    pub expired: bool,
    pub auto_renew: bool,
}

impl Lease {
    pub fn new(
        id: u64,
        pool_id: u64,
        allocation_id: u64,
        start: DateTime<Utc>,
        duration_seconds: u32,
        max_renewals: u32,
    ) -> Self {
        Self {
            id,
            pool_id,
            allocation_id,
            start,
            duration_seconds,
            end: compute_end(start, duration_seconds),
            renewal_count: 0,
            max_renewals,
            expired: false,
            auto_renew: true,
        }
    }

    /// True if the end time has passed at `now`, regardless of the cached flag.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self, now)
    }

    /// Neither flagged expired nor past its end time.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.expired && !self.is_expired_at(now)
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> TimeDelta {
        remaining(self, now)
    }

    pub fn can_renew(&self) -> bool {
        can_renew(self)
    }

    /// Restarts the lease at `now` for `extension_seconds`.
    ///
    /// The new end is relative to `now`, not to the previous end.
    pub fn renew(&mut self, now: DateTime<Utc>, extension_seconds: u32) {
        self.end = compute_end(now, extension_seconds);
        self.renewal_count += 1;
        self.expired = false;
    }
}

pub fn compute_end(start: DateTime<Utc>, duration_seconds: u32) -> DateTime<Utc> {
    start + TimeDelta::seconds(i64::from(duration_seconds))
}

/// Time left before `lease` ends, or zero once it has ended.
pub fn remaining(lease: &Lease, now: DateTime<Utc>) -> TimeDelta {
    (lease.end - now).max(TimeDelta::zero())
}

pub fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    now > lease.end
}

pub fn can_renew(lease: &Lease) -> bool {
    lease.renewal_count < lease.max_renewals
}

/// Source of the current time for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = *now + delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_at(start: DateTime<Utc>, duration_seconds: u32) -> Lease {
        Lease::new(1, 1, 1, start, duration_seconds, DEFAULT_MAX_RENEWALS)
    }

    #[test]
    fn test_lease_struct() {
        let start = Utc::now();
        let lease = lease_at(start, 3600);
        assert_eq!(lease.end, start + TimeDelta::seconds(3600));
        assert_eq!(lease.renewal_count, 0);
        assert_eq!(lease.max_renewals, 3);
        assert!(!lease.expired);
        assert!(lease.auto_renew);
        assert!(lease.is_valid_at(start));
    }

    #[test]
    fn test_expiry_is_strictly_after_end() {
        let start = Utc::now();
        let lease = lease_at(start, 60);
        assert!(!lease.is_expired_at(lease.end));
        assert!(lease.is_expired_at(lease.end + TimeDelta::milliseconds(1)));
        assert!(!lease.is_valid_at(lease.end + TimeDelta::seconds(1)));
    }

    #[test]
    fn test_flag_alone_invalidates() {
        let start = Utc::now();
        let mut lease = lease_at(start, 3600);
        lease.expired = true;
        assert!(!lease.is_expired_at(start));
        assert!(!lease.is_valid_at(start));
    }

    #[test]
    fn test_remaining_never_negative() {
        let start = Utc::now();
        let lease = lease_at(start, 100);
        assert_eq!(lease.remaining_at(start).num_seconds(), 100);
        assert_eq!(
            lease.remaining_at(start + TimeDelta::seconds(40)).num_seconds(),
            60
        );
        assert_eq!(lease.remaining_at(start + TimeDelta::hours(2)), TimeDelta::zero());
    }

    #[test]
    fn test_renew_resets_relative_to_now() {
        let start = Utc::now();
        let mut lease = lease_at(start, 100);
        let later = start + TimeDelta::seconds(90);
        lease.renew(later, 50);
        assert_eq!(lease.end, later + TimeDelta::seconds(50));
        assert_eq!(lease.renewal_count, 1);
        assert_eq!(lease.start, start);
    }

    #[test]
    fn test_can_renew_until_max() {
        let start = Utc::now();
        let mut lease = lease_at(start, 100);
        for _ in 0..DEFAULT_MAX_RENEWALS {
            assert!(lease.can_renew());
            lease.renew(start, 100);
        }
        assert!(!lease.can_renew());
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(TimeDelta::seconds(30));
        assert_eq!(clock.now(), start + TimeDelta::seconds(30));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
