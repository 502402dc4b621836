//! Monotonic millisecond ticks and deadline arithmetic.
//!
//! The engine never reads the wall clock itself; the scheduler passes the
//! current tick into every wakeup. A `Tick` is either a deadline in
//! milliseconds or "never", and all comparisons treat "never" as the
//! farthest possible point.

/// Monotonic milliseconds as reported by the scheduler.
pub type Ms = u64;

/// A deadline expressed in scheduler milliseconds, or no deadline at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick(Option<Ms>);

impl Tick {
    /// The deadline that never fires.
    pub const ETERNITY: Tick = Tick(None);

    /// A deadline at an absolute millisecond value.
    pub fn at(ms: Ms) -> Tick {
        Tick(Some(ms))
    }

    /// `now + delay`, or eternity when `delay` is `None` (unset timeout).
    pub fn expire_in(now: Ms, delay: Option<Ms>) -> Tick {
        match delay {
            Some(d) => Tick(Some(now.saturating_add(d))),
            None => Tick::ETERNITY,
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_expired(&self, now: Ms) -> bool {
        match self.0 {
            Some(ms) => ms <= now,
            None => false,
        }
    }

    /// The earlier of two deadlines.
    pub fn first(self, other: Tick) -> Tick {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Tick(Some(a.min(b))),
            (Some(a), None) => Tick(Some(a)),
            (None, b) => Tick(b),
        }
    }

    /// Remaining milliseconds until the deadline, if any.
    pub fn remaining(&self, now: Ms) -> Option<Ms> {
        self.0.map(|ms| ms.saturating_sub(now))
    }
}

impl Default for Tick {
    fn default() -> Tick {
        Tick::ETERNITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eternity_never_expires() {
        assert!(!Tick::ETERNITY.is_expired(u64::MAX));
        assert!(!Tick::ETERNITY.is_set());
    }

    #[test]
    fn first_prefers_the_earlier_deadline() {
        let a = Tick::at(100);
        let b = Tick::at(200);
        assert_eq!(a.first(b), a);
        assert_eq!(b.first(a), a);
        assert_eq!(a.first(Tick::ETERNITY), a);
        assert_eq!(Tick::ETERNITY.first(b), b);
    }

    #[test]
    fn expire_in_saturates() {
        let t = Tick::expire_in(u64::MAX - 1, Some(10));
        assert!(t.is_set());
        assert!(!t.is_expired(u64::MAX - 2));
    }

    #[test]
    fn expiry_is_inclusive() {
        let t = Tick::at(50);
        assert!(!t.is_expired(49));
        assert!(t.is_expired(50));
        assert!(t.is_expired(51));
    }
}
