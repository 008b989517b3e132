//! Saturating delays.
//!
//! Causal deadlines are sums of declared tolerances along frontier paths.
//! Any sum involving an unbounded tolerance, or overflowing, is unbounded.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A non-negative tolerance in milliseconds, or "unbounded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delay(u64);

impl Delay {
    /// No delay at all.
    pub const ZERO: Delay = Delay(0);

    /// The sentinel maximum: no deadline can be derived.
    pub const UNBOUNDED: Delay = Delay(u64::MAX);

    /// A delay of `millis` milliseconds. `u64::MAX` is unbounded.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds, or `None` when unbounded.
    pub fn as_millis(self) -> Option<u64> {
        self.is_bounded().then_some(self.0)
    }

    /// The delay as a duration, or `None` when unbounded.
    pub fn as_duration(self) -> Option<Duration> {
        self.as_millis().map(Duration::from_millis)
    }

    /// Whether a finite bound exists.
    pub const fn is_bounded(self) -> bool {
        self.0 != u64::MAX
    }

    /// Saturating addition: unbounded absorbs everything.
    pub const fn saturating_add(self, other: Delay) -> Delay {
        Delay(self.0.saturating_add(other.0))
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Self(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<Option<Duration>> for Delay {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::UNBOUNDED, Self::from)
    }
}

impl std::ops::Add for Delay {
    type Output = Delay;

    fn add(self, rhs: Delay) -> Delay {
        self.saturating_add(rhs)
    }
}

impl std::fmt::Display for Delay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_millis() {
            Some(ms) => write!(f, "{ms}ms"),
            None => write!(f, "unbounded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unbounded_absorbs() {
        assert_eq!(Delay::UNBOUNDED + Delay::from_millis(5), Delay::UNBOUNDED);
        assert_eq!(Delay::from_millis(5) + Delay::UNBOUNDED, Delay::UNBOUNDED);
        assert_eq!(Delay::UNBOUNDED.as_duration(), None);
        assert_eq!(Delay::default(), Delay::UNBOUNDED);
    }

    #[test]
    fn test_duration_conversion() {
        assert_eq!(Delay::from(Duration::from_millis(250)), Delay::from_millis(250));
        assert_eq!(Delay::from(None), Delay::UNBOUNDED);
        assert_eq!(Delay::from_millis(10).to_string(), "10ms");
    }

    proptest! {
        #[test]
        fn test_addition_never_decreases(a in any::<u64>(), b in any::<u64>()) {
            let sum = Delay::from_millis(a) + Delay::from_millis(b);
            prop_assert!(sum >= Delay::from_millis(a));
            prop_assert!(sum >= Delay::from_millis(b));
        }

        #[test]
        fn test_addition_is_commutative(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(
                Delay::from_millis(a) + Delay::from_millis(b),
                Delay::from_millis(b) + Delay::from_millis(a)
            );
        }

        #[test]
        fn test_overflow_saturates(a in (u64::MAX / 2)..u64::MAX, b in (u64::MAX / 2 + 1)..u64::MAX) {
            prop_assert!(!(Delay::from_millis(a) + Delay::from_millis(b)).is_bounded());
        }
    }
}
