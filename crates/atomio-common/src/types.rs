//! Core value types for Atomio

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Enqueue sequence number
///
/// Assigned once per logical queue entry, strictly increasing. A coalesced
/// enqueue reuses the sequence of the entry it was folded into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(u64);

impl Sequence {
    /// Sequence preceding every assigned entry
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The sequence assigned after this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Queue depth thresholds controlling backpressure
///
/// Producers stall when the outstanding depth exceeds `high` and resume
/// once it has fallen to `low` or below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    /// Create validated watermarks
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `high` is zero or `low` exceeds `high`.
    pub fn new(high: usize, low: usize) -> Result<Self> {
        let marks = Self { high, low };
        marks.validate()?;
        Ok(marks)
    }

    /// Check the thresholds are usable
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `high` is zero or `low` exceeds `high`.
    pub fn validate(&self) -> Result<()> {
        if self.high == 0 {
            return Err(Error::config("high watermark must be at least 1"));
        }
        if self.low > self.high {
            return Err(Error::config(format!(
                "low watermark {} exceeds high watermark {}",
                self.low, self.high
            )));
        }
        Ok(())
    }

    /// Whether an enqueue that finds `depth` outstanding entries must stall
    #[must_use]
    pub const fn is_over(&self, depth: usize) -> bool {
        depth >= self.high
    }

    /// Whether a queue at `depth` has drained enough to release stalled producers
    #[must_use]
    pub const fn is_released(&self, depth: usize) -> bool {
        depth <= self.low
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: 1024,
            low: 256,
        }
    }
}

impl fmt::Display for Watermarks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hi-water={} low-water={}", self.high, self.low)
    }
}

/// Live state of an identity that has work outstanding
///
/// An identity with no outstanding work has reached a terminal state
/// (done or failed) and is no longer tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    /// Enqueued, not yet claimed by a worker
    Pending,
    /// Claimed by a worker, store primitive executing
    InFlight,
    /// In flight with a newer payload already pending behind it
    InFlightWithPending,
}

impl EntryState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::InFlightWithPending => "in-flight+pending",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_validation() {
        assert!(Watermarks::new(10, 5).is_ok());
        assert!(Watermarks::new(2, 2).is_ok());
        assert!(Watermarks::new(0, 0).is_err());
        assert!(matches!(Watermarks::new(4, 5), Err(Error::Config(_))));
    }

    #[test]
    fn test_watermark_thresholds() {
        let marks = Watermarks::new(10, 5).unwrap();
        assert!(!marks.is_over(9));
        assert!(marks.is_over(10));
        assert!(marks.is_released(5));
        assert!(!marks.is_released(6));
    }

    #[test]
    fn test_sequence_ordering() {
        let first = Sequence::ZERO.next();
        assert_eq!(first.get(), 1);
        assert!(first < first.next());
        assert_eq!(first.to_string(), "#1");
    }
}
