//! Simulated-work delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Inclusive range of milliseconds an actor spends on one simulated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    /// Shortest delay.
    pub min_ms: u64,
    /// Longest delay.
    pub max_ms: u64,
}

impl DelayRange {
    /// A range of `min_ms..=max_ms`.
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// A fixed delay.
    #[must_use]
    pub const fn fixed(ms: u64) -> Self {
        Self::new(ms, ms)
    }

    /// Picks a delay uniformly from the range.
    #[must_use]
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let ms = if self.min_ms >= self.max_ms {
            self.min_ms
        } else {
            rng.gen_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(ms)
    }

    /// Checks that `min_ms <= max_ms`.
    pub fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.min_ms > self.max_ms {
            return Err(ValidationError::InvalidDelayRange {
                field: field.to_string(),
                min_ms: self.min_ms,
                max_ms: self.max_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_in_range() {
        let range = DelayRange::new(5, 9);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = range.sample(&mut rng);
            assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(9));
        }
    }

    #[test]
    fn fixed_range_is_constant() {
        let mut rng = rand::thread_rng();
        assert_eq!(DelayRange::fixed(500).sample(&mut rng), Duration::from_millis(500));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = DelayRange::new(10, 1).validate("eat").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDelayRange { min_ms: 10, max_ms: 1, .. }));
        assert!(DelayRange::new(1, 10).validate("eat").is_ok());
    }
}
