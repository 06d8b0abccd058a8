//! Reconnect backoff. Adapted from the driver's exponential-backoff
//! strategy: each attempt waits for roughly twice the last delay, jittered,
//! clamped to a min/max range — here `spec.md` §4.6's "exponential backoff
//! from 1 s to 60 s ceiling".

use std::time::Duration;

use rand::random;

/// Exponential backoff waiting strategy for stream reconnects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialBackoff {
    /// Minimum amount of time to wait between retries.
    pub min: Duration,
    /// Maximum amount of time to wait between retries.
    pub max: Duration,
    /// Uniform random jitter applied to generated wait times; `0.1` means
    /// +/-10%. Restricted to within +/-100%.
    pub jitter: f32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    /// Returns the delay to wait before the next attempt, given the delay
    /// used for the previous attempt (`None` for the first attempt).
    #[must_use]
    pub fn retry_in(&self, last_wait: Option<Duration>) -> Duration {
        let attempt = last_wait.map_or(self.min, |t| 2 * t);
        let perturb = (1.0 - (self.jitter * 2.0 * (random::<f32>() - 1.0))).clamp(0.0, 2.0);
        let target = attempt.mul_f32(perturb);

        let safe_max = if self.max < self.min { self.min } else { self.max };
        target.clamp(self.min, safe_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_at_least_min() {
        let backoff = ExponentialBackoff::default();
        let wait = backoff.retry_in(None);
        assert!(wait >= backoff.min);
    }

    #[test]
    fn never_exceeds_max() {
        let backoff = ExponentialBackoff::default();
        let mut last = None;
        for _ in 0..20 {
            let wait = backoff.retry_in(last);
            assert!(wait <= backoff.max);
            last = Some(wait);
        }
    }
}
