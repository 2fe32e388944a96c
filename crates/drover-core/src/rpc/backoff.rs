//! Reconnect backoff: decides how long to wait after a transport failure.

use std::time::Duration;

use rand::Rng;

/// Delay policy between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),

    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    ///
    /// With `jitter`, each delay is scaled by a random factor in `[0.5, 1.0]`
    /// so a fleet of agents does not reconnect in lockstep.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(15))
    }
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            base,
            multiplier: 2.0,
            max,
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (1-indexed; 0 is treated as 1).
    ///
    /// Example with base=1s, multiplier=2.0, max=10s, no jitter:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    /// - attempt 5: 10s (capped)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                base,
                multiplier,
                max,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = (base.as_secs_f64() * multiplier.powi(exp)).min(max.as_secs_f64());
                let secs = if *jitter {
                    secs * rand::thread_rng().gen_range(0.5..=1.0)
                } else {
                    secs
                };
                Duration::try_from_secs_f64(secs).unwrap_or(*max)
            }
        }
    }
}
