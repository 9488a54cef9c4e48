//! Idle backoff for the pull loop.
//!
//! Uses `backon` for the exponential schedule. When no backoff is configured
//! the loop re-pulls immediately.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::BackoffConfig;

/// Build the exponential schedule described by `config`.
///
/// The schedule never runs out; it stays at `max_delay` once reached.
pub fn idle_backoff(config: &BackoffConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay())
        .with_factor(config.factor.max(1.0))
        .with_max_times(usize::MAX);
    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Delay schedule applied between unproductive pulls.
///
/// A productive pull resets the schedule.
pub struct IdleBackoff {
    builder: Option<ExponentialBuilder>,
    current: Option<ExponentialBackoff>,
}

impl IdleBackoff {
    /// No delay between pulls.
    pub fn disabled() -> Self {
        Self {
            builder: None,
            current: None,
        }
    }

    pub fn new(config: Option<&BackoffConfig>) -> Self {
        Self {
            builder: config.map(idle_backoff),
            current: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.builder.is_some()
    }

    /// Next delay, or `None` when backoff is disabled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let builder = self.builder.as_ref()?;
        let schedule = self.current.get_or_insert_with(|| builder.clone().build());
        schedule.next()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: u64, max: u64) -> BackoffConfig {
        BackoffConfig {
            min_delay_ms: min,
            max_delay_ms: max,
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_disabled_yields_no_delay() {
        let mut backoff = IdleBackoff::disabled();
        assert!(!backoff.is_enabled());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(IdleBackoff::new(None).next_delay(), None);
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = IdleBackoff::new(Some(&config(10, 40)));
        let millis: Vec<u128> = (0..5)
            .map(|_| backoff.next_delay().unwrap().as_micros().div_ceil(1000))
            .collect();

        // f32 factor arithmetic can land a hair under the exact value.
        assert_eq!(millis, vec![10, 20, 40, 40, 40]);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = IdleBackoff::new(Some(&config(10, 1000)));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let first = backoff.next_delay().unwrap();
        assert_eq!(first.as_micros().div_ceil(1000), 10);
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let mut cfg = config(10, 40);
        cfg.jitter = true;
        let mut backoff = IdleBackoff::new(Some(&cfg));
        for _ in 0..10 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(80));
        }
    }
}
