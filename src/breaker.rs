use chrono::{DateTime, Duration, Utc};

use crate::config::PollerConfig;
use crate::types::{CircuitSnapshot, CircuitState};

#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: i64,
    pub recovery_seconds: i64,
    pub half_open_successes: i64,
}

impl BreakerPolicy {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            failure_threshold: i64::from(config.circuit_failure_threshold),
            recovery_seconds: config.circuit_recovery_seconds as i64,
            half_open_successes: i64::from(config.circuit_half_open_successes),
        }
    }
}

/// Per-connection failure gate. Operates on the snapshot persisted in the
/// connection row; the worker loads it at cycle start and writes it back at
/// cycle end, so gating survives restarts.
///
/// HALF_OPEN admits one probe at a time, which the strictly sequential
/// per-connection cycle already guarantees.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    snapshot: CircuitSnapshot,
    policy: BreakerPolicy,
}

impl CircuitBreaker {
    pub fn new(snapshot: CircuitSnapshot, policy: BreakerPolicy) -> Self {
        Self { snapshot, policy }
    }

    /// Whether a cycle may proceed. Promotes OPEN to HALF_OPEN once the
    /// recovery window has elapsed.
    pub fn allow_request(&mut self, now: DateTime<Utc>) -> bool {
        match self.snapshot.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.snapshot.open_until {
                Some(open_until) if now < open_until => false,
                _ => {
                    self.snapshot.state = CircuitState::HalfOpen;
                    self.snapshot.half_open_successes = 0;
                    true
                }
            },
        }
    }

    pub fn record_success(&mut self) {
        match self.snapshot.state {
            CircuitState::Closed | CircuitState::Open => {
                self.snapshot.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.snapshot.half_open_successes += 1;
                if self.snapshot.half_open_successes >= self.policy.half_open_successes {
                    self.snapshot = CircuitSnapshot::default();
                }
            }
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.snapshot.consecutive_failures += 1;

        let should_open = match self.snapshot.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                self.snapshot.consecutive_failures >= self.policy.failure_threshold
            }
            CircuitState::Open => false,
        };

        if should_open {
            self.snapshot.state = CircuitState::Open;
            self.snapshot.open_until = Some(now + Duration::seconds(self.policy.recovery_seconds));
            self.snapshot.half_open_successes = 0;
        }
    }

    pub fn reset(&mut self) {
        self.snapshot = CircuitSnapshot::default();
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot.state
    }

    pub fn snapshot(&self) -> &CircuitSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> CircuitSnapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 5,
            recovery_seconds: 120,
            half_open_successes: 2,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitSnapshot::default(), policy())
    }

    #[test]
    fn opens_after_exactly_threshold_consecutive_failures() {
        let now = Utc::now();
        let mut breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure(now);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure(now);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.snapshot().open_until,
            Some(now + Duration::seconds(120))
        );
    }

    #[test]
    fn success_resets_the_failure_count() {
        let now = Utc::now();
        let mut breaker = breaker();

        for _ in 0..4 {
            breaker.record_failure(now);
        }
        breaker.record_success();
        assert_eq!(breaker.snapshot().consecutive_failures, 0);

        for _ in 0..4 {
            breaker.record_failure(now);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_denies_until_recovery_then_goes_half_open() {
        let now = Utc::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(now);
        }

        assert!(!breaker.allow_request(now + Duration::seconds(119)));
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow_request(now + Duration::seconds(120)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let now = Utc::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(now);
        }
        assert!(breaker.allow_request(now + Duration::seconds(121)));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        assert_eq!(breaker.snapshot().open_until, None);
    }

    #[test]
    fn half_open_failure_reopens() {
        let now = Utc::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(now);
        }
        let later = now + Duration::seconds(121);
        assert!(breaker.allow_request(later));

        breaker.record_failure(later);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.snapshot().open_until,
            Some(later + Duration::seconds(120))
        );
    }

    #[test]
    fn reset_forces_closed_with_zeroed_counters() {
        let now = Utc::now();
        let mut breaker = breaker();
        for _ in 0..5 {
            breaker.record_failure(now);
        }

        breaker.reset();
        assert_eq!(breaker.snapshot(), &CircuitSnapshot::default());
    }
}
