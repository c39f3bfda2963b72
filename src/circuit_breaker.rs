//! Per-sink circuit breaker. See `spec.md` §4.F. Not present anywhere in the
//! teacher or the rest of the pack; built from scratch following the
//! teacher's preference for an explicit state enum guarded by a single
//! `parking_lot::Mutex` whenever several fields must change atomically
//! together, rather than juggling independent atomics.
use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A point-in-time snapshot of a breaker, cheap to clone for metrics/health
/// reporting.
#[derive(Clone, Debug)]
pub struct SinkHealth {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
    pub last_change_at: Instant,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_error: Option<String>,
    last_change_at: Instant,
    /// Failure/success timestamps within `window_ms`, used for the
    /// failure-rate trip in addition to the simple consecutive-failure trip.
    window: VecDeque<(Instant, bool)>,
    half_open_probes_in_flight: u32,
}

/// Tracks whether a sink is healthy enough to receive traffic. `Closed`
/// passes everything through; `Open` rejects everything until `reset_ms`
/// elapses; `HalfOpen` allows a bounded number of probe calls through to
/// decide whether to close again.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_error: None,
                last_change_at: Instant::now(),
                window: VecDeque::new(),
                half_open_probes_in_flight: 0,
            }),
        }
    }

    /// Returns `true` if a call should be attempted right now. Transitions
    /// `Open` → `HalfOpen` once `reset_ms` has elapsed, admitting up to
    /// `half_open_max_probes` concurrent probes.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.last_change_at.elapsed() >= Duration::from_millis(self.config.reset_ms) {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_change_at = Instant::now();
                    inner.half_open_probes_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes_in_flight < self.config.half_open_max_probes {
                    inner.half_open_probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;
        push_window(&mut inner.window, self.config.window_ms, true);

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.last_change_at = Instant::now();
                inner.half_open_probes_in_flight = 0;
            }
            BreakerState::Open => unreachable!("allow() gates calls while Open"),
            BreakerState::Closed => {}
        }
    }

    pub fn record_failure(&self, error: impl std::fmt::Display) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.last_error = Some(error.to_string());
        push_window(&mut inner.window, self.config.window_ms, false);

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_change_at = Instant::now();
                inner.half_open_probes_in_flight = 0;
            }
            BreakerState::Closed => {
                let failure_rate_tripped = window_failure_rate(&inner.window) >= 0.5
                    && inner.window.len() >= self.config.failure_threshold as usize;
                if inner.consecutive_failures >= self.config.failure_threshold || failure_rate_tripped {
                    inner.state = BreakerState::Open;
                    inner.last_change_at = Instant::now();
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn health(&self) -> SinkHealth {
        let inner = self.inner.lock();
        SinkHealth {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_error: inner.last_error.clone(),
            last_change_at: inner.last_change_at,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

fn push_window(window: &mut VecDeque<(Instant, bool)>, window_ms: u64, success: bool) {
    let now = Instant::now();
    window.push_back((now, success));
    let horizon = Duration::from_millis(window_ms);
    while let Some((ts, _)) = window.front() {
        if now.duration_since(*ts) > horizon {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn window_failure_rate(window: &VecDeque<(Instant, bool)>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window.iter().filter(|(_, success)| !success).count();
    failures as f64 / window.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_ms: 20,
            half_open_max_probes: 1,
            window_ms: 60_000,
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record_failure("boom");
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn half_opens_after_reset_then_closes_on_success() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            breaker.allow();
            breaker.record_failure("boom");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            breaker.allow();
            breaker.record_failure("boom");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow());
        breaker.record_failure("still broken");
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn closed_breaker_survives_occasional_failures_below_threshold() {
        let breaker = CircuitBreaker::new("test", config());
        breaker.record_failure("blip");
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
