//! Async retry with exponential backoff and jitter. Generalized from the
//! teacher's `retry_request`/`ErrorClassification` pair in sync form backed
//! by the `backoff` crate's stateful iterator; this version drives the
//! precise attempt-indexed formula `spec.md` §4.E/§8 invariant 5 requires,
//! so the `backoff` dependency is dropped (see DESIGN.md).
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::error::ErrorClassification;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
    #[error("circuit breaker open, not attempting")]
    BreakerOpen,
}

impl<E> ErrorClassification for RetryError<E> {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// Delay before attempt `n` (1-indexed; the first attempt, `n == 1`, has no
/// preceding delay). `n == 2` uses `initial_delay_ms`; each attempt after
/// that multiplies by `multiplier`, capped at `max_delay_ms`. When
/// `config.jitter` is set, uniform jitter in `[0, delay/2]` is added;
/// otherwise the capped base delay is returned exactly. See `spec.md` §4.E,
/// §8 invariant 5.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 2) as i32;
    let base = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = base.min(config.max_delay_ms as f64);
    if !config.jitter {
        return Duration::from_millis(capped.round() as u64);
    }
    let jitter = rand::thread_rng().gen_range(0.0..=(capped / 2.0));
    Duration::from_millis((capped + jitter).round() as u64)
}

/// Drives retries for a single logical operation against a single sink.
/// Consults the sink's [`CircuitBreaker`] before every attempt: if the
/// breaker denies the call, retrying stops immediately and the failure is
/// treated as terminal (non-retryable), per `spec.md` §4.F.
pub struct RetryManager<'a> {
    config: RetryConfig,
    breaker: &'a CircuitBreaker,
}

impl<'a> RetryManager<'a> {
    pub fn new(config: RetryConfig, breaker: &'a CircuitBreaker) -> Self {
        RetryManager { config, breaker }
    }

    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + ErrorClassification,
    {
        let mut attempt = 1;
        loop {
            if !self.breaker.allow() {
                return Err(RetryError::BreakerOpen);
            }

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(error) => {
                    self.breaker.record_failure(&error);

                    if !error.is_retryable() || attempt >= self.config.max_attempts {
                        debug!(attempt, retryable = error.is_retryable(), "giving up");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = delay_for_attempt(&self.config, attempt + 1);
                    info!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying after transient error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
