//! Adaptive retry policy for network fetches

use std::time::{Duration, Instant};

use crate::core::config::RetryConfig;
use crate::net::http::HttpStatus;

/// Per-worker retry state
///
/// Each failure grows the delay by `backoff_factor` between
/// `min_delay` and `max_delay`. A server `Retry-After` overrides the computed
/// delay for that attempt. Non-retryable statuses and exhausting
/// `max_retries` stop retries until the next success.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    min_delay: Duration,
    max_delay: Duration,
    backoff_factor: f32,
    max_retries: u32,

    delay: Duration,
    retry_count: u32,
    should_retry: bool,
    retry_at: Option<Instant>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let min_delay = Duration::from_secs_f32(config.min_delay_secs.max(0.0));
        Self {
            min_delay,
            max_delay: Duration::from_secs_f32(config.max_delay_secs.max(config.min_delay_secs).max(0.0)),
            backoff_factor: config.backoff_factor,
            max_retries: config.max_retries,
            delay: min_delay,
            retry_count: 0,
            should_retry: true,
            retry_at: None,
        }
    }

    /// Reset after a successful attempt
    pub fn on_success(&mut self) {
        self.delay = self.min_delay;
        self.retry_count = 0;
        self.should_retry = true;
        self.retry_at = None;
    }

    /// Record a failed attempt
    pub fn on_failure(&mut self, status: &HttpStatus, retry_after: Option<Duration>, now: Instant) {
        if !self.should_retry {
            log::debug!("retry policy already exhausted, ignoring {}", status);
            return;
        }

        if self.retry_count > 0 {
            self.delay = self
                .delay
                .mul_f32(self.backoff_factor)
                .clamp(self.min_delay, self.max_delay);
        }
        let wait = retry_after.unwrap_or(self.delay);

        if self.retry_count >= self.max_retries {
            log::debug!("too many retries ({}), giving up", self.retry_count);
            self.should_retry = false;
        } else if !status.is_retryable() {
            log::debug!("non-retryable failure {}", status);
            self.should_retry = false;
        } else {
            self.retry_count += 1;
            self.retry_at = Some(now + wait);
            log::debug!("retry {} of {} in {:?}", self.retry_count, self.max_retries, wait);
        }
    }

    /// Whether to retry, and how long until the retry may go out
    pub fn should_retry(&self, now: Instant) -> (bool, Duration) {
        if !self.should_retry {
            return (false, Duration::MAX);
        }
        if self.retry_count == 0 {
            return (true, Duration::ZERO);
        }
        let wait = self
            .retry_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));
        (true, wait)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}
