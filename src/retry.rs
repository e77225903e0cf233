// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Settings
//!
//! Per-queue retry configuration. Loaded once with the queue definition and
//! shared read-only by every delivery of that queue.

use crate::backoff::BackoffPolicy;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub(crate) enabled: bool,
    /// Attempts allowed before a message is considered exhausted
    pub(crate) retry_count: u32,
    pub(crate) do_infinity_retries: bool,
    pub(crate) policy: BackoffPolicy,
    pub(crate) retry_delay_in_seconds: u64,
    pub(crate) retry_max_delay_in_seconds: u64,
    pub(crate) log_on_retry: bool,
    pub(crate) log_on_exhaustion: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            enabled: true,
            retry_count: 5,
            do_infinity_retries: false,
            policy: BackoffPolicy::Constant,
            retry_delay_in_seconds: 10,
            retry_max_delay_in_seconds: 3600,
            log_on_retry: true,
            log_on_exhaustion: true,
        }
    }
}

impl RetrySettings {
    /// Settings with retries switched off.
    pub fn disabled() -> Self {
        RetrySettings {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn infinite(mut self) -> Self {
        self.do_infinity_retries = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.retry_delay_in_seconds = delay.as_secs();
        self
    }

    pub fn max_delay(mut self, max: Duration) -> Self {
        self.retry_max_delay_in_seconds = max.as_secs();
        self
    }

    pub fn log_on_retry(mut self, enabled: bool) -> Self {
        self.log_on_retry = enabled;
        self
    }

    pub fn log_on_exhaustion(mut self, enabled: bool) -> Self {
        self.log_on_exhaustion = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_in_seconds)
    }

    pub fn max_delay_duration(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_in_seconds)
    }

    /// Whether a message that already went through `attempts` retries may not be retried again.
    ///
    /// The boundary is `attempts >= retry_count`: with a limit of 5 the
    /// attempts numbered 1 to 5 are retried and the sixth failure is final.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        !self.do_infinity_retries && attempts >= self.retry_count
    }

    /// Backoff delay for the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.policy.compute(self, attempt)
    }
}
