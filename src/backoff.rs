// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Policies
//!
//! Delay functions used to space out retries. Each policy is a pure function of
//! the retry settings and the 1-based attempt number.

use crate::retry::RetrySettings;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Retry immediately
    Zero,
    /// Always wait the base delay
    #[default]
    Constant,
    /// `attempt x delay`, clamped to the max delay
    Linear,
    /// `2^attempt` seconds, clamped to the max delay
    Exponential,
}

impl BackoffPolicy {
    pub fn compute(&self, settings: &RetrySettings, attempt: u32) -> Duration {
        let max = settings.max_delay_duration();

        match self {
            BackoffPolicy::Zero => Duration::ZERO,
            BackoffPolicy::Constant => settings.base_delay(),
            BackoffPolicy::Linear => match settings.base_delay().checked_mul(attempt) {
                Some(delay) => delay.min(max),
                None => max,
            },
            BackoffPolicy::Exponential => 2u64
                .checked_pow(attempt)
                .map(Duration::from_secs)
                .unwrap_or(max)
                .min(max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(policy: BackoffPolicy, delay: u64, max: u64) -> RetrySettings {
        RetrySettings::default()
            .policy(policy)
            .delay(Duration::from_secs(delay))
            .max_delay(Duration::from_secs(max))
    }

    #[test]
    fn zero_and_constant() {
        let zero = settings(BackoffPolicy::Zero, 10, 3600);
        assert_eq!(zero.delay_for(1), Duration::ZERO);
        assert_eq!(zero.delay_for(40), Duration::ZERO);

        let constant = settings(BackoffPolicy::Constant, 15, 3600);
        assert_eq!(constant.delay_for(1), Duration::from_secs(15));
        assert_eq!(constant.delay_for(9), Duration::from_secs(15));
    }

    #[test]
    fn exponential_is_clamped_to_max_delay() {
        let exp = settings(BackoffPolicy::Exponential, 0, 3600);

        assert_eq!(exp.delay_for(1), Duration::from_secs(2));
        assert_eq!(exp.delay_for(10), Duration::from_secs(1024));
        assert_eq!(exp.delay_for(12), Duration::from_secs(3600));
        assert_eq!(exp.delay_for(200), Duration::from_secs(3600));
    }

    #[test]
    fn linear_grows_then_clamps() {
        let linear = settings(BackoffPolicy::Linear, 10, 3600);

        assert_eq!(linear.delay_for(1), Duration::from_secs(10));
        assert_eq!(linear.delay_for(5), Duration::from_secs(50));
        assert_eq!(linear.delay_for(361), Duration::from_secs(3600));
        assert_eq!(linear.delay_for(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn linear_overflow_falls_back_to_max_delay() {
        let huge = settings(BackoffPolicy::Linear, u64::MAX / 2, 3600);

        assert_eq!(huge.delay_for(3), Duration::from_secs(3600));
    }
}
