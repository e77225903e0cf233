// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Owns every consumer of the process. `start` activates all of them at once
//! and then arms a liveness timer: after a grace period, and on every check
//! interval afterwards, consumers that have gone inactive are restarted.

use crate::{consumer::Consumer, errors::AmqpError};
use futures_util::future::join_all;
use serde::Deserialize;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub grace_period_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            grace_period_secs: 120,
            check_interval_secs: 60,
        }
    }
}

impl RegistrySettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Never zero; `tokio::time::interval` rejects a zero period.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: Vec<Arc<Consumer>>,
    settings: RegistrySettings,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    ///
    /// # Parameters
    /// * `settings` - Grace period and interval of the liveness sweep
    pub fn new(settings: RegistrySettings) -> Self {
        ConsumerRegistry {
            consumers: vec![],
            settings,
            timer: Mutex::new(None),
        }
    }

    /// Registers a consumer; it is started by the next `start` or sweep.
    pub fn add(&mut self, consumer: Arc<Consumer>) {
        self.consumers.push(consumer);
    }

    pub fn consumers(&self) -> &[Arc<Consumer>] {
        &self.consumers
    }

    /// Starts every inactive consumer concurrently and arms the liveness timer.
    ///
    /// # Returns
    /// `ConsumerStartError` naming the queues that failed to start. The timer
    /// is armed either way, so those consumers are retried on the next sweep.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let failed = start_inactive(&self.consumers).await;
        self.arm_timer();

        if failed.is_empty() {
            info!(consumers = self.consumers.len(), "consumer registry started");
            Ok(())
        } else {
            Err(AmqpError::ConsumerStartError(failed.join(", ")))
        }
    }

    /// Disarms the liveness timer. Running consumers are left untouched.
    pub fn stop(&self) {
        if let Some(timer) = self.lock_timer().take() {
            timer.abort();
            debug!("consumer liveness timer stopped");
        }
    }

    fn arm_timer(&self) {
        let mut timer = self.lock_timer();
        if timer.is_some() {
            return;
        }

        let consumers = self.consumers.clone();
        let grace = self.settings.grace_period();
        let period = self.settings.check_interval();

        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;

                let consumers = consumers.clone();
                tokio::spawn(async move {
                    start_inactive(&consumers).await;
                });
            }
        }));
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConsumerRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns the names of the queues whose consumer failed to start.
async fn start_inactive(consumers: &[Arc<Consumer>]) -> Vec<String> {
    let pending = consumers.iter().filter(|consumer| !consumer.is_active());

    let results = join_all(pending.map(|consumer| async move {
        consumer
            .start()
            .await
            .map_err(|err| (consumer.queue().name().to_owned(), err))
    }))
    .await;

    results
        .into_iter()
        .filter_map(|result| match result {
            Ok(()) => None,
            Err((queue, err)) => {
                error!(queue = queue.as_str(), error = err.to_string(), "consumer restart failed");
                Some(queue)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::tests::{acking_handler, broker, wait_until},
        handler::Pipeline,
        queue::QueueDefinition,
        testing::FakeChannel,
    };

    fn registry_over(channel: &Arc<FakeChannel>, queues: &[&str]) -> ConsumerRegistry {
        let broker = broker(channel);
        let mut registry = ConsumerRegistry::new(RegistrySettings::default());
        for queue in queues {
            registry.add(Consumer::new(
                &broker,
                QueueDefinition::new(queue),
                Pipeline::new(acking_handler()),
            ));
        }
        registry
    }

    #[test]
    fn settings_defaults() {
        let settings = RegistrySettings::default();

        assert_eq!(settings.grace_period(), Duration::from_secs(120));
        assert_eq!(settings.check_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn start_activates_every_consumer() {
        let channel = FakeChannel::starting_at(1);
        let registry = registry_over(&channel, &["orders", "invoices"]);

        registry.start().await.unwrap();

        assert!(registry.consumers().iter().all(|c| c.is_active()));
        assert_eq!(channel.consume_calls(), 2);
        registry.stop();
    }

    #[tokio::test]
    async fn start_reports_failed_queues() {
        let channel = FakeChannel::starting_at(1);
        channel.fail_consumes(true);
        let registry = registry_over(&channel, &["orders"]);

        let result = registry.start().await;

        assert_eq!(result, Err(AmqpError::ConsumerStartError("orders".to_owned())));
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_consumers_restart_after_grace_period() {
        let channel = FakeChannel::starting_at(1);
        let registry = registry_over(&channel, &["orders"]);
        registry.start().await.unwrap();

        channel.cancel_consumers();
        let consumer = registry.consumers()[0].clone();
        wait_until(|| !consumer.is_active()).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(channel.consume_calls(), 1);

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(channel.consume_calls(), 2);
        assert!(consumer.is_active());
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_retrying_failed_starts() {
        let channel = FakeChannel::starting_at(1);
        channel.fail_consumes(true);
        let registry = registry_over(&channel, &["orders"]);
        assert!(registry.start().await.is_err());

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(channel.consume_calls(), 2);

        channel.fail_consumes(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(channel.consume_calls(), 3);
        assert!(registry.consumers()[0].is_active());
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disarms_liveness_timer() {
        let channel = FakeChannel::starting_at(1);
        let registry = registry_over(&channel, &["orders"]);
        registry.start().await.unwrap();
        registry.stop();

        channel.cancel_consumers();
        let consumer = registry.consumers()[0].clone();
        wait_until(|| !consumer.is_active()).await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(channel.consume_calls(), 1);
        assert!(!consumer.is_active());
    }
}
