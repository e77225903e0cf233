// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Behaviour
//!
//! Turns the outcome of one delivery into the broker action that settles it.
//! Failures the queue's retry policy allows are republished as copies (to the
//! same queue, or to a delayed-retry queue) and the original is acked, since
//! the copy now carries the message. Structural failures are never retried:
//! they are moved to the common error or unrouted queue, or dropped, and the
//! original is always acked so it leaves the main queue. Anything else is
//! nacked or rejected without requeue and left to the broker's dead-lettering.
//!
//! Retry and routing failures are handled here; only a broker error while
//! settling the original delivery is returned to the caller.

use crate::{
    channel::BrokerChannel,
    delivery::DeliveryContext,
    errors::AmqpError,
    outcome::{Outcome, RejectReason},
    publisher::Publisher,
    queue::QueueDefinition,
    topology::TopologyProvider,
};
use lapin::types::ShortString;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// Broker action that settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Acked,
    Nacked { requeue: bool },
    Rejected { requeue: bool },
}

/// Result of a retry attempt that did not fail at the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retried { attempt: u32, delay: Duration },
    Disabled,
    Exhausted { attempts: u32 },
}

pub struct AcknowledgementBehaviour {
    channel: Arc<dyn BrokerChannel>,
    publisher: Arc<dyn Publisher>,
    topology: Arc<dyn TopologyProvider>,
    queue: Arc<QueueDefinition>,
}

impl AcknowledgementBehaviour {
    /// Creates the acknowledgement behaviour of one consumer queue.
    ///
    /// # Parameters
    /// * `channel` - Channel the original deliveries arrived on; acks go there
    /// * `publisher` - Confirmed publisher used for retries and moves
    /// * `topology` - Declares delayed-retry and common queues on demand
    /// * `queue` - The consumer queue with its retry settings and common-queue flags
    ///
    /// # Returns
    /// A new AcknowledgementBehaviour instance
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        publisher: Arc<dyn Publisher>,
        topology: Arc<dyn TopologyProvider>,
        queue: Arc<QueueDefinition>,
    ) -> Self {
        AcknowledgementBehaviour {
            channel,
            publisher,
            topology,
            queue,
        }
    }

    /// Settles `delivery` according to `outcome`.
    ///
    /// Retry and routing failures are logged and fall back to nack or reject;
    /// they never surface here.
    ///
    /// # Returns
    /// The broker action taken, or the error of the ack/nack/reject call itself
    pub async fn handle(
        &self,
        outcome: Outcome,
        delivery: &mut DeliveryContext,
    ) -> Result<AckAction, AmqpError> {
        match outcome {
            Outcome::Ack => self.ack(delivery).await,
            Outcome::Retry(delay) => {
                if self.retry_or_report(delivery, Some(delay)).await {
                    self.ack(delivery).await
                } else {
                    self.nack(delivery).await
                }
            }
            Outcome::Nack { requeue: true } => {
                if self.retry_or_report(delivery, None).await {
                    self.ack(delivery).await
                } else {
                    self.nack(delivery).await
                }
            }
            Outcome::Nack { requeue: false } => self.nack(delivery).await,
            Outcome::Reject { reason, error, .. } if reason.is_structural() => {
                self.route_structural(delivery, &reason, error.as_deref())
                    .await;
                self.ack(delivery).await
            }
            Outcome::Reject {
                reason: RejectReason::Unroutable,
                ..
            } => {
                self.route_unroutable(delivery).await;
                self.ack(delivery).await
            }
            Outcome::Reject { requeue: true, .. } => {
                if self.retry_or_report(delivery, None).await {
                    self.ack(delivery).await
                } else {
                    self.reject(delivery).await
                }
            }
            Outcome::Reject { .. } => self.reject(delivery).await,
        }
    }

    /// Attempts a retry; true when a copy was republished.
    async fn retry_or_report(&self, delivery: &mut DeliveryContext, explicit: Option<Duration>) -> bool {
        match self.try_retry(delivery, explicit).await {
            Ok(RetryDecision::Retried { .. }) => true,
            Ok(_) => false,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name(),
                    delivery_tag = delivery.delivery_tag(),
                    "could not retry message"
                );
                false
            }
        }
    }

    /// Republishes a copy of `delivery` for another attempt.
    ///
    /// Without an explicit delay the retry settings decide: disabled or
    /// exhausted policies stop here, otherwise the delay is computed for the
    /// next attempt. An explicit delay bypasses the enabled flag and the
    /// attempt limit.
    ///
    /// A zero delay, computed or explicit, republishes straight to the queue
    /// through the default exchange; an explicit `Retry(Duration::ZERO)` is
    /// treated as "retry immediately" rather than parked in a 0ms TTL queue.
    /// Any other delay goes through the delayed-retry queue with a
    /// per-message expiration.
    ///
    /// # Parameters
    /// * `delivery` - The delivery being retried; its retry headers are updated
    /// * `explicit` - The delay requested by the handler, if any
    ///
    /// # Returns
    /// What happened to the message, or the error that prevented the republish
    pub async fn try_retry(
        &self,
        delivery: &mut DeliveryContext,
        explicit: Option<Duration>,
    ) -> Result<RetryDecision, AmqpError> {
        let retry = &self.queue.retry;
        let attempts = delivery.retry_count();

        if explicit.is_none() {
            if !retry.is_enabled() {
                return Ok(RetryDecision::Disabled);
            }

            if retry.is_exhausted(attempts) {
                if retry.log_on_exhaustion {
                    warn!(
                        queue = self.queue.name(),
                        attempts,
                        delivery_tag = delivery.delivery_tag(),
                        "message exhausted retries after {} attempts",
                        attempts
                    );
                }
                return Ok(RetryDecision::Exhausted { attempts });
            }
        }

        let delay = explicit.unwrap_or_else(|| retry.delay_for(attempts.saturating_add(1)));

        let attempt = delivery.record_retry();
        let properties = delivery.outgoing_properties();

        if delay.is_zero() {
            self.publisher
                .send("", self.queue.name(), true, properties, delivery.payload())
                .await?;
        } else {
            let message_type = delivery
                .message_type()
                .unwrap_or(self.queue.message_type_name())
                .to_owned();

            let retry_queue = self
                .topology
                .declare_delayed_retry_queue(&self.queue, &message_type, delay)
                .await?;

            self.publisher
                .send(
                    "",
                    &retry_queue,
                    true,
                    properties.with_expiration(ShortString::from(delay.as_millis().to_string())),
                    delivery.payload(),
                )
                .await?;
        }

        if retry.log_on_retry {
            info!(
                queue = self.queue.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "message retried"
            );
        }

        Ok(RetryDecision::Retried { attempt, delay })
    }

    /// Moves an empty or undecodable message to the common error queue, or drops it.
    async fn route_structural(&self, delivery: &DeliveryContext, reason: &RejectReason, cause: Option<&str>) {
        if matches!(reason, RejectReason::UnsupportedFormat) {
            error!(
                queue = self.queue.name(),
                delivery_tag = delivery.delivery_tag(),
                error = cause.unwrap_or_default(),
                "unsupported message format"
            );
        }

        if !self.queue.use_common_error_queue {
            warn!(
                queue = self.queue.name(),
                reason = ?reason,
                "dropping message that cannot be processed"
            );
            return;
        }

        match self.move_to(delivery, self.topology.declare_common_error_queue().await).await {
            Ok(error_queue) => warn!(
                queue = self.queue.name(),
                error_queue = error_queue.as_str(),
                reason = ?reason,
                "message moved to common error queue"
            ),
            Err(err) => error!(
                error = err.to_string(),
                queue = self.queue.name(),
                "failure to move message to common error queue"
            ),
        }
    }

    async fn route_unroutable(&self, delivery: &DeliveryContext) {
        if !self.queue.use_common_unrouted_queue {
            warn!(queue = self.queue.name(), "dropping unroutable message");
            return;
        }

        match self.move_to(delivery, self.topology.declare_common_unrouted_queue().await).await {
            Ok(unrouted_queue) => warn!(
                queue = self.queue.name(),
                unrouted_queue = unrouted_queue.as_str(),
                "message moved to common unrouted queue"
            ),
            Err(err) => error!(
                error = err.to_string(),
                queue = self.queue.name(),
                "failure to move message to common unrouted queue"
            ),
        }
    }

    /// Republishes the message verbatim into `target`.
    async fn move_to(
        &self,
        delivery: &DeliveryContext,
        target: Result<String, AmqpError>,
    ) -> Result<String, AmqpError> {
        let target = target?;

        self.publisher
            .send(
                "",
                &target,
                true,
                delivery.properties().clone(),
                delivery.payload(),
            )
            .await?;

        Ok(target)
    }

    async fn ack(&self, delivery: &DeliveryContext) -> Result<AckAction, AmqpError> {
        self.channel.basic_ack(delivery.delivery_tag()).await?;
        Ok(AckAction::Acked)
    }

    async fn nack(&self, delivery: &DeliveryContext) -> Result<AckAction, AmqpError> {
        self.channel
            .basic_nack(delivery.delivery_tag(), false)
            .await?;
        Ok(AckAction::Nacked { requeue: false })
    }

    async fn reject(&self, delivery: &DeliveryContext) -> Result<AckAction, AmqpError> {
        self.channel
            .basic_reject(delivery.delivery_tag(), false)
            .await?;
        Ok(AckAction::Rejected { requeue: false })
    }
}
