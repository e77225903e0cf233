// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! `TopologyProvider` declares broker-side resources on demand: a consumer's
//! queue with its exchange and bindings, delayed-retry queues, delayed-publish
//! queues and the common error/unrouted queues.
//!
//! Delays are emulated with a TTL queue that dead-letters into the real
//! destination: a message parked in `orders-retry-10000ms` expires after ten
//! seconds and the broker moves it back into `orders` through the default
//! exchange.

use crate::{channel::BrokerChannel, errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortString},
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Constant for the argument deleting an unused queue after the given milliseconds
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// How long an idle delay queue outlives its message TTL
const DELAY_QUEUE_GRACE_MS: u64 = 60_000;

/// Publishing does not renew an `x-expires` lease, so delay queues are
/// re-declared halfway through their grace period.
const DELAY_QUEUE_REFRESH_MS: u64 = DELAY_QUEUE_GRACE_MS / 2;

/// Declares broker-side topology on demand. Every declaration is idempotent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Declares the consumer queue, its DLQ, its exchange and bindings.
    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    /// Declares the queue holding retries of `message_type` for `delay`; returns its name.
    async fn declare_delayed_retry_queue(
        &self,
        queue: &QueueDefinition,
        message_type: &str,
        delay: Duration,
    ) -> Result<String, AmqpError>;

    /// Declares the queue holding messages for `exchange`/`routing_key` for `delay`; returns its name.
    async fn declare_delayed_publish_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        delay: Duration,
    ) -> Result<String, AmqpError>;

    async fn declare_common_error_queue(&self) -> Result<String, AmqpError>;

    async fn declare_common_unrouted_queue(&self) -> Result<String, AmqpError>;
}

/// Names and flags for the topology shared by all queues.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologySettings {
    pub error_queue: String,
    pub unrouted_queue: String,
    /// Durability of the common and delay queues
    pub durable: bool,
}

impl Default for TopologySettings {
    fn default() -> Self {
        TopologySettings {
            error_queue: "errors".to_owned(),
            unrouted_queue: "unrouted".to_owned(),
            durable: true,
        }
    }
}

/// RabbitMQ implementation of the TopologyProvider trait.
///
/// Declared names are cached. Entries for queues carrying an `x-expires`
/// lease go stale before the lease runs out, so the next use re-declares the
/// queue and renews it.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    settings: TopologySettings,
    /// Queue name to the instant its declaration must be renewed; `None` never expires
    declared: Mutex<HashMap<String, Option<Instant>>>,
}

impl AmqpTopology {
    /// Creates a new AmqpTopology.
    ///
    /// # Parameters
    /// * `channel` - The channel declarations are issued on
    /// * `settings` - Names of the common queues and durability of shared queues
    ///
    /// # Returns
    /// A new AmqpTopology instance with an empty declaration cache
    pub fn new(channel: Arc<dyn BrokerChannel>, settings: TopologySettings) -> Arc<AmqpTopology> {
        Arc::new(AmqpTopology {
            channel,
            settings,
            declared: Mutex::new(HashMap::new()),
        })
    }

    fn is_declared(&self, name: &str) -> bool {
        let Ok(declared) = self.declared.lock() else {
            return false;
        };

        match declared.get(name) {
            Some(Some(renew_at)) => Instant::now() < *renew_at,
            Some(None) => true,
            None => false,
        }
    }

    fn mark_declared(&self, name: &str, renew_after: Option<Duration>) {
        let renew_at = renew_after.and_then(|after| Instant::now().checked_add(after));
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(name.to_owned(), renew_at);
        }
    }

    fn shared_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.settings.durable,
            ..Default::default()
        }
    }

    /// Declares a TTL queue dead-lettering into `exchange`/`routing_key`.
    async fn declare_delay_queue(
        &self,
        name: &str,
        exchange: &str,
        routing_key: &str,
        delay: Duration,
    ) -> Result<(), AmqpError> {
        if self.is_declared(name) {
            return Ok(());
        }

        let ttl = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(LongLongInt::try_from(ttl).unwrap_or(LongLongInt::MAX)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongLongInt(
                LongLongInt::try_from(ttl.saturating_add(DELAY_QUEUE_GRACE_MS))
                    .unwrap_or(LongLongInt::MAX),
            ),
        );

        self.channel
            .queue_declare(name, self.shared_options(), args)
            .await?;

        debug!(queue = name, ttl_ms = ttl, "delay queue declared");
        self.mark_declared(
            name,
            Some(Duration::from_millis(ttl.saturating_add(DELAY_QUEUE_REFRESH_MS))),
        );

        Ok(())
    }

    async fn declare_common_queue(&self, name: &str) -> Result<String, AmqpError> {
        if !self.is_declared(name) {
            self.channel
                .queue_declare(name, self.shared_options(), FieldTable::default())
                .await?;
            self.mark_declared(name, None);
        }

        Ok(name.to_owned())
    }

    /// Declares the DLQ of `def` and points the main queue's dead-lettering at it.
    async fn declare_dlq(&self, def: &QueueDefinition, dlq_name: &str) -> Result<FieldTable, AmqpError> {
        self.channel
            .queue_declare(
                dlq_name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await?;

        let mut queue_args = FieldTable::default();
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dlq_name)),
        );

        Ok(queue_args)
    }
}

#[async_trait]
impl TopologyProvider for AmqpTopology {
    /// Declares, in order: the exchange, the DLQ, the queue, then the bindings.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if let Some(exchange) = &def.exchange {
            self.channel.exchange_declare(exchange).await?;
        }

        let mut queue_args = match &def.dlq_name {
            Some(dlq_name) => self.declare_dlq(def, dlq_name).await?,
            None => FieldTable::default(),
        };

        if let Some(ttl) = def.ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max_length) = def.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }

        if let Some(max_length_bytes) = def.max_length_bytes {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_length_bytes)),
            );
        }

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                queue_args,
            )
            .await?;

        if let Some(exchange) = &def.exchange {
            for routing_key in &def.routing_keys {
                self.channel
                    .queue_bind(&def.name, exchange.name(), routing_key)
                    .await?;
            }
        }

        debug!("queue: {} was bounded", def.name);

        Ok(())
    }

    async fn declare_delayed_retry_queue(
        &self,
        queue: &QueueDefinition,
        message_type: &str,
        delay: Duration,
    ) -> Result<String, AmqpError> {
        let name = if message_type.is_empty() {
            format!("{}-retry-{}ms", queue.name, delay.as_millis())
        } else {
            format!("{}-{}-retry-{}ms", queue.name, message_type, delay.as_millis())
        };

        self.declare_delay_queue(&name, "", &queue.name, delay)
            .await?;

        Ok(name)
    }

    async fn declare_delayed_publish_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        delay: Duration,
    ) -> Result<String, AmqpError> {
        let name = format!("{}.{}-delay-{}ms", exchange, routing_key, delay.as_millis());

        self.declare_delay_queue(&name, exchange, routing_key, delay)
            .await?;

        Ok(name)
    }

    async fn declare_common_error_queue(&self) -> Result<String, AmqpError> {
        self.declare_common_queue(&self.settings.error_queue).await
    }

    async fn declare_common_unrouted_queue(&self) -> Result<String, AmqpError> {
        self.declare_common_queue(&self.settings.unrouted_queue).await
    }
}
