// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A `QueueDefinition` describes one consumer queue: its declaration options,
//! the exchange it is bound to, the message type it carries, its retry policy
//! and whether structural failures go to the common error/unrouted queues.

use crate::{exchange::ExchangeDefinition, retry::RetrySettings};
use serde::Deserialize;

/// Default broker prefetch and handler concurrency per consumer
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Built either through the builder methods or deserialized from settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) message_type: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) retry: RetrySettings,
    pub(crate) use_common_error_queue: bool,
    pub(crate) use_common_unrouted_queue: bool,
    pub(crate) prefetch_count: u16,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition {
            name: String::new(),
            message_type: String::new(),
            durable: false,
            delete: false,
            exclusive: false,
            passive: false,
            no_wait: false,
            ttl: None,
            max_length: None,
            max_length_bytes: None,
            dlq_name: None,
            exchange: None,
            routing_keys: vec![],
            retry: RetrySettings::default(),
            use_common_error_queue: false,
            use_common_unrouted_queue: false,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and default settings.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type_name(&self) -> &str {
        &self.message_type
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.retry
    }

    /// Sets the message type carried by the queue.
    ///
    /// Used to name delayed-retry queues and the consumer span when a delivery
    /// carries no type property.
    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_type = message_type.to_owned();
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// Messages nacked or rejected without requeue end up there. The DLQ name
    /// is the main queue name with a "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Binds the queue to `exchange` with the given routing key.
    ///
    /// Can be called multiple times with the same exchange to add routing keys.
    pub fn bind(mut self, exchange: ExchangeDefinition, routing_key: &str) -> Self {
        self.exchange = Some(exchange);
        self.routing_keys.push(routing_key.to_owned());
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn use_common_error_queue(mut self) -> Self {
        self.use_common_error_queue = true;
        self
    }

    pub fn use_common_unrouted_queue(mut self) -> Self {
        self.use_common_unrouted_queue = true;
        self
    }

    /// Caps unacknowledged deliveries and concurrent handler executions.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }
}
