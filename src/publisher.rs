// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! `Publisher` is the low-level "publish and wait for the broker's verdict"
//! seam; `ConfirmTracker` implements it. `RabbitMQPublisher` sits on top and
//! builds application messages: message id, content and message type,
//! correlation id, user headers, OpenTelemetry context propagation and delayed
//! delivery through a TTL queue.

use crate::{
    delivery::AMQP_HEADERS_CORRELATION_ID,
    errors::AmqpError,
    otel,
    serializer::{JsonSerializer, Serializer},
    topology::TopologyProvider,
};
use async_trait::async_trait;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes one message and waits until the broker accepted or refused it.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: AMQPProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError>;
}

/// Typed header values accepted on outgoing messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
    LongUint(u32),
    LongLongUint(u64),
}

/// An application message to publish.
#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub correlation_id: Option<String>,
    pub data: Vec<u8>,
    pub headers: Option<HashMap<String, HeaderValues>>,
    /// Deliver only after this delay
    pub delay: Option<Duration>,
}

impl PublishMessage {
    pub fn new(to: &str, key: &str, data: Vec<u8>) -> Self {
        PublishMessage {
            to: to.to_owned(),
            key: Some(key.to_owned()),
            data,
            ..Default::default()
        }
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Publishes application messages through a confirming `Publisher`.
pub struct RabbitMQPublisher<S = JsonSerializer> {
    publisher: Arc<dyn Publisher>,
    topology: Arc<dyn TopologyProvider>,
    serializer: S,
    mandatory: bool,
}

impl RabbitMQPublisher<JsonSerializer> {
    /// Creates a new RabbitMQ publisher encoding messages as JSON.
    ///
    /// # Parameters
    /// * `publisher` - The confirming publisher, usually a `ConfirmTracker`
    /// * `topology` - Declares delayed-publish queues on demand
    ///
    /// # Returns
    /// A publisher sending every message as mandatory
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topology: Arc<dyn TopologyProvider>,
    ) -> RabbitMQPublisher<JsonSerializer> {
        RabbitMQPublisher::with_serializer(publisher, topology, JsonSerializer)
    }
}

impl<S: Serializer> RabbitMQPublisher<S> {
    pub fn with_serializer(
        publisher: Arc<dyn Publisher>,
        topology: Arc<dyn TopologyProvider>,
        serializer: S,
    ) -> RabbitMQPublisher<S> {
        RabbitMQPublisher {
            publisher,
            topology,
            serializer,
            mandatory: true,
        }
    }

    /// Lets unroutable messages be dropped silently instead of failing the publish.
    pub fn not_mandatory(mut self) -> Self {
        self.mandatory = false;
        self
    }

    /// Serializes `message` and publishes it.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `to` - Target exchange
    /// * `key` - Routing key
    /// * `msg_type` - Value of the `type` property
    /// * `message` - The message to encode
    ///
    /// # Returns
    /// Ok once the broker confirmed the message, or the encoding/publish/confirmation error
    pub async fn publish_message<T>(
        &self,
        ctx: &Context,
        to: &str,
        key: &str,
        msg_type: &str,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let data = self.serializer.encode(message)?;
        self.publish(ctx, &PublishMessage::new(to, key, data).msg_type(msg_type))
            .await
    }

    /// Publishes a message and waits for its confirmation.
    ///
    /// A message with a delay is parked in a delayed-publish queue which
    /// dead-letters it into the target exchange once the delay elapsed.
    pub async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        otel::inject(ctx, &mut btree);

        if let Some(headers) = &infos.headers {
            self.btree_map(headers, &mut btree);
        }

        let correlation_id = infos
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        btree.insert(
            ShortString::from(AMQP_HEADERS_CORRELATION_ID),
            AMQPValue::LongString(LongString::from(correlation_id.clone())),
        );

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.serializer.content_type()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_correlation_id(ShortString::from(correlation_id))
            .with_headers(FieldTable::from(btree));

        if let Some(msg_type) = &infos.msg_type {
            properties = properties.with_type(ShortString::from(msg_type.clone()));
        }

        let key = infos.key.clone().unwrap_or_default();

        let result = match infos.delay {
            Some(delay) if !delay.is_zero() => {
                let queue = self
                    .topology
                    .declare_delayed_publish_queue(&infos.to, &key, delay)
                    .await?;

                debug!(queue = queue.as_str(), delay_ms = delay.as_millis() as u64, "publishing delayed message");

                self.publisher
                    .send(
                        "",
                        &queue,
                        self.mandatory,
                        properties.with_expiration(ShortString::from(
                            delay.as_millis().to_string(),
                        )),
                        &infos.data,
                    )
                    .await
            }
            _ => {
                self.publisher
                    .send(&infos.to, &key, self.mandatory, properties, &infos.data)
                    .await
            }
        };

        if let Err(err) = &result {
            error!(error = err.to_string(), exchange = infos.to.as_str(), "error publishing message");
        }

        result
    }

    /// Converts user header values into AMQP values.
    fn btree_map(
        &self,
        hash_map: &HashMap<String, HeaderValues>,
        btree: &mut BTreeMap<ShortString, AMQPValue>,
    ) {
        for (key, value) in hash_map {
            let amqp_value = match value.clone() {
                HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
                HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
                HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
                HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
                HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
                HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
                HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
                HeaderValues::LongLongUint(v) => match i64::try_from(v) {
                    Ok(v) => AMQPValue::LongLongInt(v),
                    Err(_) => AMQPValue::LongString(LongString::from(v.to_string())),
                },
            };

            btree.insert(ShortString::from(key.clone()), amqp_value);
        }
    }
}
