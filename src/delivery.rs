// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Context
//!
//! One inbound delivery as seen by handlers and by the acknowledgement
//! behaviour. The header map is the only part that changes after creation and
//! it is only ever appended to: the retry counter is bumped and, on the first
//! retry, the original exchange and routing key are snapshotted so a delayed
//! copy coming back through the default exchange can be processed with its
//! original binding context.

use lapin::{
    message::Delivery,
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Header carrying the number of retries a message went through
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the exchange a message was first published to
pub const AMQP_HEADERS_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Header carrying the routing key a message was first published with
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Header mirroring the correlation-id property, used for trace propagation
pub const AMQP_HEADERS_CORRELATION_ID: &str = "x-correlation-id";
/// Header used to match `basic.return` frames back to a pending publish
pub const AMQP_HEADERS_PUBLISH_TAG: &str = "x-publish-tag";

#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub(crate) payload: Vec<u8>,
    pub(crate) delivery_tag: u64,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) redelivered: bool,
    pub(crate) properties: AMQPProperties,
    pub(crate) headers: BTreeMap<ShortString, AMQPValue>,
}

impl From<Delivery> for DeliveryContext {
    fn from(delivery: Delivery) -> Self {
        DeliveryContext::new(
            delivery.delivery_tag,
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
            delivery.redelivered,
            delivery.properties,
            delivery.data,
        )
    }
}

impl DeliveryContext {
    /// Builds the context for a broker delivery.
    ///
    /// When the message carries original exchange/routing key headers, those
    /// replace the values the broker reported.
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: AMQPProperties,
        payload: Vec<u8>,
    ) -> Self {
        let headers = properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();

        let exchange = header_str(&headers, AMQP_HEADERS_ORIGINAL_EXCHANGE)
            .unwrap_or(exchange)
            .to_owned();
        let routing_key = header_str(&headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
            .unwrap_or(routing_key)
            .to_owned();

        DeliveryContext {
            payload,
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            headers,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    pub fn headers(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.headers
    }

    pub fn message_type(&self) -> Option<&str> {
        self.properties.kind().as_ref().map(|kind| kind.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    /// Correlation id from the AMQP property, falling back to the header copy.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str())
            .or_else(|| header_str(&self.headers, AMQP_HEADERS_CORRELATION_ID))
    }

    /// Number of retries this message already went through.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(AMQP_HEADERS_RETRY_COUNT)
            .and_then(header_u32)
            .unwrap_or_default()
    }

    pub fn original_exchange(&self) -> Option<&str> {
        header_str(&self.headers, AMQP_HEADERS_ORIGINAL_EXCHANGE)
    }

    pub fn original_routing_key(&self) -> Option<&str> {
        header_str(&self.headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
    }

    /// Records one more retry in the headers and returns the new count.
    ///
    /// The original exchange and routing key are only written when absent.
    pub(crate) fn record_retry(&mut self) -> u32 {
        let count = self.retry_count().saturating_add(1);

        self.headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(i64::from(count)),
        );

        if !self.headers.contains_key(AMQP_HEADERS_ORIGINAL_EXCHANGE) {
            self.headers.insert(
                ShortString::from(AMQP_HEADERS_ORIGINAL_EXCHANGE),
                AMQPValue::LongString(LongString::from(self.exchange.clone())),
            );
        }

        if !self.headers.contains_key(AMQP_HEADERS_ORIGINAL_ROUTING_KEY) {
            self.headers.insert(
                ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(self.routing_key.clone())),
            );
        }

        count
    }

    /// Properties for a republished copy: the delivery's own properties with the current headers.
    pub(crate) fn outgoing_properties(&self) -> AMQPProperties {
        self.properties
            .clone()
            .with_headers(FieldTable::from(self.headers.clone()))
    }
}

/// Reads a string header, accepting both AMQP string encodings.
pub(crate) fn header_str<'h>(
    headers: &'h BTreeMap<ShortString, AMQPValue>,
    key: &str,
) -> Option<&'h str> {
    match headers.get(key)? {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
        AMQPValue::ShortString(value) => Some(value.as_str()),
        _ => None,
    }
}

/// Reads a non-negative integer header whatever integer width the publisher used.
pub(crate) fn header_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u64::from(*v)),
        AMQPValue::LongUInt(v) => Some(u64::from(*v)),
        AMQPValue::ShortShortInt(v) => u64::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.parse().ok(),
        _ => None,
    }
}

pub(crate) fn header_u32(value: &AMQPValue) -> Option<u32> {
    header_u64(value).and_then(|v| u32::try_from(v).ok())
}
