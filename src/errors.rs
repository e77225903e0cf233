// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Delivery Guarantees
//!
//! `AmqpError` covers every broker-facing operation of the library: connection,
//! channel, topology declaration, publishing, acknowledgement and consumption.
//! `ConfirmError` is narrower: it is the failure half of a publish completion
//! handle and tells the caller why a message was not durably accepted.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker did not confirm a publish
    #[error(transparent)]
    Confirmation(#[from] ConfirmError),

    /// Error encoding or decoding a payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting a consumer
    #[error("failure to start consumer `{0}`")]
    ConsumerStartError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Why a tracked publish was not confirmed by the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("not acknowledged by broker")]
    NotAcknowledged,

    #[error("returned by broker: {code}-{text}")]
    Returned { code: u16, text: String },

    #[error("not confirmed within the channel's lifetime: {0}")]
    ChannelShutdown(String),

    #[error("not confirmed within {0:?}")]
    Timeout(Duration),

    /// The completion slot was dropped without being resolved
    #[error("confirmation cancelled")]
    Cancelled,
}
