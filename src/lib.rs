// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Delivery
//!
//! Reliable message delivery over RabbitMQ: confirmed publishing, topology
//! declaration, delayed retries through TTL queues, and consumers whose
//! handler outcomes are settled with the broker and kept alive by a registry.

mod otel;

#[cfg(test)]
mod testing;

pub mod acknowledgement;
pub mod backoff;
pub mod channel;
pub mod confirms;
pub mod consumer;
pub mod delivery;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod outcome;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod topology;
