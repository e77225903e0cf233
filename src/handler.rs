// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers and Middleware
//!
//! A `Handler` turns one delivery into an `Outcome`. Cross-cutting concerns
//! (deduplication, auditing, tracing enrichment) are `Middleware`s: each one
//! receives the delivery plus a `Next` and decides whether to forward to the
//! rest of the chain or to answer on its own. A `Pipeline` is the ordered list
//! of middlewares composed with the handler once, when the consumer is built.

use crate::{
    delivery::DeliveryContext,
    outcome::Outcome,
    serializer::{JsonSerializer, Serializer},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc};
use tracing::error;

#[cfg(test)]
use mockall::automock;

/// Processes raw deliveries.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &DeliveryContext) -> Outcome;
}

/// Processes decoded messages of type `M`.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn process(&self, ctx: &Context, message: M, delivery: &DeliveryContext) -> Outcome;
}

/// Adapts a `MessageHandler<M>` into a `Handler` by decoding the payload first.
///
/// Empty payloads and payloads the serializer cannot decode never reach the
/// inner handler; they become structural rejections.
pub struct TypedHandler<M, H, S = JsonSerializer> {
    handler: H,
    serializer: S,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> TypedHandler<M, H, JsonSerializer> {
    pub fn new(handler: H) -> Self {
        TypedHandler::with_serializer(handler, JsonSerializer)
    }
}

impl<M, H, S> TypedHandler<M, H, S> {
    pub fn with_serializer(handler: H, serializer: S) -> Self {
        TypedHandler {
            handler,
            serializer,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, H, S> Handler for TypedHandler<M, H, S>
where
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M>,
    S: Serializer,
{
    async fn handle(&self, ctx: &Context, delivery: &DeliveryContext) -> Outcome {
        if delivery.payload().is_empty() {
            return Outcome::empty_body();
        }

        match self.serializer.decode::<M>(delivery.payload()) {
            Ok(message) => self.handler.process(ctx, message, delivery).await,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = delivery.delivery_tag(),
                    "unsupported message format"
                );
                Outcome::unsupported_format(err)
            }
        }
    }
}

/// One step of the processing chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &DeliveryContext, next: Next<'_>) -> Outcome;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    handler: &'a dyn Handler,
    chain: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub async fn run(self, ctx: &Context, delivery: &DeliveryContext) -> Outcome {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        ctx,
                        delivery,
                        Next {
                            handler: self.handler,
                            chain: rest,
                        },
                    )
                    .await
            }
            None => self.handler.handle(ctx, delivery).await,
        }
    }
}

/// Middlewares in registration order, then the handler.
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Pipeline {
            middlewares: vec![],
            handler,
        }
    }

    /// Appends a middleware; the first one added runs first.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub async fn run(&self, ctx: &Context, delivery: &DeliveryContext) -> Outcome {
        Next {
            handler: self.handler.as_ref(),
            chain: &self.middlewares,
        }
        .run(ctx, delivery)
        .await
    }
}
