// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A `Consumer` binds one handler pipeline to one queue. Starting it declares
//! the queue's topology and subscribes; every delivery then runs through the
//! pipeline inside a consumer span, and the outcome is settled by the queue's
//! acknowledgement behaviour.
//!
//! State moves `Inactive -> Starting -> Active` on start and back to
//! `Inactive` when the broker ends the subscription (cancel, channel or
//! connection loss). The registry's liveness sweep restarts inactive
//! consumers.

use crate::{
    acknowledgement::AcknowledgementBehaviour,
    channel::{new_amqp_channel, BrokerChannel, ConnectionSettings, DeliveryStream, LapinChannel},
    confirms::ConfirmTracker,
    delivery::DeliveryContext,
    errors::AmqpError,
    handler::Pipeline,
    otel,
    publisher::Publisher,
    queue::QueueDefinition,
    topology::{AmqpTopology, TopologyProvider, TopologySettings},
};
use futures_util::StreamExt;
use lapin::Connection;
use opentelemetry::trace::{Status, TraceContextExt};
use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Broker collaborators shared by every consumer of a process.
#[derive(Clone)]
pub struct BrokerContext {
    pub channel: Arc<dyn BrokerChannel>,
    pub publisher: Arc<dyn Publisher>,
    pub topology: Arc<dyn TopologyProvider>,
}

impl BrokerContext {
    /// Connects to the broker and wires the production collaborators.
    ///
    /// The channel is put in confirm mode, its confirmation feed is handed to a
    /// `ConfirmTracker` using the settings' confirm timeout, and the tracker
    /// becomes the publisher.
    ///
    /// # Parameters
    /// * `settings` - Connection parameters and publish confirm timeout
    /// * `topology` - Names of the common error and unrouted queues
    ///
    /// # Returns
    /// The context and the connection, which must be kept alive while the
    /// context is in use
    pub async fn connect(
        settings: &ConnectionSettings,
        topology: TopologySettings,
    ) -> Result<(BrokerContext, Arc<Connection>), AmqpError> {
        let (connection, channel) = new_amqp_channel(settings).await?;
        let (channel, events) = LapinChannel::new(channel).await?;

        let tracker = ConfirmTracker::from_settings(channel.clone(), settings);
        tracker.listen(events);

        let context = BrokerContext {
            topology: AmqpTopology::new(channel.clone(), topology),
            publisher: tracker,
            channel,
        };

        Ok((context, connection))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Inactive,
    Starting,
    Active,
}

pub struct Consumer {
    tag: String,
    queue: Arc<QueueDefinition>,
    channel: Arc<dyn BrokerChannel>,
    topology: Arc<dyn TopologyProvider>,
    pipeline: Pipeline,
    behaviour: AcknowledgementBehaviour,
    state: Mutex<ConsumerState>,
    in_flight: Arc<Semaphore>,
}

impl Consumer {
    /// Creates an inactive consumer.
    ///
    /// # Parameters
    /// * `broker` - Channel, publisher and topology shared by the process
    /// * `queue` - The queue to consume, with its retry settings and prefetch
    /// * `pipeline` - Middlewares and handler every delivery runs through
    ///
    /// # Returns
    /// The consumer, ready to be started directly or through a registry
    pub fn new(broker: &BrokerContext, queue: QueueDefinition, pipeline: Pipeline) -> Arc<Consumer> {
        let queue = Arc::new(queue);
        let permits = usize::from(queue.prefetch_count.max(1));

        Arc::new(Consumer {
            tag: format!("{}.{}", queue.name, Uuid::new_v4()),
            behaviour: AcknowledgementBehaviour::new(
                broker.channel.clone(),
                broker.publisher.clone(),
                broker.topology.clone(),
                queue.clone(),
            ),
            channel: broker.channel.clone(),
            topology: broker.topology.clone(),
            queue,
            pipeline,
            state: Mutex::new(ConsumerState::Inactive),
            in_flight: Arc::new(Semaphore::new(permits)),
        })
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        *self.lock_state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConsumerState::Active
    }

    /// Declares the queue topology and subscribes.
    ///
    /// Does nothing unless the consumer is inactive. On failure the consumer
    /// goes back to inactive so a later sweep can try again.
    pub async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        {
            let mut state = self.lock_state();
            if *state != ConsumerState::Inactive {
                return Ok(());
            }
            *state = ConsumerState::Starting;
        }

        let stream = match self.subscribe().await {
            Ok(stream) => stream,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.name(),
                    "failure to start consumer"
                );
                self.set_state(ConsumerState::Inactive);
                return Err(err);
            }
        };

        self.set_state(ConsumerState::Active);
        info!(queue = self.queue.name(), tag = self.tag.as_str(), "consumer started");

        let consumer = Arc::clone(self);
        tokio::spawn(async move { consumer.run(stream).await });

        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, AmqpError> {
        self.topology.declare_queue(&self.queue).await?;

        self.channel
            .basic_consume(self.queue.name(), &self.tag, self.queue.prefetch_count)
            .await
    }

    async fn run(self: Arc<Self>, mut stream: DeliveryStream) {
        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    let Ok(permit) = Arc::clone(&self.in_flight).acquire_owned().await else {
                        break;
                    };

                    let consumer = Arc::clone(&self);
                    tokio::spawn(async move {
                        consumer.dispatch(delivery).await;
                        drop(permit);
                    });
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        self.set_state(ConsumerState::Inactive);
        warn!(queue = self.queue.name(), tag = self.tag.as_str(), "consumer stopped");
    }

    async fn dispatch(&self, mut delivery: DeliveryContext) {
        let msg_type = delivery
            .message_type()
            .unwrap_or(self.queue.message_type_name())
            .to_owned();

        let ctx = otel::consumer_context(&delivery, &msg_type);

        debug!(
            "received: {} - exchange: {}",
            msg_type,
            delivery.exchange(),
        );

        let outcome = self.pipeline.run(&ctx, &delivery).await;

        let settled = self.behaviour.handle(outcome, &mut delivery).await;

        let span = ctx.span();
        match settled {
            Ok(action) => {
                debug!(?action, delivery_tag = delivery.delivery_tag(), "delivery settled");
                span.set_status(Status::Ok);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = delivery.delivery_tag(),
                    "failure to settle delivery"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to settle msg"),
                });
            }
        }

        span.end();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConsumerState) {
        *self.lock_state() = state;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        handler::{Handler, MockHandler},
        outcome::Outcome,
        testing::{BrokerAction, FakeChannel, RecordingPublisher},
    };
    use async_trait::async_trait;
    use lapin::BasicProperties;
    use opentelemetry::Context;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    pub(crate) fn broker(channel: &Arc<FakeChannel>) -> BrokerContext {
        BrokerContext {
            channel: channel.clone(),
            publisher: RecordingPublisher::new(),
            topology: AmqpTopology::new(channel.clone(), TopologySettings::default()),
        }
    }

    pub(crate) fn acking_handler() -> Arc<MockHandler> {
        let mut handler = MockHandler::new();
        handler.expect_handle().returning(|_, _| Outcome::Ack);
        Arc::new(handler)
    }

    pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn delivery(tag: u64) -> DeliveryContext {
        DeliveryContext::new(tag, "shop", "order.created", false, BasicProperties::default(), b"{}".to_vec())
    }

    #[tokio::test]
    async fn start_declares_topology_and_processes_deliveries() {
        let channel = FakeChannel::starting_at(1);
        let consumer = Consumer::new(
            &broker(&channel),
            QueueDefinition::new("orders"),
            Pipeline::new(acking_handler()),
        );
        assert_eq!(consumer.state(), ConsumerState::Inactive);

        consumer.start().await.unwrap();
        assert!(consumer.is_active());
        assert_eq!(channel.declared_queues()[0].0, "orders");

        channel.deliver(delivery(1));
        channel.deliver(delivery(2));

        wait_until(|| channel.actions().len() == 2).await;
        let mut actions = channel.actions();
        actions.sort_by_key(|a| format!("{:?}", a));
        assert_eq!(actions, vec![BrokerAction::Ack(1), BrokerAction::Ack(2)]);
    }

    #[tokio::test]
    async fn broker_cancel_marks_consumer_inactive() {
        let channel = FakeChannel::starting_at(1);
        let consumer = Consumer::new(
            &broker(&channel),
            QueueDefinition::new("orders"),
            Pipeline::new(acking_handler()),
        );

        consumer.start().await.unwrap();
        // a second start while active is a no-op
        consumer.start().await.unwrap();
        assert_eq!(channel.consume_calls(), 1);

        channel.cancel_consumers();
        wait_until(|| !consumer.is_active()).await;

        consumer.start().await.unwrap();
        assert!(consumer.is_active());
        assert_eq!(channel.consume_calls(), 2);
    }

    #[tokio::test]
    async fn failed_start_leaves_consumer_inactive() {
        let channel = FakeChannel::starting_at(1);
        channel.fail_consumes(true);
        let consumer = Consumer::new(
            &broker(&channel),
            QueueDefinition::new("orders"),
            Pipeline::new(acking_handler()),
        );

        let result = consumer.start().await;

        assert_eq!(result, Err(AmqpError::BindingConsumerError("orders".to_owned())));
        assert_eq!(consumer.state(), ConsumerState::Inactive);
    }

    struct Slow {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Slow {
        async fn handle(&self, _: &Context, _: &DeliveryContext) -> Outcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Outcome::Ack
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handler_concurrency_is_bounded_by_prefetch() {
        let channel = FakeChannel::starting_at(1);
        let slow = Arc::new(Slow {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let consumer = Consumer::new(
            &broker(&channel),
            QueueDefinition::new("orders").prefetch(2),
            Pipeline::new(slow.clone()),
        );

        consumer.start().await.unwrap();
        for tag in 1..=6 {
            channel.deliver(delivery(tag));
        }

        wait_until(|| channel.actions().len() == 6).await;
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
    }
}
