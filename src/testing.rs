// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker doubles shared by the unit tests.

use crate::{
    channel::{BrokerChannel, ConfirmEvent, DeliveryStream},
    delivery::DeliveryContext,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::Publisher,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{options::QueueDeclareOptions, protocol::basic::AMQPProperties, types::FieldTable};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: AMQPProperties,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BrokerAction {
    Ack(u64),
    Nack(u64, bool),
    Reject(u64, bool),
}

#[derive(Default)]
pub(crate) struct FakeChannel {
    next_seq: AtomicU64,
    published: Mutex<Vec<Published>>,
    actions: Mutex<Vec<BrokerAction>>,
    queues: Mutex<Vec<(String, FieldTable)>>,
    exchanges: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    fail_publish: AtomicBool,
    fail_ack: AtomicBool,
    fail_consume: AtomicBool,
    consume_calls: AtomicUsize,
    deliveries: Mutex<Vec<UnboundedSender<DeliveryContext>>>,
    confirms: Option<UnboundedSender<ConfirmEvent>>,
    confirm_rx: Mutex<Option<UnboundedReceiver<ConfirmEvent>>>,
}

impl FakeChannel {
    pub fn starting_at(seq: u64) -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            next_seq: AtomicU64::new(seq),
            ..Default::default()
        })
    }

    /// A channel whose broker acks every publish.
    pub fn auto_confirming() -> Arc<FakeChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(FakeChannel {
            next_seq: AtomicU64::new(1),
            confirms: Some(tx),
            confirm_rx: Mutex::new(Some(rx)),
            ..Default::default()
        })
    }

    pub fn take_events(&self) -> UnboundedReceiver<ConfirmEvent> {
        self.confirm_rx
            .lock()
            .unwrap()
            .take()
            .expect("events already taken")
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_acks(&self, fail: bool) {
        self.fail_ack.store(fail, Ordering::SeqCst);
    }

    pub fn fail_consumes(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<BrokerAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn declared_queues(&self) -> Vec<(String, FieldTable)> {
        self.queues.lock().unwrap().clone()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.exchanges.lock().unwrap().clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.bindings.lock().unwrap().clone()
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    /// Pushes a delivery into the most recent consumer.
    pub fn deliver(&self, delivery: DeliveryContext) {
        let deliveries = self.deliveries.lock().unwrap();
        deliveries
            .last()
            .expect("no consumer registered")
            .send(delivery)
            .expect("consumer stream dropped");
    }

    /// Ends every consumer stream, as a broker cancel or connection drop would.
    pub fn cancel_consumers(&self) {
        self.deliveries.lock().unwrap().clear();
    }

    fn record(&self, action: BrokerAction) -> Result<(), AmqpError> {
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(match action {
                BrokerAction::Ack(_) => AmqpError::AckMessageError,
                BrokerAction::Nack(..) => AmqpError::NackMessageError,
                BrokerAction::Reject(..) => AmqpError::RejectMessageError,
            });
        }
        self.actions.lock().unwrap().push(action);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn next_publish_seq_no(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: AMQPProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishingError);
        }

        tokio::task::yield_now().await;

        let delivery_tag = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.published.lock().unwrap().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            properties,
            payload: payload.to_vec(),
        });

        if let Some(confirms) = &self.confirms {
            let _ = confirms.send(ConfirmEvent::Ack {
                delivery_tag,
                multiple: false,
            });
        }

        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record(BrokerAction::Ack(delivery_tag))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(BrokerAction::Nack(delivery_tag, requeue))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(BrokerAction::Reject(delivery_tag, requeue))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.deliveries.lock().unwrap().push(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|delivery| (Ok::<_, AmqpError>(delivery), rx))
        })
        .boxed())
    }

    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.exchanges
            .lock()
            .unwrap()
            .push(exchange.name().to_owned());
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.queues
            .lock()
            .unwrap()
            .push((name.to_owned(), arguments));
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.bindings.lock().unwrap().push((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }
}

/// A `Publisher` that records what it was asked to send.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    sent: Mutex<Vec<Published>>,
    failure: Mutex<Option<AmqpError>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<RecordingPublisher> {
        Arc::new(RecordingPublisher::default())
    }

    pub fn fail_with(&self, err: AmqpError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn sent(&self) -> Vec<Published> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: AMQPProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let failure = self.failure.lock().unwrap().as_ref().map(clone_error);
        if let Some(err) = failure {
            return Err(err);
        }

        self.sent.lock().unwrap().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            properties,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

fn clone_error(err: &AmqpError) -> AmqpError {
    match err {
        AmqpError::PublishingError => AmqpError::PublishingError,
        AmqpError::Confirmation(confirm) => AmqpError::Confirmation(confirm.clone()),
        other => AmqpError::ConsumerError(other.to_string()),
    }
}
