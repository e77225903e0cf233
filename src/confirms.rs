// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Confirmation Tracking
//!
//! `ConfirmTracker` wraps one broker channel in confirm mode and correlates
//! broker events with the publish that caused them. Every publish gets a
//! `PendingPublish` keyed by the channel's sequence number; it is resolved
//! exactly once by whichever of ack, nack, return, channel shutdown or the
//! local timeout gets there first. Resolution removes the entry from the
//! pending map under its lock, so every later event for the same sequence
//! number finds nothing and is a no-op.
//!
//! `basic.return` frames carry no sequence number, so the tracker stamps each
//! outgoing message with its sequence number under `x-publish-tag` and reads it
//! back from the returned message.

use crate::{
    channel::{BrokerChannel, ConfirmEvent, ConnectionSettings},
    delivery::{header_u64, AMQP_HEADERS_PUBLISH_TAG},
    errors::{AmqpError, ConfirmError},
    publisher::Publisher,
};
use async_trait::async_trait;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, LongString, ShortString},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, oneshot},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, warn};

/// Default time a publish waits for its confirmation
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

type Completion = oneshot::Sender<Result<(), ConfirmError>>;

struct PendingPublish {
    completion: Completion,
    created_at: Instant,
    timer: Option<AbortHandle>,
}

impl PendingPublish {
    /// Hands `result` to the waiter and cancels the timeout task.
    fn complete(self, result: Result<(), ConfirmError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.completion.send(result);
    }
}

type PendingMap = Arc<Mutex<BTreeMap<u64, PendingPublish>>>;

/// Completion handle of a tracked publish.
#[derive(Debug)]
pub struct ConfirmHandle {
    sequence: u64,
    rx: oneshot::Receiver<Result<(), ConfirmError>>,
}

impl ConfirmHandle {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Waits for the broker's verdict on the publish.
    pub async fn wait(self) -> Result<(), ConfirmError> {
        self.rx.await.unwrap_or(Err(ConfirmError::Cancelled))
    }
}

pub struct ConfirmTracker {
    channel: Arc<dyn BrokerChannel>,
    pending: PendingMap,
    gate: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl ConfirmTracker {
    /// Creates a tracker over a channel already in confirm mode.
    ///
    /// # Parameters
    /// * `channel` - The channel every tracked publish goes through
    /// * `timeout` - How long a publish waits for its confirmation before failing
    ///
    /// # Returns
    /// The tracker; hand it the channel's event feed with `listen`
    pub fn new(channel: Arc<dyn BrokerChannel>, timeout: Duration) -> Arc<ConfirmTracker> {
        Arc::new(ConfirmTracker {
            channel,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            gate: tokio::sync::Mutex::new(()),
            timeout,
        })
    }

    /// Creates a tracker using the confirm timeout of `settings`.
    pub fn from_settings(
        channel: Arc<dyn BrokerChannel>,
        settings: &ConnectionSettings,
    ) -> Arc<ConfirmTracker> {
        ConfirmTracker::new(channel, settings.publish_confirm_timeout())
    }

    /// Number of publishes still waiting for a verdict.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Publishes a message and returns the handle its confirmation resolves.
    ///
    /// Reading the sequence number and issuing the publish happen under the
    /// channel gate, so concurrent callers never share a sequence number.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: AMQPProperties,
        payload: &[u8],
    ) -> Result<ConfirmHandle, AmqpError> {
        let (tx, rx) = oneshot::channel();

        let sequence = {
            let _gate = self.gate.lock().await;
            let sequence = self.channel.next_publish_seq_no();

            lock(&self.pending).insert(
                sequence,
                PendingPublish {
                    completion: tx,
                    created_at: Instant::now(),
                    timer: None,
                },
            );

            let mut headers = properties.headers().clone().unwrap_or_default();
            headers.insert(
                ShortString::from(AMQP_HEADERS_PUBLISH_TAG),
                AMQPValue::LongString(LongString::from(sequence.to_string())),
            );

            if let Err(err) = self
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    mandatory,
                    properties.with_headers(headers),
                    payload,
                )
                .await
            {
                lock(&self.pending).remove(&sequence);
                return Err(err);
            }

            sequence
        };

        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if resolve_one(&pending, sequence, Err(ConfirmError::Timeout(timeout))) {
                warn!(sequence, "publish confirmation timed out");
            }
        });

        // the confirmation may already have arrived while the timer was spawned
        match lock(&self.pending).get_mut(&sequence) {
            Some(entry) => entry.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        Ok(ConfirmHandle { sequence, rx })
    }

    /// Applies one broker event to the pending publishes.
    pub fn handle_event(&self, event: ConfirmEvent) {
        match event {
            ConfirmEvent::Ack {
                delivery_tag,
                multiple,
            } => self.resolve_tags(delivery_tag, multiple, Ok(())),
            ConfirmEvent::Nack {
                delivery_tag,
                multiple,
            } => self.resolve_tags(delivery_tag, multiple, Err(ConfirmError::NotAcknowledged)),
            ConfirmEvent::Return {
                reply_code,
                reply_text,
                properties,
            } => {
                let tag = properties
                    .headers()
                    .as_ref()
                    .and_then(|headers| headers.inner().get(AMQP_HEADERS_PUBLISH_TAG))
                    .and_then(header_u64);

                let Some(tag) = tag else {
                    warn!(reply_code, "returned message without publish tag");
                    return;
                };

                let error = ConfirmError::Returned {
                    code: reply_code,
                    text: reply_text,
                };
                resolve_one(&self.pending, tag, Err(error));
            }
            ConfirmEvent::Shutdown { reason } => self.shutdown(&reason),
        }
    }

    /// Fails every pending publish; used when the channel goes away.
    pub fn shutdown(&self, reason: &str) {
        let drained = std::mem::take(&mut *lock(&self.pending));
        if !drained.is_empty() {
            warn!(pending = drained.len(), reason, "channel shutdown with unconfirmed publishes");
        }

        for (_, pending) in drained {
            pending.complete(Err(ConfirmError::ChannelShutdown(reason.to_owned())));
        }
    }

    /// Consumes the channel's confirmation events until the feed closes.
    pub fn listen(self: &Arc<Self>, mut events: UnboundedReceiver<ConfirmEvent>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracker.handle_event(event);
            }
            tracker.shutdown("confirmation feed closed");
        })
    }

    fn resolve_tags(&self, tag: u64, multiple: bool, result: Result<(), ConfirmError>) {
        if !multiple {
            resolve_one(&self.pending, tag, result);
            return;
        }

        let resolved = {
            let mut pending = lock(&self.pending);
            let rest = pending.split_off(&tag.saturating_add(1));
            std::mem::replace(&mut *pending, rest)
        };

        for (_, entry) in resolved {
            entry.complete(result.clone());
        }
    }
}

#[async_trait]
impl Publisher for ConfirmTracker {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: AMQPProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let handle = self
            .publish(exchange, routing_key, mandatory, properties, payload)
            .await?;

        Ok(handle.wait().await?)
    }
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, BTreeMap<u64, PendingPublish>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves one pending publish; returns false when it was already resolved.
fn resolve_one(pending: &PendingMap, tag: u64, result: Result<(), ConfirmError>) -> bool {
    let Some(entry) = lock(pending).remove(&tag) else {
        return false;
    };

    debug!(
        sequence = tag,
        elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "publish resolved"
    );
    entry.complete(result);
    true
}
