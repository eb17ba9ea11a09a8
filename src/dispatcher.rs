// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! The dispatch pipeline for one delivery: decode the wire envelope, resolve
//! its contract by `messageType`, validate the payload, run the registered
//! callback on its own task, and translate the callback's declared outcome
//! into the matching acknowledgement against the delivery tag.
//!
//! Acknowledgements are sent in callback completion order, not delivery
//! order; the protocol attaches no ordering guarantee to them.

use crate::{contract::ContractRegistry, envelope::Envelope, errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    Channel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error};

/// Actions that can be taken on messages.
///
/// A callback that declares no outcome defaults to [`MessageAction::Ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    Ack,
    Nack,
    NackAndRequeue,
    Reject,
    RejectAndRequeue,
}

/// Transport metadata accompanying one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub app_id: Option<String>,
}

impl From<&Delivery> for DeliveryMetadata {
    fn from(delivery: &Delivery) -> DeliveryMetadata {
        DeliveryMetadata {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            app_id: delivery
                .properties
                .app_id()
                .as_ref()
                .map(|id| id.to_string()),
        }
    }
}

/// Sends acknowledgements for delivery tags.
///
/// This is the dispatcher's only view of the transport, which keeps the
/// acknowledgement path mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error while nack msg");
            AmqpError::NackMessageError
        })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while reject msg");
                AmqpError::RejectMessageError
            })
    }
}

/// Routes decoded envelopes to their registered contract callbacks.
///
/// `skip_unknown` (default on) silently drops envelopes whose message type
/// has no registered contract; turned off, an unknown type is logged and
/// surfaced as an error. `skip_invalid` (default off) controls whether a
/// payload that fails contract validation is dropped or aborts the caller.
pub struct Dispatcher {
    registry: Arc<ContractRegistry>,
    skip_unknown: bool,
    skip_invalid: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ContractRegistry>) -> Dispatcher {
        Dispatcher {
            registry,
            skip_unknown: true,
            skip_invalid: false,
        }
    }

    pub fn skip_unknown(mut self, skip: bool) -> Self {
        self.skip_unknown = skip;
        self
    }

    pub fn skip_invalid(mut self, skip: bool) -> Self {
        self.skip_invalid = skip;
        self
    }

    /// Dispatches one delivery.
    ///
    /// Decoding and validation run inline; the callback and its
    /// acknowledgement are handed to a separate task so a slow callback does
    /// not block acceptance of the next delivery. The returned handle
    /// completes once the acknowledgement has been sent; `None` means the
    /// message was skipped and no acknowledgement will follow.
    ///
    /// A decode failure is returned to the caller untouched: a malformed
    /// envelope indicates a protocol mismatch that must end the session.
    pub async fn dispatch(
        &self,
        body: &[u8],
        delivery: DeliveryMetadata,
        acker: Arc<dyn Acknowledger>,
    ) -> Result<Option<tokio::task::JoinHandle<()>>, AmqpError> {
        let envelope = Envelope::from_bytes(body)?;
        let key = envelope.message_type_key();

        debug!(
            "received message # {} from {} | {} | {}",
            delivery.delivery_tag,
            delivery.app_id.as_deref().unwrap_or("-"),
            envelope.message_id,
            key,
        );

        let Some(handler) = self.registry.resolve(&envelope.message_type) else {
            if self.skip_unknown {
                debug!("skipping message with unregistered type: {}", key);
                return Ok(None);
            }
            error!("Unknown message type: {}", key);
            return Err(AmqpError::UnknownMessageTypeError(key));
        };

        let payload = match handler.decode(&envelope.message) {
            Ok(payload) => payload,
            Err(err) => {
                if self.skip_invalid {
                    error!(error = err.to_string(), "skipping invalid message");
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let handle = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");
            let (_ctx, mut span) = otel::consumer_span(&envelope.headers, &tracer, &key);

            let delivery_tag = delivery.delivery_tag;
            let action = handler
                .invoke(payload, envelope, delivery)
                .await
                .unwrap_or(MessageAction::Ack);

            let sent = match action {
                MessageAction::Ack => acker.ack(delivery_tag).await,
                MessageAction::Nack => acker.nack(delivery_tag, false).await,
                MessageAction::NackAndRequeue => acker.nack(delivery_tag, true).await,
                MessageAction::Reject => acker.reject(delivery_tag, false).await,
                MessageAction::RejectAndRequeue => acker.reject(delivery_tag, true).await,
            };

            match sent {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        delivery_tag, "error sending acknowledgement"
                    );
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error sending acknowledgement"),
                    });
                }
            }
        });

        Ok(Some(handle))
    }
}
