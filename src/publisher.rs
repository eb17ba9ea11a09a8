// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! The producer is the mirror image of the dispatch pipeline: it wraps a
//! typed payload into a fresh envelope (generated `messageId`, current
//! `sentTime`, host metadata, the contract's `messageType`) and publishes it
//! on the exchange and queue configured at construction. Publishing is one
//! synchronous call per message; failures surface to the caller and are not
//! retried here.

use crate::{
    channel::new_amqp_channel,
    config::{AmqpConfig, ProducerConfig},
    contract::Contract,
    envelope::Envelope,
    errors::AmqpError,
    otel::EnvelopeHeaderPropagator,
};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use std::sync::Arc;
use tracing::{error, info};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Builds the envelope for a typed payload bound for `destination`.
///
/// The current trace context is injected into the envelope headers so
/// consumers can resume it.
pub(crate) fn build_envelope<C: Contract>(
    payload: &C,
    destination: &str,
) -> Result<Envelope, AmqpError> {
    let message = serde_json::to_value(payload).map_err(|_| AmqpError::InternalError)?;

    let mut envelope = Envelope::wrap(C::message_type(), message);
    envelope.destination_address = Some(destination.to_owned());

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject(&mut EnvelopeHeaderPropagator::new(&mut envelope.headers))
    });

    Ok(envelope)
}

/// Publishes MassTransit envelopes on a queue declared at construction.
pub struct RabbitMqProducer {
    _connection: Arc<Connection>,
    channel: Arc<Channel>,
    config: ProducerConfig,
    destination: String,
}

impl RabbitMqProducer {
    /// Connects to the broker and declares the configured queue so sends
    /// never race its creation.
    pub async fn new(
        amqp: &AmqpConfig,
        config: ProducerConfig,
    ) -> Result<Arc<RabbitMqProducer>, AmqpError> {
        let (connection, channel) = new_amqp_channel(amqp).await?;

        if let Err(err) = channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: config.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            error!(error = err.to_string(), "error to declare the queue");
            return Err(AmqpError::DeclareQueueError(config.queue.clone()));
        }

        let host = amqp
            .dsn
            .parse::<lapin::uri::AMQPUri>()
            .map(|uri| uri.authority.host)
            .unwrap_or_else(|_| "localhost".to_owned());
        let destination = format!("rabbitmq://{}/{}", host, config.queue);

        info!("connected to RabbitMQ: {}", amqp.app_name);

        Ok(Arc::new(RabbitMqProducer {
            _connection: connection,
            channel,
            config,
            destination,
        }))
    }

    /// Publishes a typed payload wrapped in a fresh envelope.
    ///
    /// Returns the envelope as sent, `messageId` included.
    pub async fn send_contract<C: Contract>(
        &self,
        payload: &C,
        routing_key: &str,
    ) -> Result<Envelope, AmqpError> {
        let envelope = build_envelope(payload, &self.destination)?;
        self.publish(&envelope, routing_key).await?;
        Ok(envelope)
    }

    /// Validates raw JSON payload bytes against the contract `C`, then
    /// publishes them like [`send_contract`].
    ///
    /// [`send_contract`]: RabbitMqProducer::send_contract
    pub async fn send<C: Contract>(
        &self,
        body: &[u8],
        routing_key: &str,
    ) -> Result<Envelope, AmqpError> {
        let payload: C = serde_json::from_slice(body).map_err(|err| {
            AmqpError::InvalidPayloadError(C::message_type().join(", "), err.to_string())
        })?;
        self.send_contract(&payload, routing_key).await
    }

    async fn publish(&self, envelope: &Envelope, routing_key: &str) -> Result<(), AmqpError> {
        let body = envelope.to_bytes()?;
        let message_type = envelope.message_type.first().cloned().unwrap_or_default();

        match self
            .channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_type(ShortString::from(message_type))
                    .with_message_id(ShortString::from(envelope.message_id.clone())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => {
                info!(
                    "sent message to {} | {} | {}",
                    self.config.queue, routing_key, envelope.message_id
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contract::{ContractRegistry, GettingStarted},
        dispatcher::{DeliveryMetadata, Dispatcher, MockAcknowledger},
    };
    use mockall::predicate::eq;
    use std::sync::Mutex;

    #[test]
    fn build_envelope_stamps_identity_and_type() {
        let payload = GettingStarted {
            value: "hello".to_owned(),
        };
        let envelope = build_envelope(&payload, "rabbitmq://localhost/getting-started").unwrap();

        assert!(!envelope.message_id.is_empty());
        assert_eq!(envelope.message_type, GettingStarted::message_type());
        assert_eq!(
            envelope.destination_address.as_deref(),
            Some("rabbitmq://localhost/getting-started")
        );
        assert!(!envelope.host.machine_name.is_empty());
        assert!(!envelope.sent_time.is_empty());
    }

    #[tokio::test]
    async fn produced_envelope_round_trips_through_the_dispatcher() {
        let payload = GettingStarted {
            value: "round trip".to_owned(),
        };
        let body = build_envelope(&payload, "rabbitmq://localhost/q")
            .unwrap()
            .to_bytes()
            .unwrap();

        let received: Arc<Mutex<Option<GettingStarted>>> = Arc::new(Mutex::new(None));
        let captured = received.clone();

        let registry = ContractRegistry::new()
            .register::<GettingStarted, _, _>(move |payload: GettingStarted, _, _| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(payload);
                    None
                }
            })
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .with(eq(21u64))
            .times(1)
            .returning(|_| Ok(()));

        let metadata = DeliveryMetadata {
            delivery_tag: 21,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            app_id: None,
        };

        let handle = dispatcher
            .dispatch(&body, metadata, Arc::new(acker))
            .await
            .unwrap()
            .expect("callback should have been scheduled");
        handle.await.unwrap();

        assert_eq!(received.lock().unwrap().as_ref(), Some(&payload));
    }
}
