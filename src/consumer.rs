// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting RabbitMQ Consumer
//!
//! This module provides the supervised consumer: [`RabbitMqConsumer`] owns a
//! single session (connect, declare topology, consume, dispatch, graceful
//! stop) and [`ReconnectingConsumer`] supervises it, recreating a fresh
//! session with increasing backoff whenever one ends unexpectedly.
//!
//! If RabbitMQ closes the connection, the session stops and indicates that a
//! reconnect is necessary. The limited reasons a broker closes a connection
//! are usually permission issues or socket timeouts, so the close reason is
//! always logged. A channel close instead points at a protocol violation in
//! one of the issued commands, which surfaces in the logs the same way.

use crate::{
    channel,
    config::{AmqpConfig, ConsumerConfig},
    dispatcher::{Acknowledger, DeliveryMetadata, Dispatcher},
    errors::AmqpError,
};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on the supervisor's reconnect delay, in seconds.
pub const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// AMQP reply code sent on deliberate channel and connection closes.
const REPLY_SUCCESS: u16 = 200;

/// Steps of the channel setup sequence, in order.
///
/// The sequence is linear; the only branch is on the absence of a configured
/// exchange, which skips the declare and bind steps. `Closed` is the clean
/// terminal state, `Failed` the one that triggers supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Disconnected,
    Connecting,
    ConnectionOpen,
    ChannelOpen,
    ExchangeDeclared,
    QueueDeclared,
    QueueBound,
    QosSet,
    Consuming,
    Closed,
    Failed,
}

impl SetupState {
    /// The step that follows this one, given whether an exchange is
    /// configured. Terminal states map to themselves.
    pub fn next(self, has_exchange: bool) -> SetupState {
        match self {
            SetupState::Disconnected => SetupState::Connecting,
            SetupState::Connecting => SetupState::ConnectionOpen,
            SetupState::ConnectionOpen => SetupState::ChannelOpen,
            SetupState::ChannelOpen if has_exchange => SetupState::ExchangeDeclared,
            SetupState::ChannelOpen => SetupState::QueueDeclared,
            SetupState::ExchangeDeclared => SetupState::QueueDeclared,
            SetupState::QueueDeclared if has_exchange => SetupState::QueueBound,
            SetupState::QueueDeclared => SetupState::QosSet,
            SetupState::QueueBound => SetupState::QosSet,
            SetupState::QosSet => SetupState::Consuming,
            state => state,
        }
    }
}

/// Flags describing how one consumer session ended.
///
/// Owned exclusively by the session while it runs and handed back to the
/// supervisor by value when it finishes; nothing mutable crosses session
/// boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionState {
    /// The session ended on a transport failure and should be retried.
    pub should_reconnect: bool,
    /// The session reached the consuming state at least once.
    pub was_consuming: bool,
    pub(crate) consuming: bool,
    pub(crate) closing: bool,
}

/// One consumer session: a connection, a channel, the declared topology, and
/// the delivery loop feeding the dispatcher.
pub struct RabbitMqConsumer {
    amqp: AmqpConfig,
    config: ConsumerConfig,
    dispatcher: Arc<Dispatcher>,
    state: SetupState,
    session: SessionState,
    connection: Option<Connection>,
    channel: Option<Arc<Channel>>,
    consumer_tag: String,
}

impl RabbitMqConsumer {
    pub fn new(
        amqp: AmqpConfig,
        config: ConsumerConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> RabbitMqConsumer {
        let consumer_tag = format!("{}-{}", config.queue, Uuid::new_v4());

        RabbitMqConsumer {
            amqp,
            config,
            dispatcher,
            state: SetupState::Disconnected,
            session: SessionState::default(),
            connection: None,
            channel: None,
            consumer_tag,
        }
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    /// Runs the session to completion: drives setup to the consuming state,
    /// processes deliveries until the stream ends or a fatal dispatch error
    /// occurs, then shuts down cleanly.
    ///
    /// Transport failures mark the session for reconnection; dispatch
    /// failures (malformed envelope, unknown type, invalid payload) do not,
    /// so a poisoned queue stops the process instead of looping forever.
    pub async fn run(&mut self) {
        if let Err(err) = self.run_session().await {
            if !self.session.closing {
                match err {
                    AmqpError::DecodeEnvelopeError(_)
                    | AmqpError::UnknownMessageTypeError(_)
                    | AmqpError::InvalidPayloadError(_, _) => {
                        error!(error = err.to_string(), "ABORTING! dispatch failure");
                    }
                    _ => {
                        warn!(error = err.to_string(), "session lost, reconnect necessary");
                        self.session.should_reconnect = true;
                    }
                }
            }
            self.state = SetupState::Failed;
        }
        self.stop().await;
    }

    async fn run_session(&mut self) -> Result<(), AmqpError> {
        let mut consumer = self.setup().await?;
        self.consume_loop(&mut consumer).await
    }

    /// Advances the setup state machine step by step until the queue is
    /// being consumed.
    async fn setup(&mut self) -> Result<lapin::Consumer, AmqpError> {
        while self.state != SetupState::QosSet {
            let next = self.state.next(self.config.exchange.is_some());
            self.enter(next).await?;
            self.state = next;
        }
        self.start_consuming().await
    }

    async fn enter(&mut self, state: SetupState) -> Result<(), AmqpError> {
        match state {
            SetupState::Connecting => self.connect().await,
            SetupState::ConnectionOpen => {
                info!("connection opened: {}", self.amqp.app_name);
                Ok(())
            }
            SetupState::ChannelOpen => self.open_channel().await,
            SetupState::ExchangeDeclared => self.setup_exchange().await,
            SetupState::QueueDeclared => self.setup_queue().await,
            SetupState::QueueBound => self.bind_queue().await,
            SetupState::QosSet => self.set_qos().await,
            _ => Ok(()),
        }
    }

    async fn connect(&mut self) -> Result<(), AmqpError> {
        debug!("connecting to {}", self.amqp.dsn);
        self.connection = Some(channel::connect(&self.amqp).await?);
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<(), AmqpError> {
        debug!("creating a new channel");
        let connection = self.connection.as_ref().ok_or(AmqpError::InternalError)?;

        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel opened");
                self.channel = Some(Arc::new(channel));
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn channel(&self) -> Result<&Arc<Channel>, AmqpError> {
        self.channel.as_ref().ok_or(AmqpError::InternalError)
    }

    async fn setup_exchange(&self) -> Result<(), AmqpError> {
        let Some(exchange) = self.config.exchange.clone() else {
            return Ok(());
        };

        debug!("declaring exchange: {}", exchange);
        match self
            .channel()?
            .exchange_declare(
                &exchange,
                self.config.exchange_kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => {
                debug!("exchange declared: {}", exchange);
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exchange))
            }
        }
    }

    async fn setup_queue(&self) -> Result<(), AmqpError> {
        debug!("declaring queue: {}", self.config.queue);
        match self
            .channel()?
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => {
                debug!("queue declared: {}", self.config.queue);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(self.config.queue.clone()))
            }
        }
    }

    async fn bind_queue(&self) -> Result<(), AmqpError> {
        let Some(exchange) = self.config.exchange.clone() else {
            return Ok(());
        };
        // an empty routing key is valid and matches the exchange default
        let routing_key = self.config.routing_key.clone().unwrap_or_default();

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.config.queue, exchange, routing_key
        );
        match self
            .channel()?
            .queue_bind(
                &self.config.queue,
                &exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => {
                debug!("queue bound: {}", self.config.queue);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingQueueError(
                    self.config.queue.clone(),
                    exchange,
                ))
            }
        }
    }

    async fn set_qos(&self) -> Result<(), AmqpError> {
        match self
            .channel()?
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
        {
            Ok(()) => {
                debug!("qos set to: {}", self.config.prefetch_count);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QosDeclarationError(err.to_string()))
            }
        }
    }

    async fn start_consuming(&mut self) -> Result<lapin::Consumer, AmqpError> {
        debug!("issuing consumer related RPC commands");
        match self
            .channel()?
            .basic_consume(
                &self.config.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => {
                self.state = SetupState::Consuming;
                self.session.consuming = true;
                self.session.was_consuming = true;
                info!("consuming queue: {}", self.config.queue);
                Ok(consumer)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        }
    }

    /// Processes deliveries until the stream ends.
    ///
    /// Each delivery is handed to the dispatcher, which schedules the
    /// callback on its own task; the loop itself only decodes and routes, so
    /// it keeps accepting transport events while callbacks run. The stream
    /// ending while not closing means the broker canceled us or the
    /// connection dropped.
    async fn consume_loop(&mut self, consumer: &mut lapin::Consumer) -> Result<(), AmqpError> {
        let acker = self.channel()?.clone() as Arc<dyn Acknowledger>;

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let metadata = DeliveryMetadata::from(&delivery);
                    self.dispatcher
                        .dispatch(&delivery.data, metadata, acker.clone())
                        .await?;
                }
                Err(err) => {
                    error!(error = err.to_string(), "error while consuming");
                    return Err(AmqpError::ConsumerError(err.to_string()));
                }
            }
        }

        if self.session.closing {
            Ok(())
        } else {
            warn!("consumer was canceled remotely, shutting down");
            Err(AmqpError::ConsumerError("consumer canceled".to_owned()))
        }
    }

    /// Gracefully shuts the session down. Idempotent: a second stop while
    /// one is in flight is a no-op.
    ///
    /// When consuming, the consumer is canceled first and the channel closed
    /// only after the broker acknowledges the cancellation, which cascades
    /// into closing the connection.
    pub async fn stop(&mut self) {
        if self.session.closing {
            return;
        }
        self.session.closing = true;
        info!("stopping");

        if self.session.consuming {
            self.stop_consuming().await;
        }
        self.close().await;

        if self.state != SetupState::Failed {
            self.state = SetupState::Closed;
        }
        info!("stopped");
    }

    async fn stop_consuming(&mut self) {
        if let Some(channel) = &self.channel {
            debug!("sending a Basic.Cancel RPC command to RabbitMQ");
            match channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                Ok(()) => debug!("cancellation acknowledged: {}", self.consumer_tag),
                Err(err) => warn!(error = err.to_string(), "error canceling the consumer"),
            }
        }
        self.session.consuming = false;
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            info!("closing the channel");
            if let Err(err) = channel.close(REPLY_SUCCESS, "bye").await {
                warn!(error = err.to_string(), "error closing the channel");
            }
        }
        if let Some(connection) = self.connection.take() {
            info!("closing connection");
            if let Err(err) = connection.close(REPLY_SUCCESS, "bye").await {
                warn!(error = err.to_string(), "error closing the connection");
            }
        }
    }
}

/// Supervises [`RabbitMqConsumer`] sessions, recreating a fresh one whenever
/// the previous session asks for a reconnect.
///
/// Sessions that were healthy (reached consuming) and merely dropped retry
/// immediately; sessions that never managed to connect are throttled, one
/// extra second per attempt up to [`MAX_RECONNECT_DELAY_SECS`]. The delay is
/// the only state that survives across sessions.
pub struct ReconnectingConsumer {
    amqp: AmqpConfig,
    config: ConsumerConfig,
    dispatcher: Arc<Dispatcher>,
    reconnect_delay: u64,
}

impl ReconnectingConsumer {
    pub fn new(
        amqp: AmqpConfig,
        config: ConsumerConfig,
        dispatcher: Dispatcher,
    ) -> ReconnectingConsumer {
        ReconnectingConsumer {
            amqp,
            config,
            dispatcher: Arc::new(dispatcher),
            reconnect_delay: 0,
        }
    }

    /// Runs consumer sessions until one ends without requesting a reconnect
    /// or an interrupt signal arrives.
    pub async fn run(&mut self) {
        loop {
            let mut consumer = RabbitMqConsumer::new(
                self.amqp.clone(),
                self.config.clone(),
                self.dispatcher.clone(),
            );

            let interrupted = tokio::select! {
                _ = consumer.run() => false,
                _ = tokio::signal::ctrl_c() => true,
            };

            if interrupted {
                info!("interrupt received, stopping");
                consumer.stop().await;
                break;
            }

            let session = consumer.session();
            if !session.should_reconnect {
                break;
            }

            let interrupt = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            if self.backoff(session.was_consuming, interrupt).await {
                info!("interrupt received, stopping");
                break;
            }
        }
    }

    /// Waits out the reconnect delay, returning `true` when the wait was cut
    /// short by `interrupt`.
    async fn backoff<F>(&mut self, was_consuming: bool, interrupt: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        let delay = self.next_delay(was_consuming);
        info!("reconnecting after {} seconds", delay);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(delay)) => false,
            _ = interrupt => true,
        }
    }

    fn next_delay(&mut self, was_consuming: bool) -> u64 {
        if was_consuming {
            self.reconnect_delay = 0;
        } else {
            self.reconnect_delay += 1;
        }
        self.reconnect_delay = self.reconnect_delay.min(MAX_RECONNECT_DELAY_SECS);
        self.reconnect_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractRegistry;

    fn walk(from: SetupState, has_exchange: bool) -> Vec<SetupState> {
        let mut states = vec![];
        let mut state = from;
        while state != SetupState::Consuming {
            state = state.next(has_exchange);
            states.push(state);
        }
        states
    }

    #[test]
    fn setup_sequence_with_exchange_declares_and_binds() {
        assert_eq!(
            walk(SetupState::Disconnected, true),
            vec![
                SetupState::Connecting,
                SetupState::ConnectionOpen,
                SetupState::ChannelOpen,
                SetupState::ExchangeDeclared,
                SetupState::QueueDeclared,
                SetupState::QueueBound,
                SetupState::QosSet,
                SetupState::Consuming,
            ]
        );
    }

    #[test]
    fn setup_sequence_without_exchange_skips_declare_and_bind() {
        assert_eq!(
            walk(SetupState::Disconnected, false),
            vec![
                SetupState::Connecting,
                SetupState::ConnectionOpen,
                SetupState::ChannelOpen,
                SetupState::QueueDeclared,
                SetupState::QosSet,
                SetupState::Consuming,
            ]
        );
    }

    #[test]
    fn terminal_states_do_not_advance() {
        assert_eq!(SetupState::Closed.next(true), SetupState::Closed);
        assert_eq!(SetupState::Failed.next(false), SetupState::Failed);
        assert_eq!(SetupState::Consuming.next(true), SetupState::Consuming);
    }

    fn supervisor() -> ReconnectingConsumer {
        ReconnectingConsumer::new(
            AmqpConfig::default(),
            ConsumerConfig::new("test"),
            Dispatcher::new(Arc::new(ContractRegistry::new())),
        )
    }

    #[test]
    fn delay_ramps_by_one_second_while_never_consuming() {
        let mut supervisor = supervisor();
        assert_eq!(supervisor.next_delay(false), 1);
        assert_eq!(supervisor.next_delay(false), 2);
        assert_eq!(supervisor.next_delay(false), 3);
    }

    #[test]
    fn delay_never_exceeds_the_cap() {
        let mut supervisor = supervisor();
        let mut last = 0;
        for _ in 0..40 {
            last = supervisor.next_delay(false);
        }
        assert_eq!(last, MAX_RECONNECT_DELAY_SECS);
    }

    #[test]
    fn healthy_session_resets_the_delay_to_zero() {
        let mut supervisor = supervisor();
        supervisor.next_delay(false);
        supervisor.next_delay(false);
        assert_eq!(supervisor.next_delay(true), 0);
        // the ramp restarts from scratch afterwards
        assert_eq!(supervisor.next_delay(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_out_the_delay_without_an_interrupt() {
        let mut supervisor = supervisor();
        let interrupted = supervisor.backoff(false, std::future::pending()).await;
        assert!(!interrupted);
    }

    #[tokio::test]
    async fn interrupt_during_backoff_cuts_the_wait_short() {
        let mut supervisor = supervisor();
        let interrupted = supervisor.backoff(false, std::future::ready(())).await;
        assert!(interrupted);
    }

    #[test]
    fn fresh_sessions_start_disconnected() {
        let consumer = RabbitMqConsumer::new(
            AmqpConfig::default(),
            ConsumerConfig::new("test"),
            Arc::new(Dispatcher::new(Arc::new(ContractRegistry::new()))),
        );
        assert_eq!(consumer.state(), SetupState::Disconnected);
        assert!(!consumer.session().should_reconnect);
        assert!(!consumer.session().was_consuming);
    }
}
