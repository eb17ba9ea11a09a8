// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection and channel establishment, topology
//! declaration, message consumption and dispatch, and publishing.

use thiserror::Error;

/// Represents errors that can occur while consuming from or publishing to RabbitMQ.
///
/// Transport-level variants (connection, channel, topology, consume) are
/// recoverable through supervised reconnection. Dispatch-level variants
/// (decoding, unknown type, invalid payload) end the current consumer session
/// without scheduling a reconnect.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindingQueueError(String, String),

    /// Error configuring the channel prefetch limit
    #[error("failure to configure qos `{0}`")]
    QosDeclarationError(String),

    /// Error registering or running a queue consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The message body could not be decoded into an envelope
    #[error("failure to decode envelope: {0}")]
    DecodeEnvelopeError(String),

    /// No contract is registered for the envelope's message type
    #[error("unknown message type: {0}")]
    UnknownMessageTypeError(String),

    /// The payload did not validate against the resolved contract
    #[error("invalid payload for contract `{0}`: {1}")]
    InvalidPayloadError(String, String),

    /// A contract was registered twice under the same message type
    #[error("contract already registered for message type: {0}")]
    DuplicateContractError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error loading configuration from the environment
    #[error("failure to load configuration: {0}")]
    ConfigError(String),
}
