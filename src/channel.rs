// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels from an
//! [`AmqpConfig`]. The consumer drives its own connection through the setup
//! state machine and uses [`connect`] directly; the producer takes a ready
//! connection/channel pair from [`new_amqp_channel`].

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Opens a connection to the broker named after the configured application.
pub async fn connect(cfg: &AmqpConfig) -> Result<Connection, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    match Connection::connect(&cfg.dsn, options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}

/// Creates a new AMQP connection and channel for communication with RabbitMQ.
///
/// Both are wrapped in `Arc` for thread-safe sharing; dropping the connection
/// closes the channel with it.
pub async fn new_amqp_channel(
    cfg: &AmqpConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let conn = connect(cfg).await?;

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(channel)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
