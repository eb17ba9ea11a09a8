// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! MassTransit-compatible messaging over RabbitMQ: wire envelopes, contract
//! registration and dispatch, a supervised reconnecting consumer, and a
//! producer for the mirror-image encode path.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod contract;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod publisher;
