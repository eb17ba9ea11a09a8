// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! This module provides the MassTransit wire envelope: the JSON wrapper that
//! carries message identity, correlation ids, routing addresses, the typed
//! payload, and metadata about the producing process. Envelopes are created by
//! the producer at send time or reconstructed from wire bytes at receive time,
//! and are immutable once constructed.

use crate::errors::AmqpError;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata describing the process that produced a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub machine_name: String,
    pub process_name: String,
    pub process_id: u32,
    pub assembly: String,
    pub assembly_version: String,
    pub framework_version: String,
    pub mass_transit_version: String,
    pub operating_system_version: String,
}

impl Host {
    /// Captures the identity of the current process.
    pub fn current() -> Host {
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_default();

        Host {
            machine_name: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .unwrap_or_else(|_| "localhost".to_owned()),
            process_name,
            process_id: std::process::id(),
            assembly: env!("CARGO_PKG_NAME").to_owned(),
            assembly_version: env!("CARGO_PKG_VERSION").to_owned(),
            framework_version: format!("rust/{}", env!("CARGO_PKG_RUST_VERSION")),
            mass_transit_version: env!("CARGO_PKG_VERSION").to_owned(),
            operating_system_version: std::env::consts::OS.to_owned(),
        }
    }
}

/// The canonical wire message.
///
/// Field names follow the MassTransit JSON convention (camelCase). The
/// correlation ids are carried for causal tracing and are never validated for
/// uniqueness here. `message_type` is the dispatch key, most-specific entry
/// first, and is never empty for a dispatchable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: String,

    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub initiator_id: Option<String>,

    #[serde(default)]
    pub source_address: Option<String>,
    #[serde(default)]
    pub destination_address: Option<String>,
    #[serde(default)]
    pub response_address: Option<String>,
    #[serde(default)]
    pub fault_address: Option<String>,

    pub message_type: Vec<String>,
    pub message: Value,

    #[serde(default)]
    pub expiration_time: Option<String>,
    pub sent_time: String,

    #[serde(default)]
    pub headers: HashMap<String, Value>,

    #[serde(default)]
    pub host: Host,
}

impl Envelope {
    /// Wraps a raw payload value into a new envelope.
    ///
    /// A fresh `messageId` is generated, `sentTime` is stamped with the
    /// current UTC time, and `host` captures the running process.
    pub fn wrap(message_type: Vec<String>, message: Value) -> Envelope {
        Envelope {
            message_id: Uuid::new_v4().to_string(),
            request_id: None,
            correlation_id: None,
            conversation_id: None,
            initiator_id: None,
            source_address: None,
            destination_address: None,
            response_address: None,
            fault_address: None,
            message_type,
            message,
            expiration_time: None,
            sent_time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            headers: HashMap::default(),
            host: Host::current(),
        }
    }

    /// Decodes an envelope from wire bytes.
    ///
    /// A malformed body is a protocol mismatch, reported loudly to the caller
    /// rather than silently dropped.
    pub fn from_bytes(body: &[u8]) -> Result<Envelope, AmqpError> {
        serde_json::from_slice(body).map_err(|err| AmqpError::DecodeEnvelopeError(err.to_string()))
    }

    /// Encodes the envelope into wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|_| AmqpError::InternalError)
    }

    /// Dispatch key rendered for logs, most-specific entry first.
    pub fn message_type_key(&self) -> String {
        self.message_type.join(", ")
    }

    /// Time elapsed between `sentTime` and now, negative when the message is
    /// in the past. `None` when `sentTime` is not a valid RFC-3339 timestamp.
    pub fn lag(&self) -> Option<Duration> {
        DateTime::parse_from_rfc3339(&self.sent_time)
            .ok()
            .map(|sent| sent.with_timezone(&Utc) - Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_payload() {
        let envelope = Envelope::wrap(
            vec!["masstransit.GettingStarted".to_owned()],
            json!({"Value": "hello"}),
        );

        let bytes = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.message["Value"], json!("hello"));
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let envelope = Envelope::wrap(vec!["t".to_owned()], json!({}));
        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert!(value.get("messageId").is_some());
        assert!(value.get("messageType").is_some());
        assert!(value.get("sentTime").is_some());
        assert!(value["host"].get("machineName").is_some());
    }

    #[test]
    fn each_envelope_gets_its_own_message_id() {
        let first = Envelope::wrap(vec!["t".to_owned()], json!({}));
        let second = Envelope::wrap(vec!["t".to_owned()], json!({}));
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let body = json!({
            "messageId": "42",
            "messageType": ["urn:message:Example:Ping"],
            "message": {"Value": "x"},
            "sentTime": "2024-01-01T00:00:00Z",
        });

        let envelope = Envelope::from_bytes(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.message_id, "42");
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.headers.is_empty());
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let err = Envelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, AmqpError::DecodeEnvelopeError(_)));
    }

    #[test]
    fn lag_is_negative_for_past_messages() {
        let mut envelope = Envelope::wrap(vec!["t".to_owned()], json!({}));
        envelope.sent_time = "2000-01-01T00:00:00Z".to_owned();
        assert!(envelope.lag().unwrap() < Duration::zero());
    }
}
