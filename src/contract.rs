// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Contracts and the Contract Registry
//!
//! A contract is a named payload schema: it validates the raw `message` value
//! of an envelope into a typed payload and contributes the `messageType` key
//! the dispatcher routes on. Contracts and their callbacks are registered
//! once, at consumer setup, into a [`ContractRegistry`] that is never mutated
//! afterwards.

use crate::{
    dispatcher::{DeliveryMetadata, MessageAction},
    envelope::Envelope,
    errors::AmqpError,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{any::Any, collections::HashMap, future::Future, marker::PhantomData, sync::Arc};
use tracing::error;

/// A typed payload schema keyed by a dotted type/namespace path.
///
/// The key is an ordered list of type names, most-specific first, matching the
/// envelope's `messageType` field.
pub trait Contract: Serialize + DeserializeOwned + Send + 'static {
    /// The message-type key this contract is registered and resolved under.
    fn message_type() -> Vec<String>;
}

/// The contract used in MassTransit's RabbitMQ QuickStart tutorial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettingStarted {
    #[serde(rename = "Value")]
    pub value: String,
}

impl Contract for GettingStarted {
    fn message_type() -> Vec<String> {
        vec!["masstransit.GettingStarted".to_owned()]
    }
}

/// Type-erased pairing of a contract with its application callback.
///
/// `decode` validates the raw payload up front so the dispatcher can apply
/// its skip-or-propagate policy before any callback work is scheduled;
/// `invoke` then runs the callback with the already-validated payload.
#[async_trait]
pub trait ContractHandler: Send + Sync {
    /// Validates the raw payload against the contract, returning it typed.
    fn decode(&self, message: &Value) -> Result<Box<dyn Any + Send>, AmqpError>;

    /// Runs the callback with a payload previously produced by [`decode`].
    ///
    /// Returning `None` means the callback declared no outcome and the
    /// delivery is acknowledged.
    ///
    /// [`decode`]: ContractHandler::decode
    async fn invoke(
        &self,
        payload: Box<dyn Any + Send>,
        envelope: Envelope,
        delivery: DeliveryMetadata,
    ) -> Option<MessageAction>;
}

struct ClosureContractHandler<C, F> {
    callback: F,
    _contract: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, F, Fut> ContractHandler for ClosureContractHandler<C, F>
where
    C: Contract,
    F: Fn(C, Envelope, DeliveryMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = Option<MessageAction>> + Send,
{
    fn decode(&self, message: &Value) -> Result<Box<dyn Any + Send>, AmqpError> {
        let payload: C = serde_json::from_value(message.clone()).map_err(|err| {
            AmqpError::InvalidPayloadError(C::message_type().join(", "), err.to_string())
        })?;
        Ok(Box::new(payload))
    }

    async fn invoke(
        &self,
        payload: Box<dyn Any + Send>,
        envelope: Envelope,
        delivery: DeliveryMetadata,
    ) -> Option<MessageAction> {
        match payload.downcast::<C>() {
            Ok(payload) => (self.callback)(*payload, envelope, delivery).await,
            Err(_) => {
                error!(
                    message_type = C::message_type().join(", "),
                    "payload type does not match the registered contract"
                );
                Some(MessageAction::Nack)
            }
        }
    }
}

/// Lookup table from `messageType` key to contract handler.
///
/// Built once at consumer setup; registrations for an already-registered key
/// are rejected rather than silently overwritten.
#[derive(Default)]
pub struct ContractRegistry {
    handlers: HashMap<Vec<String>, Arc<dyn ContractHandler>>,
}

impl ContractRegistry {
    pub fn new() -> ContractRegistry {
        ContractRegistry {
            handlers: HashMap::default(),
        }
    }

    /// Registers a callback for the contract `C`, keyed by its message type.
    ///
    /// The callback receives the validated payload, the full envelope, and
    /// the delivery metadata, and returns the action to take on the message
    /// (`None` defaults to ack).
    pub fn register<C, F, Fut>(mut self, callback: F) -> Result<Self, AmqpError>
    where
        C: Contract,
        F: Fn(C, Envelope, DeliveryMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<MessageAction>> + Send + 'static,
    {
        let key = C::message_type();
        if self.handlers.contains_key(&key) {
            return Err(AmqpError::DuplicateContractError(key.join(", ")));
        }

        self.handlers.insert(
            key,
            Arc::new(ClosureContractHandler {
                callback,
                _contract: PhantomData,
            }),
        );

        Ok(self)
    }

    /// Resolves the handler registered for the given message-type key.
    pub fn resolve(&self, message_type: &[String]) -> Option<Arc<dyn ContractHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delivery() -> DeliveryMetadata {
        DeliveryMetadata {
            delivery_tag: 1,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            app_id: None,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ContractRegistry::new()
            .register::<GettingStarted, _, _>(|_, _, _| async { None })
            .unwrap();

        match registry.register::<GettingStarted, _, _>(|_, _, _| async { None }) {
            Ok(_) => panic!("duplicate registration should be rejected"),
            Err(err) => assert_eq!(
                err,
                AmqpError::DuplicateContractError("masstransit.GettingStarted".to_owned())
            ),
        }
    }

    #[test]
    fn resolve_uses_the_full_message_type_key() {
        let registry = ContractRegistry::new()
            .register::<GettingStarted, _, _>(|_, _, _| async { None })
            .unwrap();

        assert!(registry
            .resolve(&["masstransit.GettingStarted".to_owned()])
            .is_some());
        assert!(registry.resolve(&["baz".to_owned()]).is_none());
    }

    #[test]
    fn decode_rejects_payloads_that_do_not_validate() {
        let registry = ContractRegistry::new()
            .register::<GettingStarted, _, _>(|_, _, _| async { None })
            .unwrap();
        let handler = registry
            .resolve(&GettingStarted::message_type())
            .unwrap();

        let err = handler.decode(&json!({"Wrong": 1})).unwrap_err();
        assert!(matches!(err, AmqpError::InvalidPayloadError(_, _)));
    }

    #[tokio::test]
    async fn invoke_runs_the_callback_with_the_typed_payload() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let registry = ContractRegistry::new()
            .register::<GettingStarted, _, _>(|payload: GettingStarted, _, _| async move {
                assert_eq!(payload.value, "hello");
                CALLS.fetch_add(1, Ordering::SeqCst);
                Some(MessageAction::Ack)
            })
            .unwrap();
        let handler = registry
            .resolve(&GettingStarted::message_type())
            .unwrap();

        let payload = handler.decode(&json!({"Value": "hello"})).unwrap();
        let envelope = Envelope::wrap(GettingStarted::message_type(), json!({"Value": "hello"}));
        let action = handler.invoke(payload, envelope, delivery()).await;

        assert_eq!(action, Some(MessageAction::Ack));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
