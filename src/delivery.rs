// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A message handed out by the broker is split in two: the `InboundMessage`
//! (what was delivered) and its ack handle. The consumer owns both for the
//! whole processing of the delivery and settles the handle exactly once.

use crate::{envelope::Envelope, errors::AmqpError};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicRejectOptions},
    types::FieldTable,
    BasicProperties,
};
use tracing::error;

/// Settles a delivery on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Removes the delivery from its queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects without requeue, handing the delivery to the queue's
    /// dead-letter exchange.
    async fn reject(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        Acker::reject(self, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}

/// A raw delivery as received from a queue, before decoding.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl InboundMessage {
    /// Splits a lapin delivery into the message and its ack handle.
    pub fn from_lapin(delivery: lapin::message::Delivery) -> (InboundMessage, Acker) {
        let message = InboundMessage {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
        };

        (message, delivery.acker)
    }

    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    pub fn message_id(&self) -> Option<String> {
        self.properties.message_id().as_ref().map(|id| id.to_string())
    }

    /// Decodes the body into the delivery handed to handlers.
    pub fn decode(&self) -> Result<Delivery, serde_json::Error> {
        Ok(Delivery {
            envelope: Envelope::from_bytes(&self.body)?,
            routing_key: self.routing_key.clone(),
            exchange: self.exchange.clone(),
            headers: self.headers(),
            redelivered: self.redelivered,
            delivery_tag: self.delivery_tag,
            message_id: self.message_id(),
        })
    }
}

/// A decoded delivery, as seen by handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub routing_key: String,
    pub exchange: String,
    pub headers: FieldTable,
    /// Set by the broker when this delivery was handed out before
    pub redelivered: bool,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lapin::types::ShortString;

    pub(crate) fn inbound(routing_key: &str, body: &[u8]) -> InboundMessage {
        InboundMessage {
            delivery_tag: 1,
            exchange: "app".to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: BasicProperties::default()
                .with_message_id(ShortString::from("msg-1")),
            body: body.to_vec(),
        }
    }

    pub(crate) fn inbound_envelope(routing_key: &str, envelope: &Envelope) -> InboundMessage {
        inbound(routing_key, &envelope.to_bytes().unwrap())
    }

    #[test]
    fn decodes_envelope_and_metadata() {
        let message = inbound_envelope("order.created", &Envelope::new("user-1", b"{}".to_vec()));

        let delivery = message.decode().unwrap();

        assert_eq!(delivery.envelope.owner_id, "user-1");
        assert_eq!(delivery.routing_key, "order.created");
        assert_eq!(delivery.exchange, "app");
        assert_eq!(delivery.message_id.as_deref(), Some("msg-1"));
        assert!(delivery.headers.inner().is_empty());
    }

    #[test]
    fn decode_fails_on_garbage() {
        assert!(inbound("order.created", b"not json").decode().is_err());
    }
}
