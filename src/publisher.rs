// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! Serializes an `Envelope` and publishes it, persistent, to the application
//! exchange under a routing key. Publishing is a single attempt: a failure is
//! returned to the caller, who decides whether to retry or drop the event.

use crate::{
    channel::AmqpChannel,
    envelope::Envelope,
    errors::AmqpError,
    otel,
    routing::RoutingKey,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode that makes the broker write the message to disk
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishing side of the backbone as seen by business code.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `envelope` under `routing_key`, persistent, in a single
    /// attempt.
    ///
    /// # Parameters
    /// * `ctx` - Trace context propagated to consumers
    /// * `routing_key` - Dot-namespaced key without wildcards
    /// * `envelope` - Event to publish
    ///
    /// # Returns
    /// Ok(()) once the channel accepted the message, or AmqpError; invalid
    /// keys fail before any I/O
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;
}

pub struct AmqpPublisher {
    channel: Arc<dyn AmqpChannel>,
    exchange: String,
    app_id: String,
    lock: Mutex<()>,
}

impl AmqpPublisher {
    /// Creates a publisher writing to `exchange` over `channel`.
    ///
    /// The channel should not be used for consuming; concurrent publishes on
    /// it are serialized by the publisher.
    ///
    /// # Parameters
    /// * `channel` - The connection's publish channel
    /// * `exchange` - Application exchange
    /// * `app_id` - Written to the `app_id` property of every message
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        exchange: &str,
        app_id: &str,
    ) -> Arc<AmqpPublisher> {
        Arc::new(AmqpPublisher {
            channel,
            exchange: exchange.to_owned(),
            app_id: app_id.to_owned(),
            lock: Mutex::new(()),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes an already encoded body with explicit headers to any
    /// exchange. Used to replay dead-lettered messages.
    pub(crate) async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        body: &[u8],
        headers: FieldTable,
    ) -> Result<(), AmqpError> {
        let properties = self.properties(headers);

        let _guard = self.lock.lock().await;
        self.channel
            .publish(exchange, routing_key.as_str(), body, properties)
            .await
    }

    fn properties(&self, headers: FieldTable) -> BasicProperties {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_app_id(ShortString::from(self.app_id.clone()))
            .with_timestamp(timestamp)
            .with_headers(headers)
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let key = RoutingKey::parse(routing_key)?;

        let body = envelope.to_bytes().map_err(|err| {
            error!(error = err.to_string(), "failure to serialize envelope");
            AmqpError::SerializeError(err.to_string())
        })?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut headers);

        debug!(
            exchange = %self.exchange,
            routing_key,
            owner_id = %envelope.owner_id,
            "publishing message"
        );

        self.publish_raw(&self.exchange, &key, &body, FieldTable::from(headers))
            .await
    }
}
