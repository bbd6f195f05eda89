// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! `AmqpConnection` owns the single broker connection. It opens one dedicated
//! publish channel up front and hands every consumer a channel of its own, so
//! publishing and consuming never share a channel.
//!
//! The `AmqpChannel` trait is the narrow set of channel operations the rest of
//! the crate needs. It is implemented for `lapin::Channel` and mocked in tests.

use crate::{
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueBinding,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, warn};

/// Reply code sent to the broker on a normal close
const REPLY_SUCCESS: u16 = 200;

/// Channel operations used by the topology, the publisher and the
/// dead-letter router.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message and, when the channel is in confirm mode, waits for
    /// the broker to confirm it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl AmqpChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.exchange_declare(
            &def.name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), name = %def.name, "error to declare the exchange");
            AmqpError::DeclareExchangeError(def.name.clone())
        })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.queue_declare(name, options, args).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange,
                    routing_key,
                    "error publishing message"
                );
                AmqpError::PublishingError(err.to_string())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error waiting publish confirmation");
            AmqpError::PublishingError(err.to_string())
        })?;

        if confirmation.is_nack() {
            warn!(exchange, routing_key, "publish nacked by the broker");
            return Err(AmqpError::PublishNacked);
        }

        Ok(())
    }
}

/// The broker connection and its publish channel.
pub struct AmqpConnection {
    connection: Connection,
    publish_channel: Arc<Channel>,
    closed: AtomicBool,
}

impl AmqpConnection {
    /// Connects to the broker and opens the publish channel.
    ///
    /// Fails fast: an unreachable broker or a channel error is returned at
    /// once, and a half-open connection is closed before returning.
    ///
    /// # Parameters
    /// * `cfg` - Broker URI, connection name and publisher confirm setting
    ///
    /// # Returns
    /// The open connection, or ConnectionError / ChannelError
    pub async fn open(cfg: &RabbitMQConfig) -> Result<AmqpConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app_name.clone()));

        let connection = Connection::connect(&cfg.uri, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;
        debug!("amqp connected");

        let publish_channel = match Self::publish_channel_for(&connection, cfg.confirms).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "setup failed").await {
                    warn!(error = close_err.to_string(), "failure to close connection");
                }
                return Err(err);
            }
        };

        Ok(AmqpConnection {
            connection,
            publish_channel: Arc::new(publish_channel),
            closed: AtomicBool::new(false),
        })
    }

    async fn publish_channel_for(
        connection: &Connection,
        confirms: bool,
    ) -> Result<Channel, AmqpError> {
        debug!("creating publish channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        if confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to enable publisher confirms");
                    AmqpError::ChannelError(err.to_string())
                })?;
        }

        debug!("publish channel created");
        Ok(channel)
    }

    /// The channel reserved for publishing. Callers serialize access to it.
    pub fn publish_channel(&self) -> Arc<Channel> {
        self.publish_channel.clone()
    }

    /// Opens a new channel for a single consumer.
    ///
    /// The channel is always in confirm mode: the consumer publishes
    /// dead-letter copies on it and must know the broker accepted a copy
    /// before acking the original.
    ///
    /// # Returns
    /// The channel, ConnectionClosed after `close`, or ChannelError
    pub async fn consumer_channel(&self) -> Result<Arc<Channel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosed);
        }

        let channel = self.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the consumer channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable consumer channel confirms");
                AmqpError::ChannelError(err.to_string())
            })?;

        debug!(id = channel.id(), "consumer channel created");
        Ok(Arc::new(channel))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.connection.status().connected()
    }

    /// Closes the publish channel and the connection.
    ///
    /// Closing the connection also closes every consumer channel, which makes
    /// the broker requeue any delivery still unacknowledged. Calling this more
    /// than once is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing amqp connection...");
        if let Err(err) = self.publish_channel.close(REPLY_SUCCESS, "closing").await {
            warn!(error = err.to_string(), "failure to close publish channel");
        }

        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}
