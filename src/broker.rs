// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! Composition root of the backbone. `Broker::connect` opens the connection,
//! installs the topology and builds the publisher, in that order, so nothing
//! publishes or consumes before the exchanges and queues exist. Services get
//! the broker (or the publisher it hands out) passed in explicitly; there is
//! no process-wide client.

use crate::{
    channel::{AmqpChannel, AmqpConnection},
    config::RabbitMQConfig,
    consumer::{AmqpConsumer, Handler},
    dead_letter::{DeadLetterRecord, DeadLetterRouter},
    errors::AmqpError,
    publisher::AmqpPublisher,
    queue::QueueDefinition,
    routing::RoutingKey,
    topology::{AmqpTopology, Topology, TopologyHandle},
};
use lapin::types::FieldTable;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Broker {
    cfg: RabbitMQConfig,
    connection: AmqpConnection,
    publisher: Arc<AmqpPublisher>,
    topology: TopologyHandle,
    cancel: CancellationToken,
}

impl Broker {
    /// Connects and declares the topology with `queues` as consumer queues.
    ///
    /// Any failure closes the connection and is returned; a broker is never
    /// handed out half set up.
    ///
    /// # Parameters
    /// * `cfg` - Broker settings
    /// * `queues` - Consumer queues to declare and bind
    ///
    /// # Returns
    /// The ready broker or the first connection or setup error
    pub async fn connect(
        cfg: RabbitMQConfig,
        queues: Vec<QueueDefinition>,
    ) -> Result<Broker, AmqpError> {
        let connection = AmqpConnection::open(&cfg).await?;
        let channel: Arc<dyn AmqpChannel> = connection.publish_channel();

        let topology = queues
            .into_iter()
            .fold(AmqpTopology::new(channel.clone(), &cfg), |topology, def| {
                topology.queue(def)
            });

        let topology = match topology.install().await {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = close_err.to_string(), "failure to close connection");
                }
                return Err(err);
            }
        };

        let publisher = AmqpPublisher::new(channel, &cfg.exchange, &cfg.app_name);

        info!(app = %cfg.app_name, "broker ready");

        Ok(Broker {
            cfg,
            connection,
            publisher,
            topology,
            cancel: CancellationToken::new(),
        })
    }

    pub fn publisher(&self) -> Arc<AmqpPublisher> {
        self.publisher.clone()
    }

    pub fn topology(&self) -> &TopologyHandle {
        &self.topology
    }

    pub fn config(&self) -> &RabbitMQConfig {
        &self.cfg
    }

    /// Token cancelled by `close`; consumers get child tokens of it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Builds a consumer for `queue` on a channel of its own.
    ///
    /// A consumer of the dead-letter queue drops deliveries its handler
    /// fails on instead of dead-lettering them again.
    ///
    /// # Parameters
    /// * `queue` - An installed consumer queue or the dead-letter queue
    ///
    /// # Returns
    /// The consumer, or ConfigError for a queue outside the topology
    pub async fn consumer(&self, queue: &str) -> Result<AmqpConsumer, AmqpError> {
        if !self.topology.has_queue(queue) && queue != self.topology.dead_letter_queue {
            return Err(AmqpError::ConfigError(format!(
                "queue `{queue}` is not part of the topology"
            )));
        }

        let channel = self.connection.consumer_channel().await?;
        let dead_letter = if queue == self.topology.dead_letter_queue {
            DeadLetterRouter::discarding()
        } else {
            DeadLetterRouter::new(channel.clone(), &self.cfg.dead_letter_exchange)
        };

        Ok(AmqpConsumer::new(
            channel,
            dead_letter,
            self.cfg.retry_policy(),
            self.cancel.child_token(),
        ))
    }

    /// Starts consuming `queue` on its own task.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume, see `consumer`
    /// * `handler` - Business logic invoked for every delivery
    ///
    /// # Returns
    /// Handle of the task, which ends when the subscription ends or the
    /// broker is closed
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<JoinHandle<Result<(), AmqpError>>, AmqpError> {
        let consumer = self.consumer(queue).await?;
        let queue = queue.to_owned();

        Ok(tokio::spawn(async move {
            consumer.consume(&queue, handler).await
        }))
    }

    /// Publishes a dead-lettered message back to its original exchange and
    /// routing key.
    pub async fn replay(&self, record: &DeadLetterRecord) -> Result<(), AmqpError> {
        let key = RoutingKey::parse(&record.original_routing_key)?;

        info!(
            exchange = %record.original_exchange,
            routing_key = %key,
            retry_count = record.retry_count,
            "replaying dead-lettered message"
        );

        self.publisher
            .publish_raw(&record.original_exchange, &key, &record.body, FieldTable::default())
            .await
    }

    /// Stops every consumer and closes the connection. Unacked deliveries are
    /// requeued by the broker. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.cancel.cancel();
        self.connection.close().await
    }
}
