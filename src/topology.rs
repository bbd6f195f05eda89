// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology
//!
//! Declares everything the backbone relies on, in an order that guarantees a
//! queue never exists without its dead-letter target:
//!
//! 1. the dead-letter exchange (topic, durable)
//! 2. the dead-letter queue, bound to it with `#`
//! 3. the application exchange (topic, durable)
//! 4. each consumer queue, declared with `x-dead-letter-exchange` and bound to
//!    the application exchange under its routing keys
//!
//! Every declare is idempotent on the broker side. Redeclaring a queue with
//! different arguments fails, and any failure aborts the whole installation.

use crate::{
    channel::AmqpChannel,
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    routing::contract::CATCH_ALL,
};
use async_trait::async_trait;
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};

/// Queue argument naming the exchange rejected messages are routed to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds a consumer queue to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Declares the whole topology on the broker.
    async fn install(&self) -> Result<TopologyHandle, AmqpError>;
}

/// Names of everything an installed topology declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyHandle {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub queues: Vec<String>,
}

impl TopologyHandle {
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q == name)
    }
}

pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    exchange: ExchangeDefinition,
    dead_letter_exchange: ExchangeDefinition,
    dead_letter_queue: String,
    pub(crate) queues: Vec<QueueDefinition>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>, cfg: &RabbitMQConfig) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchange: ExchangeDefinition::new(&cfg.exchange),
            dead_letter_exchange: ExchangeDefinition::new(&cfg.dead_letter_exchange),
            dead_letter_queue: cfg.dead_letter_queue.clone(),
            queues: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Adds a queue definition, replacing an earlier one with the same name.
    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    async fn install(&self) -> Result<TopologyHandle, AmqpError> {
        self.install_dead_letter().await?;

        debug!("creating exchange: {}", self.exchange.name);
        self.channel.declare_exchange(&self.exchange).await?;

        for def in &self.queues {
            self.install_queue(def).await?;
        }

        info!(
            exchange = %self.exchange.name,
            dead_letter_exchange = %self.dead_letter_exchange.name,
            queues = self.queues.len(),
            "topology installed"
        );

        Ok(TopologyHandle {
            exchange: self.exchange.name.clone(),
            dead_letter_exchange: self.dead_letter_exchange.name.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
            queues: self.queues.iter().map(|q| q.name.clone()).collect(),
        })
    }
}

impl AmqpTopology {
    async fn install_dead_letter(&self) -> Result<(), AmqpError> {
        debug!("creating dead letter exchange: {}", self.dead_letter_exchange.name);
        self.channel
            .declare_exchange(&self.dead_letter_exchange)
            .await?;

        debug!("creating dead letter queue: {}", self.dead_letter_queue);
        self.channel
            .declare_queue(
                &self.dead_letter_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .bind_queue(
                &QueueBinding::new(&self.dead_letter_queue)
                    .exchange(&self.dead_letter_exchange.name)
                    .routing_key(CATCH_ALL),
            )
            .await
    }

    async fn install_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        self.channel
            .declare_queue(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                self.queue_args(),
            )
            .await?;

        for key in def.routing_keys() {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                def.name, self.exchange.name, key
            );

            self.channel
                .bind_queue(
                    &QueueBinding::new(&def.name)
                        .exchange(&self.exchange.name)
                        .routing_key(key.as_str()),
                )
                .await?;
        }

        Ok(())
    }

    fn queue_args(&self) -> FieldTable {
        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.dead_letter_exchange.name.clone())),
        );

        FieldTable::from(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use mockall::{predicate::eq, Sequence};

    fn dead_letter_arg(args: &FieldTable) -> Option<&AMQPValue> {
        args.inner()
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
    }

    #[tokio::test]
    async fn installs_in_dependency_order() {
        let mut seq = Sequence::new();
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name == "dlx" && def.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, opts, args| name == "dead_letter_queue" && opts.durable && args.inner().is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_bind_queue()
            .with(eq(QueueBinding::new("dead_letter_queue")
                .exchange("dlx")
                .routing_key("#")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_exchange()
            .withf(|def| def.name == "app" && def.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, opts, args| {
                name == "create_payment_queue"
                    && opts.durable
                    && dead_letter_arg(args)
                        == Some(&AMQPValue::LongString(LongString::from("dlx")))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_bind_queue()
            .with(eq(QueueBinding::new("create_payment_queue")
                .exchange("app")
                .routing_key("order.created")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let queue = QueueDefinition::new("create_payment_queue")
            .bind("order.created")
            .unwrap();

        let handle = AmqpTopology::new(Arc::new(channel), &RabbitMQConfig::default())
            .queue(queue)
            .install()
            .await
            .unwrap();

        assert_eq!(handle.exchange, "app");
        assert_eq!(handle.dead_letter_exchange, "dlx");
        assert!(handle.has_queue("create_payment_queue"));
    }

    #[tokio::test]
    async fn binds_every_routing_key() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().times(2).returning(|_| Ok(()));
        channel.expect_declare_queue().times(2).returning(|_, _, _| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| b.queue_name == "dead_letter_queue")
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_bind_queue()
            .withf(|b| b.queue_name == "notify_order_completed" && b.exchange_name == "app")
            .times(3)
            .returning(|_| Ok(()));

        let queue = QueueDefinition::new("notify_order_completed")
            .bind("order.completed")
            .and_then(|q| q.bind("order.paid"))
            .and_then(|q| q.bind("order.payment.bound"))
            .unwrap();

        AmqpTopology::new(Arc::new(channel), &RabbitMQConfig::default())
            .queue(queue)
            .install()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn declare_failure_aborts_setup() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name.clone())));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let err = AmqpTopology::new(Arc::new(channel), &RabbitMQConfig::default())
            .queue(QueueDefinition::new("q"))
            .install()
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareExchangeError("dlx".to_owned()));
    }

    #[tokio::test]
    async fn queue_redeclared_with_other_arguments_fails_setup() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, _, _| name == "dead_letter_queue")
            .returning(|_, _, _| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|name, _, _| name == "q")
            .returning(|name, _, _| Err(AmqpError::DeclareQueueError(name.to_owned())));

        let err = AmqpTopology::new(Arc::new(channel), &RabbitMQConfig::default())
            .queue(QueueDefinition::new("q").bind("a.b").unwrap())
            .install()
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("q".to_owned()));
    }

    #[test]
    fn later_queue_definition_wins() {
        let topology = AmqpTopology::new(
            Arc::new(MockAmqpChannel::new()),
            &RabbitMQConfig::default(),
        )
        .queue(QueueDefinition::new("q").bind("order.created").unwrap())
        .queue(QueueDefinition::new("q").bind("order.paid").unwrap());

        assert_eq!(topology.queues.len(), 1);
        let keys: Vec<&str> = topology.queues[0].routing_keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["order.paid"]);
    }
}
