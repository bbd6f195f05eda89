// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Every consumer queue is durable, bound to the application exchange under
//! one or more routing keys, and carries an `x-dead-letter-exchange` argument
//! so that a rejected delivery still ends up in the dead-letter queue.

use crate::{
    errors::AmqpError,
    routing::{contract::DEFAULT_BINDINGS, RoutingKey},
};
use std::collections::BTreeSet;

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) routing_keys: BTreeSet<RoutingKey>,
}

impl QueueDefinition {
    /// Creates a durable queue definition with dead-lettering enabled.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            delete: false,
            exclusive: false,
            routing_keys: BTreeSet::default(),
        }
    }

    /// Binds the queue to the application exchange under `key`.
    ///
    /// Binding the same key twice is a no-op.
    pub fn bind(mut self, key: &str) -> Result<Self, AmqpError> {
        self.routing_keys.insert(RoutingKey::pattern(key)?);
        Ok(self)
    }

    /// Makes the queue exclusive to the connection and auto-deleted.
    ///
    /// Only useful for throwaway test queues.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self.durable = false;
        self.delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_keys(&self) -> impl Iterator<Item = &RoutingKey> {
        self.routing_keys.iter()
    }
}

/// Binding of a queue to an exchange under a routing key or pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// Queue definitions for the marketplace services' fixed bindings.
pub fn default_queues() -> Result<Vec<QueueDefinition>, AmqpError> {
    DEFAULT_BINDINGS
        .iter()
        .map(|(queue, keys)| {
            keys.iter()
                .try_fold(QueueDefinition::new(queue), |def, key| def.bind(key))
        })
        .collect()
}
