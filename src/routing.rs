// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Keys
//!
//! Dot-namespaced routing keys (`order.created`, `payment.completed`) and the
//! fixed exchange, queue and key names shared by the marketplace services.

use crate::errors::AmqpError;
use std::fmt;

/// A validated, publishable routing key.
///
/// Publishing never uses wildcards: every word is non-empty and free of `*`
/// and `#`. Binding patterns go through [`RoutingKey::pattern`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn parse(key: &str) -> Result<Self, AmqpError> {
        if key.is_empty() || key.len() > 255 {
            return Err(AmqpError::InvalidRoutingKey(key.to_owned()));
        }

        let valid = key.split('.').all(|word| {
            !word.is_empty() && !word.contains(['*', '#']) && !word.contains(char::is_whitespace)
        });

        if !valid {
            return Err(AmqpError::InvalidRoutingKey(key.to_owned()));
        }

        Ok(RoutingKey(key.to_owned()))
    }

    /// Accepts binding patterns, where a word may be `*` or `#`.
    pub fn pattern(key: &str) -> Result<Self, AmqpError> {
        if key.is_empty() || key.len() > 255 {
            return Err(AmqpError::InvalidRoutingKey(key.to_owned()));
        }

        let valid = key.split('.').all(|word| {
            word == "*" || word == "#" || (!word.is_empty() && !word.contains(['*', '#']))
        });

        if !valid {
            return Err(AmqpError::InvalidRoutingKey(key.to_owned()));
        }

        Ok(RoutingKey(key.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Names every service must agree on.
pub mod contract {
    /// Application topic exchange
    pub const APP_EXCHANGE: &str = "app";
    /// Dead-letter topic exchange
    pub const DEAD_LETTER_EXCHANGE: &str = "dlx";
    /// Single queue collecting every dead-lettered message
    pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";
    /// Binding pattern catching every routing key
    pub const CATCH_ALL: &str = "#";

    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_COMPLETED: &str = "order.completed";
    pub const ORDER_PAYMENT_BOUND: &str = "order.payment.bound";
    pub const ORDER_PAID: &str = "order.paid";
    pub const PAYMENT_CREATED: &str = "payment.created";
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const PAYMENT_SETTLED: &str = "payment.settled";
    pub const CHAT_MESSAGE_INCOMING: &str = "chat.message.incoming";
    pub const CHAT_MESSAGE_OUTGOING: &str = "chat.message.outgoing";

    pub const CREATE_PAYMENT_QUEUE: &str = "create_payment_queue";
    pub const UPDATE_ORDER_STATUS_QUEUE: &str = "update_order_status_queue";
    pub const UPDATE_PAYMENT_ID_QUEUE: &str = "update_payment_id_queue";
    pub const SETTLE_PAYMENT_QUEUE: &str = "settle_payment_queue";
    pub const CHAT_MESSAGE_INCOMING_QUEUE: &str = "chat_message_incoming_queue";
    pub const CHAT_MESSAGE_OUTGOING_QUEUE: &str = "chat_message_outgoing_queue";
    pub const NOTIFY_CREATE_PAYMENT_QUEUE: &str = "notify_create_payment";
    pub const NOTIFY_ORDER_COMPLETED_QUEUE: &str = "notify_order_completed";

    /// Queue → routing keys used by the marketplace services.
    pub const DEFAULT_BINDINGS: &[(&str, &[&str])] = &[
        (CREATE_PAYMENT_QUEUE, &[ORDER_CREATED]),
        (UPDATE_ORDER_STATUS_QUEUE, &[PAYMENT_COMPLETED]),
        (UPDATE_PAYMENT_ID_QUEUE, &[PAYMENT_CREATED]),
        (SETTLE_PAYMENT_QUEUE, &[ORDER_COMPLETED]),
        (CHAT_MESSAGE_INCOMING_QUEUE, &[CHAT_MESSAGE_INCOMING]),
        (CHAT_MESSAGE_OUTGOING_QUEUE, &[CHAT_MESSAGE_OUTGOING]),
        (NOTIFY_CREATE_PAYMENT_QUEUE, &[PAYMENT_CREATED]),
        (NOTIFY_ORDER_COMPLETED_QUEUE, &[ORDER_COMPLETED, ORDER_PAYMENT_BOUND, ORDER_PAID]),
    ];
}
