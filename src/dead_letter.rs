// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Routing
//!
//! When a delivery cannot be processed it is moved to the dead-letter queue
//! together with enough metadata to replay it by hand: why it failed, where it
//! was originally published and how many attempts were made.
//!
//! Header annotations only survive if they travel with a published message, so
//! the router republishes the untouched body with annotated headers to the
//! dead-letter exchange under the original routing key and then acks the
//! original. If that publish fails the delivery is rejected without requeue,
//! and the queue's `x-dead-letter-exchange` argument still routes it to the
//! dead-letter queue, carrying only the broker's own `x-death` header.
//!
//! Deliveries consumed from the dead-letter queue itself are never sent back
//! through the dead-letter exchange; a failure there rejects and drops them.

use crate::{
    channel::AmqpChannel,
    delivery::{Acknowledger, InboundMessage},
    errors::AmqpError,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::sync::Arc;
use tracing::{error, warn};

/// Why the delivery was dead-lettered
pub const AMQP_HEADERS_DEATH_REASON: &str = "x-death-reason";
/// Exchange the delivery was originally published to
pub const AMQP_HEADERS_ORIGIN_EXCHANGE: &str = "x-origin-exchange";
/// Routing key the delivery was originally published with
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Number of processing attempts made before giving up
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header the broker adds when it dead-letters a message itself
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";

/// Returns `headers` plus the dead-letter annotations. Existing headers (trace
/// context included) are kept; annotations from an earlier dead-lettering are
/// overwritten.
pub fn annotate(
    headers: &FieldTable,
    reason: &str,
    attempts: u32,
    original_exchange: &str,
    original_routing_key: &str,
) -> FieldTable {
    let mut annotated = headers.clone();

    annotated.insert(
        ShortString::from(AMQP_HEADERS_DEATH_REASON),
        AMQPValue::LongString(LongString::from(reason.to_owned())),
    );
    annotated.insert(
        ShortString::from(AMQP_HEADERS_ORIGIN_EXCHANGE),
        AMQPValue::LongString(LongString::from(original_exchange.to_owned())),
    );
    annotated.insert(
        ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(original_routing_key.to_owned())),
    );
    annotated.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongLongInt(i64::from(attempts)),
    );

    annotated
}

/// How a delivery reached the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterPath {
    /// Annotated copy published to the dead-letter exchange, original acked
    Republished,
    /// Original rejected without requeue; the broker dead-lettered it
    Rejected,
    /// Already dead-lettered; rejected without requeue and dropped by the
    /// broker, since the dead-letter queue has no dead-letter target
    Discarded,
}

struct DeadLetterTarget {
    channel: Arc<dyn AmqpChannel>,
    exchange: String,
}

pub struct DeadLetterRouter {
    target: Option<DeadLetterTarget>,
}

impl DeadLetterRouter {
    /// Creates a router republishing to `dead_letter_exchange`.
    ///
    /// # Parameters
    /// * `channel` - Channel in confirm mode; the original is only acked once
    ///   the broker confirmed the copy
    /// * `dead_letter_exchange` - Exchange the dead-letter queue is bound to
    ///
    /// # Returns
    /// A router for consumers of application queues
    pub fn new(channel: Arc<dyn AmqpChannel>, dead_letter_exchange: &str) -> Self {
        DeadLetterRouter {
            target: Some(DeadLetterTarget {
                channel,
                exchange: dead_letter_exchange.to_owned(),
            }),
        }
    }

    /// Router for consumers of the dead-letter queue itself. Failed
    /// deliveries are rejected and dropped instead of being sent back to the
    /// queue they came from.
    pub fn discarding() -> Self {
        DeadLetterRouter { target: None }
    }

    /// Moves `message` to the dead-letter queue. Exactly one of
    /// republish-then-ack or reject is performed on the delivery.
    ///
    /// A message that already came through the dead-letter exchange is
    /// rejected, never republished.
    ///
    /// # Parameters
    /// * `message` - The delivery given up on; its body is never changed
    /// * `acker` - Ack handle of the delivery
    /// * `reason` - Last error, written to `x-death-reason`
    /// * `attempts` - Attempts made, written to `x-retry-count`
    ///
    /// # Returns
    /// How the delivery left its queue, or AmqpError when it could not be
    /// settled
    pub async fn route(
        &self,
        message: &InboundMessage,
        acker: &dyn Acknowledger,
        reason: &str,
        attempts: u32,
    ) -> Result<DeadLetterPath, AmqpError> {
        let target = self
            .target
            .as_ref()
            .filter(|target| target.exchange != message.exchange);

        let Some(target) = target else {
            warn!(
                routing_key = %message.routing_key,
                exchange = %message.exchange,
                reason,
                "dead-lettered msg failed again, discarding"
            );
            acker.reject().await?;
            return Ok(DeadLetterPath::Discarded);
        };

        let headers = annotate(
            &message.headers(),
            reason,
            attempts,
            &message.exchange,
            &message.routing_key,
        );

        let published = target
            .channel
            .publish(
                &target.exchange,
                &message.routing_key,
                &message.body,
                message.properties.clone().with_headers(headers),
            )
            .await;

        match published {
            Ok(()) => {
                if let Err(err) = acker.ack().await {
                    // the annotated copy is already in the dlq, a redelivery of the
                    // original will be dead-lettered again
                    error!(error = err.to_string(), "error to ack dead-lettered msg");
                    return Err(err);
                }
                Ok(DeadLetterPath::Republished)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    routing_key = %message.routing_key,
                    "failure to publish to dlx, rejecting instead"
                );

                acker.reject().await.map_err(|reject_err| {
                    error!(error = reject_err.to_string(), "error to reject msg");
                    AmqpError::PublishingToDLXError
                })?;
                Ok(DeadLetterPath::Rejected)
            }
        }
    }
}

/// A message read back from the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub body: Vec<u8>,
    pub reason: String,
    pub original_exchange: String,
    pub original_routing_key: String,
    pub retry_count: i64,
}

impl DeadLetterRecord {
    /// Rebuilds the record from a dead-lettered message.
    ///
    /// Prefers the annotation headers and falls back to the broker's `x-death`
    /// entry for messages that were rejected instead of republished.
    pub fn from_message(headers: &FieldTable, body: &[u8]) -> Result<Self, AmqpError> {
        let table = headers.inner();

        if table.contains_key(&ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY)) {
            return Ok(DeadLetterRecord {
                body: body.to_vec(),
                reason: string_header(headers, AMQP_HEADERS_DEATH_REASON).unwrap_or_default(),
                original_exchange: string_header(headers, AMQP_HEADERS_ORIGIN_EXCHANGE)
                    .ok_or_else(|| missing(AMQP_HEADERS_ORIGIN_EXCHANGE))?,
                original_routing_key: string_header(headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY)
                    .ok_or_else(|| missing(AMQP_HEADERS_ORIGINAL_ROUTING_KEY))?,
                retry_count: int_value(table.get(&ShortString::from(AMQP_HEADERS_RETRY_COUNT)))
                    .unwrap_or_default(),
            });
        }

        let death = table
            .get(&ShortString::from(AMQP_HEADERS_X_DEATH))
            .and_then(|value| value.as_array())
            .and_then(|entries| entries.as_slice().first())
            .and_then(|entry| entry.as_field_table())
            .ok_or_else(|| missing(AMQP_HEADERS_ORIGINAL_ROUTING_KEY))?;

        let original_routing_key = death
            .inner()
            .get(&ShortString::from("routing-keys"))
            .and_then(|value| value.as_array())
            .and_then(|keys| keys.as_slice().first())
            .and_then(as_string)
            .ok_or_else(|| missing("x-death.routing-keys"))?;

        Ok(DeadLetterRecord {
            body: body.to_vec(),
            reason: string_header(death, "reason").unwrap_or_default(),
            original_exchange: string_header(death, "exchange")
                .ok_or_else(|| missing("x-death.exchange"))?,
            original_routing_key,
            retry_count: int_value(death.inner().get(&ShortString::from("count")))
                .unwrap_or_default(),
        })
    }
}

fn missing(header: &str) -> AmqpError {
    AmqpError::MissingDeadLetterHeader(header.to_owned())
}

fn string_header(headers: &FieldTable, key: &str) -> Option<String> {
    headers.inner().get(&ShortString::from(key)).and_then(as_string)
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

fn int_value(value: Option<&AMQPValue>) -> Option<i64> {
    match value? {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
