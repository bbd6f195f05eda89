// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Subscribes to a queue with manual acknowledgment and prefetch 1, and drives
//! every delivery through the retry policy around a caller-supplied handler.
//!
//! Per delivery the outcome is one of:
//! - `Acked`: an attempt succeeded, the delivery is removed from the queue.
//! - `DeadLettered`: retries ran out or the failure was permanent (including
//!   undecodable bodies); the delivery was moved to the dead-letter queue.
//! - `InDoubt`: cancellation fired during a backoff wait; the delivery is left
//!   unacknowledged and the broker redelivers it once the channel closes.
//!
//! Handler errors stay inside the consumer; they are never returned from
//! `consume`.

use crate::{
    dead_letter::{DeadLetterPath, DeadLetterRouter},
    delivery::{Acknowledger, Delivery, InboundMessage},
    errors::{AmqpError, HandlerError},
    otel,
    retry::{RetryError, RetryPolicy},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Business logic invoked for every delivery of a queue.
///
/// Deliveries are at-least-once: a crash between a successful `handle` and
/// the ack redelivers the message, so implementations must be idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a `Handler`.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(f: F) -> Arc<FnHandler<F>> {
        Arc::new(FnHandler { f })
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), delivery.clone()).await
    }
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked { attempts: u32 },
    DeadLettered { attempts: u32, path: DeadLetterPath },
    InDoubt { attempts: u32 },
}

/// Runs a single delivery to its terminal state. Holds no broker channel of
/// its own, only the dead-letter router.
pub struct DeliveryProcessor {
    dead_letter: DeadLetterRouter,
    retry: RetryPolicy,
    cancel: CancellationToken,
    tracer: BoxedTracer,
}

impl DeliveryProcessor {
    pub fn new(
        dead_letter: DeadLetterRouter,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        DeliveryProcessor {
            dead_letter,
            retry,
            cancel,
            tracer: global::tracer(otel::TRACER_NAME),
        }
    }

    /// Decodes, handles with retries and settles `message` exactly once
    /// (or not at all when cancelled).
    ///
    /// # Parameters
    /// * `queue` - Queue the message was consumed from, recorded on the span
    /// * `message` - The raw delivery
    /// * `acker` - Ack handle of the delivery
    /// * `handler` - Business logic to run
    ///
    /// # Returns
    /// The terminal state of the delivery, or AmqpError when settling it on
    /// the broker failed
    pub async fn process(
        &self,
        queue: &str,
        message: &InboundMessage,
        acker: &dyn Acknowledger,
        handler: &dyn Handler,
    ) -> Result<Outcome, AmqpError> {
        let (ctx, mut span) =
            otel::consumer_span(&message.headers(), &self.tracer, queue, &message.routing_key);

        debug!(
            queue,
            routing_key = %message.routing_key,
            exchange = %message.exchange,
            redelivered = message.redelivered,
            "received message"
        );

        let delivery = match message.decode() {
            Ok(delivery) => delivery,
            Err(err) => {
                let err = HandlerError::from(err);
                warn!(error = err.to_string(), "failure to decode envelope");
                return self
                    .dead_letter(message, acker, &err, 1, &mut span)
                    .await;
            }
        };

        let result = {
            let ctx = &ctx;
            let delivery = &delivery;
            self.retry
                .execute(&self.cancel, move |attempt| {
                    debug!(attempt, "handling message");
                    handler.handle(ctx, delivery)
                })
                .await
        };

        match result {
            Ok(attempts) => {
                if let Err(err) = acker.ack().await {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    return Err(err);
                }

                if attempts > 1 {
                    info!(attempts, "message processed after retries");
                } else {
                    debug!("message successfully processed");
                }
                span.set_status(Status::Ok);
                Ok(Outcome::Acked { attempts })
            }

            Err(RetryError::Cancelled { attempts, last }) => {
                warn!(
                    attempts,
                    error = last.to_string(),
                    "cancelled while backing off, leaving message unacked"
                );
                span.set_status(Status::Error {
                    description: Cow::from("cancelled"),
                });
                Ok(Outcome::InDoubt { attempts })
            }

            Err(err) => {
                let attempts = err.attempts();
                let last = err.into_last_error();
                self.dead_letter(message, acker, &last, attempts, &mut span)
                    .await
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        acker: &dyn Acknowledger,
        err: &HandlerError,
        attempts: u32,
        span: &mut BoxedSpan,
    ) -> Result<Outcome, AmqpError> {
        error!(
            attempts,
            error = err.to_string(),
            routing_key = %message.routing_key,
            "giving up on message, sending to dlq"
        );
        span.record_error(err);

        let path = self
            .dead_letter
            .route(message, acker, &err.to_string(), attempts)
            .await
            .inspect_err(|route_err| span.record_error(route_err))?;

        span.set_status(Status::Error {
            description: Cow::from("msg was sent to dlq"),
        });
        Ok(Outcome::DeadLettered { attempts, path })
    }
}

/// Unacknowledged deliveries the broker pushes to a consumer
pub const PREFETCH_COUNT: u16 = 1;

/// A consumer bound to its own channel.
pub struct AmqpConsumer {
    channel: Arc<Channel>,
    processor: DeliveryProcessor,
    cancel: CancellationToken,
}

impl AmqpConsumer {
    /// Creates a consumer on `channel`.
    ///
    /// # Parameters
    /// * `channel` - Channel owned by this consumer alone, in confirm mode so
    ///   dead-letter copies are confirmed before the original is acked
    /// * `dead_letter` - Router used once a delivery is given up on
    /// * `retry` - Retry policy wrapped around the handler
    /// * `cancel` - Stops the subscription and aborts backoff waits
    ///
    /// # Returns
    /// A consumer ready to `consume` a queue
    pub fn new(
        channel: Arc<Channel>,
        dead_letter: DeadLetterRouter,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> AmqpConsumer {
        AmqpConsumer {
            channel,
            processor: DeliveryProcessor::new(dead_letter, retry, cancel.clone()),
            cancel,
        }
    }

    /// Consumes `queue` until the subscription ends or the consumer is
    /// cancelled.
    ///
    /// The broker admits a single unacknowledged delivery at a time, so
    /// deliveries of a queue are handled one after the other in FIFO order.
    ///
    /// # Parameters
    /// * `queue` - Name of a queue declared by the topology
    /// * `handler` - Business logic invoked for every delivery
    ///
    /// # Returns
    /// Ok(()) when the stream ends or on cancellation, AmqpError when the
    /// subscription cannot be set up or the stream fails.
    pub async fn consume(&self, queue: &str, handler: Arc<dyn Handler>) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        info!(queue, consumer_tag = %tag, "consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(queue, "consumer cancelled");
                    return Ok(());
                }
                next = consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue, "errors consume msg");
                    return Err(AmqpError::ConsumerError(err.to_string()));
                }
                None => {
                    debug!(queue, "subscription ended");
                    return Ok(());
                }
            };

            let (message, acker) = InboundMessage::from_lapin(delivery);
            match self
                .processor
                .process(queue, &message, &acker, handler.as_ref())
                .await
            {
                Ok(Outcome::InDoubt { .. }) => return Ok(()),
                Ok(_) => {}
                Err(err) => error!(error = err.to_string(), queue, "error consume msg"),
            }
        }
    }
}
