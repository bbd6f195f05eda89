// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Router
//!
//! Maps routing keys to typed handlers. The envelope data of a delivery is
//! decoded into the event type registered for its routing key and handed to
//! that handler. A `Router` is itself a `Handler`, so one router serves a
//! queue bound to several keys.
//!
//! Decode failures surface as `HandlerError::Payload` and unknown keys as
//! `HandlerError::Unroutable`; neither is retried.

use crate::{
    consumer::Handler,
    delivery::Delivery,
    errors::{AmqpError, HandlerError},
    routing::RoutingKey,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, future::Future, marker::PhantomData};
use tracing::{debug, warn};

/// A decoded event with the metadata of the delivery that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    pub owner_id: String,
    pub payload: E,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub redelivered: bool,
}

/// Handles one event type.
#[async_trait]
pub trait EventHandler<E: Send + 'static>: Send + Sync {
    async fn handle(&self, ctx: &Context, event: Event<E>) -> Result<(), HandlerError>;
}

#[async_trait]
trait Route: Send + Sync {
    async fn dispatch(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

struct TypedRoute<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> Route for TypedRoute<E, H>
where
    E: DeserializeOwned + Send + 'static,
    H: EventHandler<E>,
{
    async fn dispatch(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        let payload: E = delivery.envelope.decode()?;

        let event = Event {
            owner_id: delivery.envelope.owner_id.clone(),
            payload,
            routing_key: delivery.routing_key.clone(),
            message_id: delivery.message_id.clone(),
            redelivered: delivery.redelivered,
        };

        self.handler.handle(ctx, event).await
    }
}

struct FnEventHandler<F, E> {
    f: F,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<F, E, Fut> EventHandler<E> for FnEventHandler<F, E>
where
    E: Send + 'static,
    F: Fn(Context, Event<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &Context, event: Event<E>) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), event).await
    }
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<RoutingKey, Box<dyn Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for deliveries published under `routing_key`.
    ///
    /// Routes match exact keys, so wildcards are rejected, and a key can only
    /// be registered once.
    pub fn route<E, H>(mut self, routing_key: &str, handler: H) -> Result<Self, AmqpError>
    where
        E: DeserializeOwned + Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let key = RoutingKey::parse(routing_key)?;
        if self.routes.contains_key(&key) {
            return Err(AmqpError::ConfigError(format!(
                "duplicate route `{routing_key}`"
            )));
        }

        debug!(routing_key, "registering route");
        self.routes.insert(
            key,
            Box::new(TypedRoute {
                handler,
                _event: PhantomData,
            }),
        );
        Ok(self)
    }

    /// Registers an async closure for `routing_key`.
    pub fn route_fn<E, F, Fut>(self, routing_key: &str, f: F) -> Result<Self, AmqpError>
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(Context, Event<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.route(
            routing_key,
            FnEventHandler {
                f,
                _event: PhantomData,
            },
        )
    }

    /// Routing keys with a registered handler, sorted.
    pub fn routing_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.routes.keys().map(RoutingKey::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        let route = RoutingKey::parse(&delivery.routing_key)
            .ok()
            .and_then(|key| self.routes.get(&key));

        let Some(route) = route else {
            warn!(routing_key = %delivery.routing_key, "no route for message");
            return Err(HandlerError::Unroutable(delivery.routing_key.clone()));
        };

        route.dispatch(ctx, delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use lapin::types::FieldTable;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        amount: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PaymentSettled {
        payment_id: String,
    }

    #[derive(Default)]
    struct Recorder {
        orders: Mutex<Vec<Event<OrderCreated>>>,
    }

    #[async_trait]
    impl EventHandler<OrderCreated> for Arc<Recorder> {
        async fn handle(
            &self,
            _: &Context,
            event: Event<OrderCreated>,
        ) -> Result<(), HandlerError> {
            self.orders.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn delivery(routing_key: &str, envelope: Envelope) -> Delivery {
        Delivery {
            envelope,
            routing_key: routing_key.to_owned(),
            exchange: "app".to_owned(),
            headers: FieldTable::default(),
            redelivered: false,
            delivery_tag: 7,
            message_id: Some("msg-7".to_owned()),
        }
    }

    #[tokio::test]
    async fn dispatches_typed_event_by_routing_key() {
        let recorder = Arc::new(Recorder::default());
        let settled = Arc::new(Mutex::new(Vec::new()));

        let router = Router::new()
            .route("order.created", recorder.clone())
            .unwrap()
            .route_fn("payment.settled", {
                let settled = settled.clone();
                move |_, event: Event<PaymentSettled>| {
                    let settled = settled.clone();
                    async move {
                        settled.lock().unwrap().push(event.payload.payment_id);
                        Ok(())
                    }
                }
            })
            .unwrap();

        let order = OrderCreated {
            order_id: "o-1".to_owned(),
            amount: 42,
        };
        router
            .handle(
                &Context::new(),
                &delivery("order.created", Envelope::from_event("user-1", &order).unwrap()),
            )
            .await
            .unwrap();

        let orders = recorder.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].owner_id, "user-1");
        assert_eq!(orders[0].payload, order);
        assert_eq!(orders[0].message_id.as_deref(), Some("msg-7"));
        assert!(settled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_routing_key_is_unroutable() {
        let router = Router::new()
            .route("order.created", Arc::new(Recorder::default()))
            .unwrap();

        let err = router
            .handle(
                &Context::new(),
                &delivery("order.paid", Envelope::new("u", b"{}".to_vec())),
            )
            .await
            .unwrap_err();

        assert_eq!(err, HandlerError::Unroutable("order.paid".to_owned()));
    }

    #[tokio::test]
    async fn mismatched_payload_is_a_payload_error() {
        let recorder = Arc::new(Recorder::default());
        let router = Router::new()
            .route("order.created", recorder.clone())
            .unwrap();

        let err = router
            .handle(
                &Context::new(),
                &delivery(
                    "order.created",
                    Envelope::new("u", br#"{"orderId":1}"#.to_vec()),
                ),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Payload(_)));
        assert!(recorder.orders.lock().unwrap().is_empty());
    }

    #[test]
    fn rejects_duplicate_and_wildcard_routes() {
        let router = Router::new()
            .route("order.created", Arc::new(Recorder::default()))
            .unwrap();

        assert!(matches!(
            router.route("order.created", Arc::new(Recorder::default())),
            Err(AmqpError::ConfigError(_))
        ));
        assert_eq!(
            Router::new()
                .route("order.*", Arc::new(Recorder::default()))
                .err(),
            Some(AmqpError::InvalidRoutingKey("order.*".to_owned()))
        );
    }

    #[test]
    fn lists_routing_keys() {
        let router = Router::new()
            .route("payment.settled", Arc::new(Recorder::default()))
            .unwrap()
            .route("order.created", Arc::new(Recorder::default()))
            .unwrap();

        assert_eq!(router.routing_keys(), vec!["order.created", "payment.settled"]);
    }
}
