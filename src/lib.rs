// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod delivery;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod router;
pub mod routing;
pub mod telemetry;
pub mod topology;

pub use broker::Broker;
pub use config::RabbitMQConfig;
pub use consumer::{FnHandler, Handler};
pub use delivery::Delivery;
pub use envelope::Envelope;
pub use errors::{AmqpError, HandlerError};
pub use publisher::Publisher;
pub use router::{Event, EventHandler, Router};
