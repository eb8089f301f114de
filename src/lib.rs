// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable RabbitMQ client: confirmed publishing, bounded application-level
//! retry with dead-lettering, poison message isolation and lifecycle events
//! for every settled delivery.

mod otel;
mod settlement;

pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod logging;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;
