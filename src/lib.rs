// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Type-directed RabbitMQ topology: declare exchanges and queues per message type
//! once, then publish and consume by type, across connection recoveries.

mod dispatcher;
mod otel;

pub mod channel;
pub mod codec;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod messaging;
pub mod publisher;
pub mod queue;
pub mod topology;
