// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Operations
//!
//! The topology and publish paths only need four broker operations. They are
//! expressed as the `AmqpChannel` trait so the managers work against any channel
//! implementation; `lapin::Channel` is the production one.
//!
//! A channel that reported a protocol error is closed by the broker and must be
//! discarded, never reused.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel,
};
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// Broker operations used by the exchange manager, queue manager and publisher.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares a durable exchange.
    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError>;

    /// Declares a queue with the given options and arguments.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange using a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), AmqpError>;

    /// Publishes a message body.
    ///
    /// Blocks while the broker has a resource alarm in effect.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl AmqpChannel for Channel {
    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", name);

        self.exchange_declare(
            name,
            kind.into(),
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = name,
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(name.to_owned())
        })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", name);

        match self.queue_declare(name, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}
