// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topology Layer
//!
//! `AmqpError` covers every failing broker operation the crate performs, plus
//! the declaration lookup failure raised when a type was never declared.
//! `HandlerError` is what consumer handlers report back to the consume loop.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Operation requested before `connect` or after `shutdown`
    #[error("connection is not established")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// No exchange or queue declaration registered for the given type
    #[error("{kind} declaration for type `{type_name}` is not found")]
    DeclarationNotFound {
        kind: &'static str,
        type_name: &'static str,
    },

    /// Two declarations of the same kind registered for one type
    #[error("{kind} declaration for type `{type_name}` is registered twice")]
    DuplicateDeclaration {
        kind: &'static str,
        type_name: &'static str,
    },

    /// Error serializing a value into a message body
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),
}

/// Failure reported by a consumer handler.
///
/// `Duplicate` tells the consume loop that the message was already processed,
/// which acknowledges it like a success. `Failed` leaves the delivery unacked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("duplicate message: {0}")]
    Duplicate(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(err: impl ToString) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_not_found_names_the_type() {
        let err = AmqpError::DeclarationNotFound {
            kind: "exchange",
            type_name: "app::Event",
        };

        assert_eq!(
            err.to_string(),
            "exchange declaration for type `app::Event` is not found"
        );
    }

    #[test]
    fn binding_error_names_queue_and_exchange() {
        let err = AmqpError::BindingExchangeToQueueError("events.fanout".into(), "q1".into());

        assert_eq!(
            err.to_string(),
            "failure to bind queue `q1` to exchange `events.fanout`"
        );
    }
}
