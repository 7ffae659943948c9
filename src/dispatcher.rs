// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch Loop
//!
//! Every consumer runs on its own channel and task. When its delivery stream
//! ends because the connection went away, the task waits for the connection
//! manager to publish a recovered generation and attaches a new consumer with
//! the same tag. The task ends after `shutdown`.

use crate::{
    codec::Codec,
    connection::{ConnectionManager, ConnectionState, ConnectionStatus},
    consumer::{consume, ConsumerHandler, DuplicateDetector, PREFETCH_COUNT},
    errors::AmqpError,
    otel::CONSUMER_TRACER,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Consumer,
};
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Consumer attached to a queue, with the channel that must outlive it.
pub(crate) struct Subscription {
    channel: Channel,
    consumer: Consumer,
}

/// Opens a dedicated channel, limits its prefetch and starts a consumer on it.
pub(crate) async fn subscribe(
    connection: &ConnectionManager,
    queue: &str,
    tag: &str,
) -> Result<Subscription, AmqpError> {
    let channel = connection.create_channel().await?;

    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to configure qos");
            AmqpError::QoSDeclarationError(queue.to_owned())
        })?;

    let consumer = channel
        .basic_consume(
            queue,
            tag,
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
            AmqpError::BindingConsumerError(tag.to_owned())
        })?;

    info!(queue, tag, "consumer launched");

    Ok(Subscription { channel, consumer })
}

/// Waits for a connection newer than `generation`.
///
/// Returns the new generation once the connection is `Connected` again, `None`
/// once it is `Closed` or the manager is gone.
pub(crate) async fn next_generation(
    status: &mut watch::Receiver<ConnectionStatus>,
    generation: u64,
) -> Option<u64> {
    let current = status
        .wait_for(|s| {
            s.state == ConnectionState::Closed
                || (s.state == ConnectionState::Connected && s.generation > generation)
        })
        .await
        .ok()?;

    match current.state {
        ConnectionState::Closed => None,
        _ => Some(current.generation),
    }
}

/// Drives a consumer until shutdown, re-subscribing after every recovery.
pub(crate) async fn dispatch<T, K, H>(
    connection: Arc<ConnectionManager>,
    mut subscription: Subscription,
    queue: String,
    tag: String,
    codec: Arc<K>,
    handler: Arc<H>,
    is_duplicate: DuplicateDetector,
) where
    T: DeserializeOwned + Send + 'static,
    K: Codec,
    H: ConsumerHandler<T> + ?Sized,
{
    let tracer = global::tracer(CONSUMER_TRACER);
    let mut status = connection.subscribe();
    let mut generation = status.borrow_and_update().generation;

    loop {
        while let Some(result) = subscription.consumer.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) =
                        consume::<T, K, H>(&tracer, &delivery, &*codec, &*handler, &is_duplicate)
                            .await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    break;
                }
            }
        }

        warn!(
            queue = queue.as_str(),
            tag = tag.as_str(),
            channel = subscription.channel.id(),
            "consumer stream ended"
        );

        subscription = loop {
            let Some(next) = next_generation(&mut status, generation).await else {
                info!(tag = tag.as_str(), "consumer stopped");
                return;
            };
            generation = next;

            match subscribe(&connection, &queue, &tag).await {
                Ok(next) => break next,
                Err(err) => error!(
                    error = err.to_string(),
                    tag = tag.as_str(),
                    "failure to re-attach consumer"
                ),
            }
        };
    }
}
