// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Type-Directed Publisher
//!
//! The exchange and routing key of a message are resolved from the queue declared
//! for the type of the published value; a queue bound to no exchange is reached
//! through the default exchange. An explicit routing key goes to the exchange
//! declared for the type instead.
//!
//! A missing declaration fails before anything is sent; broker and serialization
//! failures are logged and swallowed, publishing never fails once the route is
//! known.
//!
//! Publishing to a non-existent exchange closes the channel. Publishing blocks
//! while the broker has a resource alarm in effect.

use crate::{
    channel::AmqpChannel,
    codec::{Codec, JsonCodec},
    errors::AmqpError,
    otel,
    topology::{short_type_name, Topology},
};
use lapin::{types::ShortString, BasicProperties, Channel};
use opentelemetry::Context;
use serde::Serialize;
use std::{any::type_name, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP delivery mode for messages persisted by the broker
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct Publisher<C: AmqpChannel = Channel, K: Codec = JsonCodec> {
    channel: Arc<C>,
    topology: Arc<Topology>,
    codec: Arc<K>,
}

impl<C: AmqpChannel, K: Codec> Publisher<C, K> {
    /// Creates a publisher sending on `channel`.
    ///
    /// # Parameters
    /// * `channel` - Channel used for every publish, not shared with other users
    /// * `topology` - Installed topology the routes are resolved from
    /// * `codec` - Encoder of the message bodies
    ///
    /// # Returns
    /// A new Publisher instance
    pub fn new(channel: Arc<C>, topology: Arc<Topology>, codec: Arc<K>) -> Self {
        Publisher {
            channel,
            topology,
            codec,
        }
    }

    /// Publishes `value` to the exchange and routing key declared for its type.
    pub async fn publish<T>(&self, value: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let queue = self.topology.queue::<T>().await?;
        self.send(&queue.exchange, &queue.routing_key, value, None).await;
        Ok(())
    }

    /// Publishes `value` to the exchange declared for its type with an explicit routing key.
    pub async fn publish_with_key<T>(&self, value: &T, routing_key: &str) -> Result<(), AmqpError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let exchange = self.topology.exchange::<T>().await?;
        self.send(&exchange, routing_key, value, None).await;
        Ok(())
    }

    /// Publishes with caller supplied properties. The declared routing key is used
    /// when `routing_key` is `None`.
    pub async fn publish_with_properties<T>(
        &self,
        value: &T,
        routing_key: Option<&str>,
        properties: BasicProperties,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let (exchange, key) = match routing_key {
            Some(key) => (self.topology.exchange::<T>().await?, key.to_owned()),
            None => {
                let queue = self.topology.queue::<T>().await?;
                (queue.exchange, queue.routing_key)
            }
        };

        self.send(&exchange, &key, value, Some(properties)).await;
        Ok(())
    }

    async fn send<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        properties: Option<BasicProperties>,
    ) where
        T: Serialize + 'static,
    {
        let payload = match self.codec.encode(value) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return;
            }
        };

        let properties = properties.unwrap_or_else(|| self.default_properties::<T>());
        let headers = otel::inject_context(&Context::current(), properties.headers().as_ref());

        match self
            .channel
            .publish(exchange, routing_key, &payload, properties.with_headers(headers))
            .await
        {
            Ok(()) => debug!(exchange, routing_key, "message published"),
            Err(err) => error!(
                error = err.to_string(),
                exchange, routing_key, "error publishing message"
            ),
        }
    }

    fn default_properties<T: 'static>(&self) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from(self.codec.content_type()))
            .with_type(ShortString::from(short_type_name(type_name::<T>())))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        codec::JSON_CONTENT_TYPE,
        consumer::{default_duplicate_detector, process, Disposition},
        errors::HandlerError,
        exchange::{ExchangeDeclaration, ExchangeKind},
        queue::{ConsumerScope, QueueDeclaration},
        topology::TopologyDeclarations,
    };
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct VideoUploaded {
        id: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct AudioUploaded {
        id: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct JobScheduled {
        id: u64,
    }

    #[derive(Serialize)]
    struct Undeclared;

    async fn topology() -> Arc<Topology> {
        let events = ExchangeDeclaration::of::<VideoUploaded>("events", ExchangeKind::Fanout);
        let audio = ExchangeDeclaration::of::<AudioUploaded>("audio", ExchangeKind::Direct);
        let topology = Topology::new(TopologyDeclarations::new(
            vec![events.clone(), audio.clone()],
            vec![
                QueueDeclaration::of::<VideoUploaded>("q1", ConsumerScope::new("media"))
                    .exchange(events),
                QueueDeclaration::of::<AudioUploaded>("audio.tracks", ConsumerScope::new("media"))
                    .routing_key("tracks")
                    .exchange(audio),
                QueueDeclaration::of::<JobScheduled>("jobs", ConsumerScope::new("scheduler")),
            ],
        ))
        .unwrap();

        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_, _| Ok(()));
        channel.expect_declare_queue().returning(|_, _, _| Ok(()));
        channel.expect_bind_queue().returning(|_, _, _| Ok(()));
        topology.install(&channel).await.unwrap();

        Arc::new(topology)
    }

    fn publisher(channel: MockAmqpChannel, topology: Arc<Topology>) -> Publisher<MockAmqpChannel> {
        Publisher::new(Arc::new(channel), topology, Arc::new(JsonCodec))
    }

    #[tokio::test]
    async fn publish_routes_by_value_type() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange: &str, key: &str, payload: &[u8], props: &BasicProperties| {
                exchange == "events.fanout"
                    && key == "q1"
                    && payload == br#"{"id":1}"#
                    && props.content_type() == &Some(ShortString::from(JSON_CONTENT_TYPE))
                    && props.kind() == &Some(ShortString::from("VideoUploaded"))
                    && props.message_id().is_some()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange: &str, key: &str, _: &[u8], _: &BasicProperties| {
                exchange == "audio.direct" && key == "tracks"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = publisher(channel, topology().await);

        publisher.publish(&VideoUploaded { id: 1 }).await.unwrap();
        publisher.publish(&AudioUploaded { id: 2 }).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_routing_key_overrides_declared_one() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange: &str, key: &str, _: &[u8], _: &BasicProperties| {
                exchange == "audio.direct" && key == "podcasts"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = publisher(channel, topology().await);

        publisher
            .publish_with_key(&AudioUploaded { id: 3 }, "podcasts")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn caller_properties_are_sent_as_given() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|_: &str, key: &str, _: &[u8], props: &BasicProperties| {
                key == "q1"
                    && props.correlation_id() == &Some(ShortString::from("req-9"))
                    && props.message_id().is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = publisher(channel, topology().await);

        publisher
            .publish_with_properties(
                &VideoUploaded { id: 4 },
                None,
                BasicProperties::default().with_correlation_id(ShortString::from("req-9")),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn undeclared_type_fails_before_sending() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_publish().never();

        let publisher = publisher(channel, topology().await);

        let result = publisher.publish(&Undeclared).await;

        assert_eq!(
            result,
            Err(AmqpError::DeclarationNotFound {
                kind: "queue",
                type_name: type_name::<Undeclared>(),
            })
        );
        assert!(publisher.publish_with_key(&Undeclared, "any").await.is_err());
    }

    #[tokio::test]
    async fn queue_without_exchange_is_published_through_default_exchange() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange: &str, key: &str, _: &[u8], _: &BasicProperties| {
                exchange.is_empty() && key == "jobs"
            })
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let publisher = publisher(channel, topology().await);

        assert_eq!(publisher.publish(&JobScheduled { id: 1 }).await, Ok(()));
        assert_eq!(
            publisher
                .publish_with_properties(&JobScheduled { id: 2 }, None, BasicProperties::default())
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn explicit_key_needs_an_exchange_declared_for_the_type() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_publish().never();

        let publisher = publisher(channel, topology().await);

        assert_eq!(
            publisher.publish_with_key(&JobScheduled { id: 3 }, "jobs").await,
            Err(AmqpError::DeclarationNotFound {
                kind: "exchange",
                type_name: type_name::<JobScheduled>(),
            })
        );
    }

    #[tokio::test]
    async fn published_body_is_consumed_and_acked() {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut channel = MockAmqpChannel::new();
        channel.expect_publish().times(1).returning({
            let sent = sent.clone();
            move |_, _, payload, _| {
                sent.lock().unwrap().extend_from_slice(payload);
                Ok(())
            }
        });

        let publisher = publisher(channel, topology().await);
        publisher.publish(&VideoUploaded { id: 11 }).await.unwrap();

        let received = Arc::new(std::sync::Mutex::new(None));
        let handler = {
            let received = received.clone();
            move |msg: VideoUploaded| {
                let received = received.clone();
                async move {
                    *received.lock().unwrap() = Some(msg);
                    Ok::<(), HandlerError>(())
                }
            }
        };

        let payload = sent.lock().unwrap().clone();
        let disposition = process::<VideoUploaded, _, _>(
            &Context::new(),
            &payload,
            &JsonCodec,
            &handler,
            &default_duplicate_detector(),
        )
        .await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(*received.lock().unwrap(), Some(VideoUploaded { id: 11 }));
    }

    #[tokio::test]
    async fn broker_failure_is_swallowed() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));

        let publisher = publisher(channel, topology().await);

        assert_eq!(publisher.publish(&VideoUploaded { id: 5 }).await, Ok(()));
    }
}
