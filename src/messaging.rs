// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Context
//!
//! `RabbitMQ` ties the connection manager, the declared topology and the codec
//! together. It is created once by the hosting application with `configure` and
//! torn down with `shutdown`.
//!
//! ```no_run
//! use rabbitmq_topology::{
//!     configs::RabbitMQConfigs,
//!     errors::HandlerError,
//!     exchange::{ExchangeDeclaration, ExchangeKind},
//!     messaging::RabbitMQ,
//!     queue::{ConsumerScope, QueueDeclaration},
//!     topology::TopologyDeclarations,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct VideoUploaded {
//!     id: u64,
//! }
//!
//! # async fn run() -> Result<(), rabbitmq_topology::errors::AmqpError> {
//! let events = ExchangeDeclaration::of::<VideoUploaded>("events", ExchangeKind::Fanout);
//! let queue = QueueDeclaration::of::<VideoUploaded>("context-video", ConsumerScope::new("media"))
//!     .exchange(events.clone());
//!
//! let rabbitmq = RabbitMQ::configure(
//!     RabbitMQConfigs::from_env(),
//!     TopologyDeclarations::new(vec![events], vec![queue]),
//! )
//! .await?;
//!
//! rabbitmq
//!     .consume::<VideoUploaded, _>(None, |video: VideoUploaded| async move {
//!         println!("uploaded {}", video.id);
//!         Ok::<(), HandlerError>(())
//!     })
//!     .await?;
//!
//! rabbitmq.publisher().await?.publish(&VideoUploaded { id: 1 }).await?;
//! rabbitmq.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    codec::{Codec, JsonCodec},
    configs::RabbitMQConfigs,
    connection::{ConnectionManager, RecoveryListener, REPLY_SUCCESS},
    consumer::{consumer_tag, default_duplicate_detector, ConsumerHandler, DuplicateDetector},
    dispatcher::{dispatch, subscribe},
    errors::AmqpError,
    publisher::Publisher,
    topology::{Topology, TopologyDeclarations},
};
use lapin::Channel;
use serde::de::DeserializeOwned;
use std::{any::type_name, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct RabbitMQ<K: Codec = JsonCodec> {
    connection: Arc<ConnectionManager>,
    topology: Arc<Topology>,
    codec: Arc<K>,
    is_duplicate: DuplicateDetector,
}

impl RabbitMQ<JsonCodec> {
    /// Connects to the broker and declares the topology, with JSON payloads.
    pub async fn configure(
        cfg: RabbitMQConfigs,
        declarations: TopologyDeclarations,
    ) -> Result<Self, AmqpError> {
        Self::configure_with_codec(cfg, declarations, JsonCodec).await
    }
}

impl<K: Codec> RabbitMQ<K> {
    /// Connects to the broker, retrying until it is reachable, then declares all
    /// exchanges, queues and bindings.
    ///
    /// Queues are declared again every time the connection is recovered.
    pub async fn configure_with_codec(
        cfg: RabbitMQConfigs,
        declarations: TopologyDeclarations,
        codec: K,
    ) -> Result<Self, AmqpError> {
        let topology = Arc::new(Topology::new(declarations)?);
        let listener: Arc<dyn RecoveryListener> = topology.clone();

        let connection = ConnectionManager::new(cfg, Some(listener));
        connection.start().await?;

        let channel = connection.create_channel().await?;
        topology.install(&channel).await?;
        if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = err.to_string(), "ignoring error while closing channel");
        }

        Ok(RabbitMQ {
            connection,
            topology,
            codec: Arc::new(codec),
            is_duplicate: default_duplicate_detector(),
        })
    }

    /// Replaces the predicate deciding which handler failures are duplicates.
    pub fn with_duplicate_detector(mut self, detector: DuplicateDetector) -> Self {
        self.is_duplicate = detector;
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Closes the connection and stops every consumer. Never fails.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    /// Creates a new channel. Channels must not be shared between concurrent users.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        self.connection.create_channel().await
    }

    /// Publisher on a fresh channel.
    pub async fn publisher(&self) -> Result<Publisher<Channel, K>, AmqpError> {
        let channel = self.create_channel().await?;

        Ok(Publisher::new(
            Arc::new(channel),
            self.topology.clone(),
            self.codec.clone(),
        ))
    }

    /// Starts a non-exclusive consumer for the queue declared for `T`.
    ///
    /// The consumer gets its own channel with a prefetch of two. Deliveries are
    /// handled on a background task that re-attaches after every connection
    /// recovery and lives until `shutdown`.
    ///
    /// # Parameters
    /// * `number` - Suffix of the consumer tag, distinguishes parallel consumers of the same type
    /// * `handler` - Called with every decoded message
    ///
    /// # Returns
    /// * `Result<JoinHandle<()>, AmqpError>` - Handle of the consumer task once it is
    ///   attached, or `DeclarationNotFound` when no queue was declared for `T`
    ///
    /// # Example
    /// ```ignore
    /// rabbitmq
    ///     .consume::<VideoUploaded, _>(Some(1), |video: VideoUploaded| async move {
    ///         store(video).await.map_err(HandlerError::failed)
    ///     })
    ///     .await?;
    /// ```
    pub async fn consume<T, H>(
        &self,
        number: Option<u16>,
        handler: H,
    ) -> Result<JoinHandle<()>, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: ConsumerHandler<T> + 'static,
    {
        info!("Consumer launched: for {}", type_name::<T>());

        let queue = self.topology.queue::<T>().await?;
        let tag = consumer_tag(&queue.consumer_scope.name, &queue.queue, number);
        let subscription = subscribe(&self.connection, &queue.queue, &tag).await?;

        Ok(tokio::spawn(dispatch::<T, K, H>(
            self.connection.clone(),
            subscription,
            queue.queue,
            tag,
            self.codec.clone(),
            Arc::new(handler),
            self.is_duplicate.clone(),
        )))
    }
}
