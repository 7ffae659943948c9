// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! A queue declaration associates a message type with the queue its consumers
//! read from, the consumer scope used to tag them and, optionally, the exchange
//! the queue is bound to. Declaring the queues yields the per-type
//! `InternalQueueDeclaration` records the registry serves to publish/consume.

use crate::{
    channel::AmqpChannel, errors::AmqpError, exchange::ExchangeDeclaration, topology::Subject,
};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::{any::TypeId, collections::BTreeMap, collections::HashMap};
use tracing::debug;

/// Queue argument selecting the queue implementation
pub const AMQP_ARGUMENT_QUEUE_TYPE: &str = "x-queue-type";
/// Replicated queue type applied to every non-exclusive queue
pub const AMQP_QUEUE_TYPE_QUORUM: &str = "quorum";

/// Microservice scope owning a consumer, used to build consumer tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerScope {
    pub name: String,
}

impl ConsumerScope {
    pub fn new(name: &str) -> Self {
        ConsumerScope {
            name: name.to_owned(),
        }
    }
}

/// Queue declaration for a message type.
///
/// Built with the builder methods; the routing key defaults to the queue name.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub(crate) subject: Subject,
    pub(crate) queue: String,
    pub(crate) consumer_scope: ConsumerScope,
    pub(crate) routing_key: String,
    pub(crate) exchange: Option<ExchangeDeclaration>,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
    pub(crate) exclusive: bool,
}

impl QueueDeclaration {
    /// Declares a queue carrying messages of type `T`, not bound to any exchange.
    pub fn of<T: 'static>(queue: &str, scope: ConsumerScope) -> Self {
        QueueDeclaration {
            subject: Subject::of::<T>(),
            queue: queue.to_owned(),
            consumer_scope: scope,
            routing_key: queue.to_owned(),
            exchange: None,
            arguments: BTreeMap::default(),
            exclusive: false,
        }
    }

    /// Declares a queue fed through the default exchange, with extra arguments.
    pub fn direct<T: 'static>(
        queue: &str,
        scope: ConsumerScope,
        arguments: BTreeMap<ShortString, AMQPValue>,
    ) -> Self {
        Self::of::<T>(queue, scope).arguments(arguments)
    }

    /// Sets the routing key used for the binding and for publishing.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Binds the queue to the given exchange.
    pub fn exchange(mut self, exchange: ExchangeDeclaration) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Replaces the queue construction arguments.
    pub fn arguments(mut self, arguments: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Adds a single queue construction argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Declares an exclusive queue. Exclusive queues are never durable.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Arguments sent with queue-declare. Non-exclusive queues are always quorum
    /// queues; a caller supplied `x-queue-type` is overridden.
    pub(crate) fn declare_arguments(&self) -> FieldTable {
        let mut args = self.arguments.clone();

        if !self.exclusive {
            args.insert(
                ShortString::from(AMQP_ARGUMENT_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from(AMQP_QUEUE_TYPE_QUORUM)),
            );
        }

        FieldTable::from(args)
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: !self.exclusive,
            exclusive: self.exclusive,
            auto_delete: false,
            nowait: false,
        }
    }

    fn to_internal(&self) -> InternalQueueDeclaration {
        InternalQueueDeclaration {
            queue: self.queue.clone(),
            consumer_scope: self.consumer_scope.clone(),
            routing_key: self.routing_key.clone(),
            exchange: self
                .exchange
                .as_ref()
                .map(ExchangeDeclaration::wire_name)
                .unwrap_or_default(),
        }
    }
}

/// Resolved queue record served by the topology registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalQueueDeclaration {
    pub queue: String,
    pub consumer_scope: ConsumerScope,
    pub routing_key: String,
    /// Wire name of the bound exchange, empty for the default exchange
    pub exchange: String,
}

/// Declares and binds every queue, returning a fresh type to queue record mapping.
///
/// Queues are durable unless exclusive, and non-exclusive queues are quorum
/// queues. A queue with an exchange is bound to it with its routing key.
///
/// # Parameters
/// * `channel` - Channel the declarations are sent on
/// * `declarations` - Queues to declare, in order
///
/// # Returns
/// * `Result<HashMap<TypeId, InternalQueueDeclaration>, AmqpError>` -
///   The record of every declared queue keyed by message type, or the first
///   declaration or binding failure.
///
/// # Example
/// ```ignore
/// let queues = declare_queues(&channel, &declarations).await?;
/// ```
pub async fn declare_queues<C>(
    channel: &C,
    declarations: &[QueueDeclaration],
) -> Result<HashMap<TypeId, InternalQueueDeclaration>, AmqpError>
where
    C: AmqpChannel + ?Sized,
{
    let mut queues = HashMap::with_capacity(declarations.len());

    for decl in declarations {
        channel
            .declare_queue(&decl.queue, decl.declare_options(), decl.declare_arguments())
            .await?;
        debug!("queue: {} was created", decl.queue);

        if let Some(exchange) = &decl.exchange {
            channel
                .bind_queue(&decl.queue, &exchange.wire_name(), &decl.routing_key)
                .await?;
        }

        queues.insert(decl.subject.id, decl.to_internal());
    }

    Ok(queues)
}
