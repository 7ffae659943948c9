// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Type-Directed Topology
//!
//! This module maps message types to the exchanges and queues declared for them.
//!
//! The main components are:
//! - `Subject`: stable identifier of a message type
//! - `TopologyRegistry`: type to exchange wire name and type to queue record lookups
//! - `Topology`: owns the declarations and the registry, installs them on the broker
//!   and re-installs the queues whenever the connection recovers
//!
//! Each declaration pass builds new maps and swaps them in under the registry write
//! lock, so lookups wait for an in-flight rebuild and never observe stale entries.

use crate::{
    channel::AmqpChannel,
    connection::{RecoveryListener, REPLY_SUCCESS},
    errors::AmqpError,
    exchange::{declare_exchanges, ExchangeDeclaration},
    queue::{declare_queues, InternalQueueDeclaration, QueueDeclaration},
};
use async_trait::async_trait;
use lapin::Connection;
use std::{
    any::{type_name, TypeId},
    collections::{HashMap, HashSet},
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Identifies the message type a declaration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subject {
    pub id: TypeId,
    pub name: &'static str,
}

impl Subject {
    pub fn of<T: 'static>() -> Self {
        Subject {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Type name without its module path, used as the message `type` property.
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }
}

pub(crate) fn short_type_name(name: &'static str) -> &'static str {
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Lookup tables from message type to its routing metadata.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TopologyRegistry {
    exchanges: HashMap<TypeId, String>,
    queues: HashMap<TypeId, InternalQueueDeclaration>,
}

impl TopologyRegistry {
    pub fn register_exchange(&mut self, subject: TypeId, wire_name: String) {
        self.exchanges.insert(subject, wire_name);
    }

    pub fn register_queue(&mut self, subject: TypeId, declaration: InternalQueueDeclaration) {
        self.queues.insert(subject, declaration);
    }

    pub(crate) fn replace_exchanges(&mut self, exchanges: HashMap<TypeId, String>) {
        self.exchanges = exchanges;
    }

    pub(crate) fn replace_queues(&mut self, queues: HashMap<TypeId, InternalQueueDeclaration>) {
        self.queues = queues;
    }

    /// Wire name of the exchange declared for `T`.
    pub fn resolve_exchange<T: 'static>(&self) -> Result<&str, AmqpError> {
        self.exchanges
            .get(&TypeId::of::<T>())
            .map(String::as_str)
            .ok_or(AmqpError::DeclarationNotFound {
                kind: "exchange",
                type_name: type_name::<T>(),
            })
    }

    /// Queue record declared for `T`.
    pub fn resolve_queue<T: 'static>(&self) -> Result<&InternalQueueDeclaration, AmqpError> {
        self.queues
            .get(&TypeId::of::<T>())
            .ok_or(AmqpError::DeclarationNotFound {
                kind: "queue",
                type_name: type_name::<T>(),
            })
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

/// Exchanges and queues to declare at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyDeclarations {
    pub exchanges: Vec<ExchangeDeclaration>,
    pub queues: Vec<QueueDeclaration>,
}

impl TopologyDeclarations {
    pub fn new(exchanges: Vec<ExchangeDeclaration>, queues: Vec<QueueDeclaration>) -> Self {
        TopologyDeclarations { exchanges, queues }
    }

    /// Rejects a type declared twice for the same kind of entity.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let mut seen = HashSet::new();
        for decl in &self.exchanges {
            if !seen.insert(decl.subject) {
                return Err(AmqpError::DuplicateDeclaration {
                    kind: "exchange",
                    type_name: decl.subject.name,
                });
            }
        }

        let mut seen = HashSet::new();
        for decl in &self.queues {
            if !seen.insert(decl.subject) {
                return Err(AmqpError::DuplicateDeclaration {
                    kind: "queue",
                    type_name: decl.subject.name,
                });
            }
        }

        Ok(())
    }
}

/// Declared topology plus the registry built from it.
#[derive(Debug)]
pub struct Topology {
    declarations: TopologyDeclarations,
    registry: RwLock<TopologyRegistry>,
}

impl Topology {
    pub fn new(declarations: TopologyDeclarations) -> Result<Self, AmqpError> {
        declarations.validate()?;

        Ok(Topology {
            declarations,
            registry: RwLock::new(TopologyRegistry::default()),
        })
    }

    pub fn declarations(&self) -> &TopologyDeclarations {
        &self.declarations
    }

    /// Declares exchanges, then queues and bindings, replacing both registries.
    pub async fn install<C>(&self, channel: &C) -> Result<(), AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        let mut registry = self.registry.write().await;

        let exchanges = declare_exchanges(channel, &self.declarations.exchanges).await?;
        registry.replace_exchanges(exchanges);

        let queues = declare_queues(channel, &self.declarations.queues).await?;
        registry.replace_queues(queues);

        info!(
            exchanges = self.declarations.exchanges.len(),
            queues = self.declarations.queues.len(),
            "topology installed"
        );

        Ok(())
    }

    /// Re-declares queues and bindings, replacing the queue registry.
    ///
    /// Exchanges survive a connection replacement and are not declared again. If
    /// the pass fails, the previous queue registry is kept.
    pub async fn reinstall_queues<C>(&self, channel: &C) -> Result<(), AmqpError>
    where
        C: AmqpChannel + ?Sized,
    {
        let mut registry = self.registry.write().await;

        let queues = declare_queues(channel, &self.declarations.queues).await?;
        registry.replace_queues(queues);

        debug!(queues = registry.queue_count(), "queues re-declared");

        Ok(())
    }

    pub async fn exchange<T: 'static>(&self) -> Result<String, AmqpError> {
        let registry = self.registry.read().await;
        registry.resolve_exchange::<T>().map(str::to_owned)
    }

    pub async fn queue<T: 'static>(&self) -> Result<InternalQueueDeclaration, AmqpError> {
        let registry = self.registry.read().await;
        registry.resolve_queue::<T>().cloned()
    }

    #[cfg(test)]
    pub(crate) async fn registry(&self) -> TopologyRegistry {
        self.registry.read().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn with_registry<F: FnOnce(&mut TopologyRegistry)>(&self, f: F) {
        f(&mut *self.registry.write().await)
    }
}

#[async_trait]
impl RecoveryListener for Topology {
    async fn topology_recovery_started(&self, connection: &Connection) -> Result<(), AmqpError> {
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the recovery channel");
            AmqpError::ChannelError
        })?;

        let result = self.reinstall_queues(&channel).await;
        if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = err.to_string(), "ignoring error while closing recovery channel");
        }

        result
    }
}
