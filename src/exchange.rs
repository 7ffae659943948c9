// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! An exchange is declared once per message type. Its wire name is derived from
//! the logical name and the exchange kind, e.g. `events.fanout`.

use crate::{channel::AmqpChannel, errors::AmqpError, topology::Subject};
use std::{any::TypeId, collections::HashMap, fmt};
use tracing::debug;

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Exchange declaration for a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub(crate) subject: Subject,
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
}

impl ExchangeDeclaration {
    /// Declares an exchange carrying messages of type `T`.
    pub fn of<T: 'static>(name: &str, kind: ExchangeKind) -> Self {
        ExchangeDeclaration {
            subject: Subject::of::<T>(),
            name: name.to_owned(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// Name of the exchange on the broker: `{name}.{kind}`.
    pub fn wire_name(&self) -> String {
        format!("{}.{}", self.name, self.kind)
    }
}

/// Declares every exchange as durable and returns the type to wire name mapping.
///
/// Redeclaring an identical exchange is a no-op on the broker; a conflicting
/// redeclaration fails and closes the channel.
pub async fn declare_exchanges<C>(
    channel: &C,
    declarations: &[ExchangeDeclaration],
) -> Result<HashMap<TypeId, String>, AmqpError>
where
    C: AmqpChannel + ?Sized,
{
    let mut exchanges = HashMap::with_capacity(declarations.len());

    for decl in declarations {
        let wire_name = decl.wire_name();
        channel.declare_exchange(&wire_name, &decl.kind).await?;
        debug!(subject = decl.subject.name, "exchange: {} was created", wire_name);

        exchanges.insert(decl.subject.id, wire_name);
    }

    Ok(exchanges)
}
