// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing layer of the broker: a published message is
//! matched against the bindings of an exchange and copied into every queue whose
//! binding accepts its routing key. This module defines the supported exchange
//! types and a builder for exchange declarations.

/// Represents the types of exchanges the layer can declare.
///
/// - Direct: routes on an exact routing key match
/// - Fanout: broadcasts to every bound queue regardless of routing key
/// - Topic: routes on dot-separated patterns where `*` matches one word and
///   `#` matches zero or more words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            internal: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange to auto-delete once its last binding is removed.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Returns the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the routing type of the exchange.
    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Returns true if the exchange survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Returns true if the exchange is removed once its last binding is gone.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// Returns true if the exchange only accepts messages from other exchanges.
    pub fn is_internal(&self) -> bool {
        self.internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let def = ExchangeDefinition::new("peril_topic").topic().durable();

        assert_eq!(def.name(), "peril_topic");
        assert_eq!(def.exchange_kind(), ExchangeKind::Topic);
        assert!(def.is_durable());
        assert!(!def.is_auto_delete());
        assert!(!def.is_internal());
    }

    #[test]
    fn kind_maps_onto_lapin() {
        assert!(matches!(
            lapin::ExchangeKind::from(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
        assert!(matches!(
            lapin::ExchangeKind::from(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));
    }
}
