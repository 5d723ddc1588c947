//! Exchange resolution, routing keys and queue binding sets

use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::message::MessageType;
use std::collections::BTreeSet;
use tracing::warn;

/// Maps message types to the exchange they are published on
pub trait ExchangeResolver: Send + Sync {
    /// Exchange name for `message_type`
    fn resolve(&self, message_type: &MessageType) -> Result<String>;

    /// Reply types are excluded from pub/sub bindings
    fn is_reply(&self, message_type: &MessageType) -> bool {
        message_type.is_reply()
    }
}

/// Uses the exchange declared on the message type itself
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExchangeResolver;

impl ExchangeResolver for DefaultExchangeResolver {
    fn resolve(&self, message_type: &MessageType) -> Result<String> {
        message_type
            .declared_exchange()
            .map(str::to_string)
            .ok_or_else(|| {
                BusError::configuration(format!(
                    "message type '{}' does not declare an exchange",
                    message_type.name()
                ))
            })
    }
}

/// Publishes every message type on one exchange
#[derive(Debug, Clone)]
pub struct StaticExchangeResolver {
    exchange: String,
}

impl StaticExchangeResolver {
    /// Resolve every type to `exchange`
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
        }
    }
}

impl ExchangeResolver for StaticExchangeResolver {
    fn resolve(&self, _message_type: &MessageType) -> Result<String> {
        Ok(self.exchange.clone())
    }
}

/// Pub/sub routing key of a message type
pub fn routing_key(message_type: &MessageType) -> &'static str {
    message_type.name()
}

/// A queue binding to an exchange with a routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    /// Source exchange
    pub exchange: String,
    /// Routing key (pattern) matched against published routing keys
    pub routing_key: String,
}

impl Binding {
    /// Create a binding
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.exchange, self.routing_key)
    }
}

/// The bindings a queue needs to receive a set of message types
///
/// One binding per (exchange, type routing key) for non-reply types, plus one
/// self-binding per distinct exchange keyed by the queue name so that point to
/// point sends and replies reach this queue directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSet {
    bindings: BTreeSet<Binding>,
}

impl BindingSet {
    /// Compute the bindings for `queue` receiving `message_types`
    ///
    /// Types whose exchange cannot be resolved are skipped with a warning.
    pub fn compute<I>(message_types: I, resolver: &dyn ExchangeResolver, queue: &Endpoint) -> Self
    where
        I: IntoIterator<Item = MessageType>,
    {
        let mut bindings = BTreeSet::new();
        let mut exchanges = BTreeSet::new();

        for message_type in message_types {
            let exchange = match resolver.resolve(&message_type) {
                Ok(exchange) => exchange,
                Err(e) => {
                    warn!(message_type = %message_type, error = %e, "Skipping binding for message type");
                    continue;
                }
            };

            if !resolver.is_reply(&message_type) {
                bindings.insert(Binding::new(exchange.clone(), routing_key(&message_type)));
            }
            exchanges.insert(exchange);
        }

        if !queue.is_empty() {
            for exchange in exchanges {
                bindings.insert(Binding::new(exchange, queue.queue()));
            }
        }

        Self { bindings }
    }

    /// Bindings present in `self` but not in `other`
    pub fn difference(&self, other: &BindingSet) -> BindingSet {
        Self {
            bindings: self.bindings.difference(&other.bindings).cloned().collect(),
        }
    }

    /// Add every binding of `other`
    pub fn extend(&mut self, other: BindingSet) {
        self.bindings.extend(other.bindings);
    }

    /// Whether the set contains a binding
    pub fn contains(&self, binding: &Binding) -> bool {
        self.bindings.contains(binding)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate over the bindings in a stable order
    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BusMessage;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Created;
    impl BusMessage for Created {
        const TYPE_NAME: &'static str = "orders.created";
        const EXCHANGE: Option<&'static str> = Some("orders");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Shipped;
    impl BusMessage for Shipped {
        const TYPE_NAME: &'static str = "shipping.shipped";
        const EXCHANGE: Option<&'static str> = Some("shipping");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Quote;
    impl BusMessage for Quote {
        const TYPE_NAME: &'static str = "pricing.quote";
        const EXCHANGE: Option<&'static str> = Some("pricing");
        const IS_REPLY: bool = true;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Homeless;
    impl BusMessage for Homeless {
        const TYPE_NAME: &'static str = "nowhere.homeless";
    }

    #[test]
    fn test_default_resolver_requires_declared_exchange() {
        assert_eq!(
            DefaultExchangeResolver
                .resolve(&Created::message_type())
                .unwrap(),
            "orders"
        );
        assert!(
            DefaultExchangeResolver
                .resolve(&Homeless::message_type())
                .is_err()
        );
    }

    #[test]
    fn test_binding_set_includes_self_bindings_per_exchange() {
        let queue = Endpoint::new("amq.gen-abc");
        let set = BindingSet::compute(
            [
                Created::message_type(),
                Shipped::message_type(),
                Quote::message_type(),
                Homeless::message_type(),
            ],
            &DefaultExchangeResolver,
            &queue,
        );

        assert!(set.contains(&Binding::new("orders", "orders.created")));
        assert!(set.contains(&Binding::new("shipping", "shipping.shipped")));
        assert!(set.contains(&Binding::new("orders", "amq.gen-abc")));
        assert!(set.contains(&Binding::new("shipping", "amq.gen-abc")));
        assert!(set.contains(&Binding::new("pricing", "amq.gen-abc")));
        assert!(!set.contains(&Binding::new("pricing", "pricing.quote")));
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn test_static_resolver_yields_single_self_binding() {
        let queue = Endpoint::new("q1");
        let set = BindingSet::compute(
            [Created::message_type(), Shipped::message_type()],
            &StaticExchangeResolver::new("everything"),
            &queue,
        );
        let self_bindings = set.iter().filter(|b| b.routing_key == "q1").count();
        assert_eq!(self_bindings, 1);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_difference_finds_new_bindings() {
        let queue = Endpoint::new("q1");
        let before = BindingSet::compute([Created::message_type()], &DefaultExchangeResolver, &queue);
        let after = BindingSet::compute(
            [Created::message_type(), Shipped::message_type()],
            &DefaultExchangeResolver,
            &queue,
        );
        let added = after.difference(&before);
        assert_eq!(added.len(), 2);
        assert!(added.contains(&Binding::new("shipping", "q1")));
    }
}
