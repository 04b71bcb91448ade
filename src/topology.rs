// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Idempotent declare-and-bind of subscription queues. Every queue declared
//! here carries an `x-dead-letter-exchange` argument pointing at the dead-letter
//! exchange the manager was configured with, so a rejected message is routed
//! there instead of being dropped.
//!
//! The main components are:
//! - `QueueTopology`: exchange, queue, routing key and durability class of a subscription
//! - `TopologyManager`: opens channels and installs topology through the broker contract
//! - Header constants: `x-*` arguments understood by the broker

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle, QueueKind},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Constant for the queue argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the queue argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Routing key binding the dead-letter queue to every dead-lettered message
pub const DEAD_LETTER_BINDING_KEY: &str = "#";

/// Where a subscription's queue lives and how it is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub kind: QueueKind,
}

impl QueueTopology {
    /// Creates a descriptor.
    ///
    /// # Parameters
    /// * `exchange` - Existing exchange the queue is bound to
    /// * `queue` - Queue name
    /// * `routing_key` - Binding key; topic wildcards `*` and `#` are allowed
    /// * `kind` - Durability class of the queue
    ///
    /// # Returns
    /// An unvalidated descriptor; `validate` runs when it is declared
    pub fn new(exchange: &str, queue: &str, routing_key: &str, kind: QueueKind) -> QueueTopology {
        QueueTopology {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            kind,
        }
    }

    /// Shorthand for a `QueueKind::Durable` descriptor.
    pub fn durable(exchange: &str, queue: &str, routing_key: &str) -> QueueTopology {
        QueueTopology::new(exchange, queue, routing_key, QueueKind::Durable)
    }

    /// Shorthand for a `QueueKind::Transient` descriptor.
    pub fn transient(exchange: &str, queue: &str, routing_key: &str) -> QueueTopology {
        QueueTopology::new(exchange, queue, routing_key, QueueKind::Transient)
    }

    /// Rejects descriptors with empty names before anything reaches the broker.
    pub fn validate(&self) -> Result<(), AmqpError> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("queue", &self.queue),
            ("routing key", &self.routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(AmqpError::InvalidTopology(format!("{field} must not be empty")));
            }
        }

        Ok(())
    }
}

/// Installs queues, exchanges and bindings through a shared broker connection.
///
/// Each `declare_and_bind` call opens its own channel; the caller becomes the
/// sole owner of that channel.
#[derive(Clone)]
pub struct TopologyManager {
    connection: Arc<dyn BrokerConnection>,
    dead_letter_exchange: String,
}

impl TopologyManager {
    /// Creates a manager that dead-letters every queue it declares to
    /// `dead_letter_exchange`.
    pub fn new(connection: Arc<dyn BrokerConnection>, dead_letter_exchange: &str) -> TopologyManager {
        TopologyManager {
            connection,
            dead_letter_exchange: dead_letter_exchange.to_owned(),
        }
    }

    /// Returns the exchange every declared queue dead-letters to.
    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// Builds the queue definition used for a topology descriptor.
    pub fn queue_definition(&self, topology: &QueueTopology) -> QueueDefinition {
        QueueDefinition::from_kind(&topology.queue, topology.kind)
            .dead_letter_exchange(&self.dead_letter_exchange)
    }

    /// Declares the descriptor's queue and binds it to its exchange.
    ///
    /// Returns the channel the work was done on together with the broker's view
    /// of the queue. Errors are not retried.
    pub async fn declare_and_bind(
        &self,
        topology: &QueueTopology,
    ) -> Result<(Arc<dyn BrokerChannel>, QueueHandle), AmqpError> {
        topology.validate()?;

        let channel = self.connection.open_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })?;

        match self.install_on(channel.as_ref(), topology).await {
            Ok(queue) => Ok((channel, queue)),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "channel already closed");
                }
                Err(err)
            }
        }
    }

    async fn install_on(
        &self,
        channel: &dyn BrokerChannel,
        topology: &QueueTopology,
    ) -> Result<QueueHandle, AmqpError> {
        let def = self.queue_definition(topology);

        debug!(
            queue = %topology.queue,
            kind = ?topology.kind,
            "creating queue"
        );

        let queue = channel.declare_queue(&def).await.map_err(|err| {
            error!(error = err.to_string(), queue = %topology.queue, "error to declare the queue");
            AmqpError::DeclareQueueError(topology.queue.clone())
        })?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            topology.queue, topology.exchange, topology.routing_key
        );

        let binding = QueueBinding::new(&topology.queue)
            .exchange(&topology.exchange)
            .routing_key(&topology.routing_key);

        channel.bind_queue(&binding).await.map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(topology.exchange.clone(), topology.queue.clone())
        })?;

        debug!("queue: {} was bound", topology.queue);

        Ok(queue)
    }

    /// Declares an exchange on a short-lived channel.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.open_setup_channel().await?;
        let result = declare_exchange_on(channel.as_ref(), def).await;
        close_setup_channel(channel.as_ref()).await;
        result
    }

    /// Declares the dead-letter exchange as a durable fanout and binds a durable
    /// queue named `dlq_name` to it, so discarded messages can be inspected.
    pub async fn install_dead_letter(&self, dlq_name: &str) -> Result<QueueHandle, AmqpError> {
        if dlq_name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "dead-letter queue must not be empty".to_owned(),
            ));
        }

        let channel = self.open_setup_channel().await?;
        let result = self.install_dead_letter_on(channel.as_ref(), dlq_name).await;
        close_setup_channel(channel.as_ref()).await;
        result
    }

    async fn install_dead_letter_on(
        &self,
        channel: &dyn BrokerChannel,
        dlq_name: &str,
    ) -> Result<QueueHandle, AmqpError> {
        let exchange = ExchangeDefinition::new(&self.dead_letter_exchange)
            .fanout()
            .durable();
        declare_exchange_on(channel, &exchange).await?;

        // no dead-letter argument on the dead-letter queue itself
        let dlq = QueueDefinition::new(dlq_name).durable();
        let queue = channel.declare_queue(&dlq).await.map_err(|err| {
            error!(error = err.to_string(), queue = dlq_name, "failure to declare dlq");
            AmqpError::DeclareQueueError(dlq_name.to_owned())
        })?;

        let binding = QueueBinding::new(dlq_name)
            .exchange(&self.dead_letter_exchange)
            .routing_key(DEAD_LETTER_BINDING_KEY);
        channel.bind_queue(&binding).await.map_err(|err| {
            error!(error = err.to_string(), "error to bind dlq to dead-letter exchange");
            AmqpError::BindingExchangeToQueueError(
                self.dead_letter_exchange.clone(),
                dlq_name.to_owned(),
            )
        })?;

        debug!(
            "dead-letter exchange: {} routes to queue: {}",
            self.dead_letter_exchange, dlq_name
        );

        Ok(queue)
    }

    async fn open_setup_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.connection.open_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })
    }
}

async fn declare_exchange_on(
    channel: &dyn BrokerChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name());

    channel.declare_exchange(def).await.map_err(|err| {
        error!(
            error = err.to_string(),
            name = def.name(),
            "error to declare the exchange"
        );
        AmqpError::DeclareExchangeError(def.name().to_owned())
    })?;

    debug!("exchange: {} was created", def.name());
    Ok(())
}

async fn close_setup_channel(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "failure to close setup channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerChannel, MockBrokerConnection};
    use lapin::types::{AMQPValue, LongString, ShortString};
    use mockall::predicate::eq;

    fn handle(name: &str) -> QueueHandle {
        QueueHandle {
            name: name.to_owned(),
            message_count: 0,
            consumer_count: 0,
        }
    }

    fn connection_with(channel: MockBrokerChannel) -> Arc<dyn BrokerConnection> {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_channel()
            .times(1)
            .returning(move || Ok(channel.clone()));
        Arc::new(conn)
    }

    fn dlx_of(def: &QueueDefinition) -> Option<AMQPValue> {
        def.arguments()
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
            .cloned()
    }

    #[tokio::test]
    async fn durable_queue_is_shared_and_dead_lettered() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| {
                def.name() == "war"
                    && def.is_durable()
                    && !def.is_auto_delete()
                    && !def.is_exclusive()
                    && dlx_of(def) == Some(AMQPValue::LongString(LongString::from("peril_dlx")))
            })
            .times(1)
            .returning(|def| Ok(handle(def.name())));
        channel
            .expect_bind_queue()
            .with(eq(QueueBinding::new("war")
                .exchange("peril_topic")
                .routing_key("war.*")))
            .times(1)
            .returning(|_| Ok(()));

        let manager = TopologyManager::new(connection_with(channel), "peril_dlx");
        let (_, queue) = manager
            .declare_and_bind(&QueueTopology::durable("peril_topic", "war", "war.*"))
            .await
            .unwrap();

        assert_eq!(queue.name, "war");
    }

    #[tokio::test]
    async fn transient_queue_is_exclusive_and_auto_deleted() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| {
                !def.is_durable()
                    && def.is_auto_delete()
                    && def.is_exclusive()
                    && def.dead_letter() == Some("peril_dlx")
            })
            .times(1)
            .returning(|def| Ok(handle(def.name())));
        channel.expect_bind_queue().times(1).returning(|_| Ok(()));

        let manager = TopologyManager::new(connection_with(channel), "peril_dlx");
        manager
            .declare_and_bind(&QueueTopology::transient(
                "peril_direct",
                "pause.alice",
                "pause",
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_names_never_reach_the_broker() {
        let conn = MockBrokerConnection::new();
        let manager = TopologyManager::new(Arc::new(conn), "peril_dlx");

        let err = manager
            .declare_and_bind(&QueueTopology::durable("peril_topic", "", "war.*"))
            .await
            .err()
            .unwrap();

        assert_eq!(
            err,
            AmqpError::InvalidTopology("queue must not be empty".to_owned())
        );
    }

    #[tokio::test]
    async fn channel_failure_is_reported() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_channel()
            .returning(|| Err(AmqpError::ConnectionError));
        let manager = TopologyManager::new(Arc::new(conn), "peril_dlx");

        let err = manager
            .declare_and_bind(&QueueTopology::durable("peril_topic", "war", "war.*"))
            .await
            .err()
            .unwrap();

        assert_eq!(err, AmqpError::ChannelError);
    }

    #[tokio::test]
    async fn declare_rejection_closes_the_channel() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .returning(|_| Err(AmqpError::InternalError));
        channel.expect_bind_queue().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let manager = TopologyManager::new(connection_with(channel), "peril_dlx");
        let err = manager
            .declare_and_bind(&QueueTopology::durable("peril_topic", "war", "war.*"))
            .await
            .err()
            .unwrap();

        assert_eq!(err, AmqpError::DeclareQueueError("war".to_owned()));
    }

    #[tokio::test]
    async fn bind_rejection_names_exchange_and_queue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Ok(handle(def.name())));
        channel
            .expect_bind_queue()
            .returning(|_| Err(AmqpError::InternalError));
        channel.expect_close().times(1).returning(|| Ok(()));

        let manager = TopologyManager::new(connection_with(channel), "peril_dlx");
        let err = manager
            .declare_and_bind(&QueueTopology::durable("missing", "war", "war.*"))
            .await
            .err()
            .unwrap();

        assert_eq!(
            err,
            AmqpError::BindingExchangeToQueueError("missing".to_owned(), "war".to_owned())
        );
    }

    #[tokio::test]
    async fn dead_letter_install_wires_fanout_to_queue() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_exchange()
            .with(eq(ExchangeDefinition::new("peril_dlx").fanout().durable()))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "peril_dlq" && def.is_durable() && def.dead_letter().is_none())
            .times(1)
            .returning(|def| Ok(handle(def.name())));
        channel
            .expect_bind_queue()
            .with(eq(QueueBinding::new("peril_dlq")
                .exchange("peril_dlx")
                .routing_key(DEAD_LETTER_BINDING_KEY)))
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let manager = TopologyManager::new(connection_with(channel), "peril_dlx");
        let queue = manager.install_dead_letter("peril_dlq").await.unwrap();

        assert_eq!(queue.name, "peril_dlq");
    }
}
