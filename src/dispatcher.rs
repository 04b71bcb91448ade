// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed Subscriptions
//!
//! `Subscriber` turns a topology descriptor, a decoder and a handler into a
//! running subscription:
//!
//! 1. declare and bind the queue on a channel owned by the subscription
//! 2. cap unacknowledged deliveries with a prefetch limit
//! 3. open a manually acknowledged delivery feed
//! 4. spawn one task that processes deliveries strictly in arrival order
//!
//! Setup failures are returned to the caller and no task is spawned.
//! Concurrency comes from running several subscriptions, never from running
//! handlers of one subscription in parallel.

use crate::{
    broker::{BrokerChannel, BrokerConnection, DeliveryStream},
    codec::{Bincode, Codec, Json},
    configs::{Configs, RabbitMQConfigs},
    consumer::{consume, DecodeFailurePolicy, MessageHandler},
    errors::AmqpError,
    otel,
    topology::{QueueTopology, TopologyManager},
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Prefetch applied when none is configured
pub const DEFAULT_PREFETCH: u16 = 10;

/// Per-subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum number of unacknowledged deliveries held by the subscription.
    pub prefetch: u16,
    pub on_decode_failure: DecodeFailurePolicy,
    /// Consumer tag announced to the broker; generated when `None`.
    pub consumer_tag: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            prefetch: DEFAULT_PREFETCH,
            on_decode_failure: DecodeFailurePolicy::default(),
            consumer_tag: None,
        }
    }
}

impl SubscribeOptions {
    /// Creates options from the broker section of the configuration.
    ///
    /// # Parameters
    /// * `cfg` - Broker settings; only `prefetch` is read
    ///
    /// # Returns
    /// Options with the configured prefetch and the defaults for everything else
    pub fn from_configs(cfg: &RabbitMQConfigs) -> Self {
        SubscribeOptions::default().prefetch(cfg.prefetch)
    }

    /// Sets the maximum number of unacknowledged deliveries.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets what happens to bodies the decoder rejects.
    pub fn on_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.on_decode_failure = policy;
        self
    }

    /// Sets a fixed consumer tag instead of a generated one.
    ///
    /// A broker rejects a second consumer with the same tag on one channel, and
    /// every subscription opens its own channel, so one tag may be reused
    /// across subscriptions.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }
}

/// Why a subscription loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionExit {
    /// `Subscription::stop` was called.
    Cancelled,
    /// The broker closed the delivery feed.
    FeedClosed,
}

/// Handle to a running subscription.
///
/// Dropping the handle detaches the loop: it keeps consuming until its
/// delivery feed closes. Call `stop()` to end it and close its channel.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    handle: JoinHandle<Result<SubscriptionExit, AmqpError>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Name of the queue the subscription consumes from, as declared by the broker.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consumer tag announced to the broker.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Returns true until the consumption loop has exited.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Requests a graceful stop and waits for the loop to exit.
    ///
    /// The delivery being handled when the request arrives is settled first.
    /// Returns how the loop ended; a loop halted by an undecodable body reports
    /// its `DecodeError` here.
    pub async fn stop(mut self) -> Result<SubscriptionExit, AmqpError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Waits for the loop to end on its own.
    pub async fn join(self) -> Result<SubscriptionExit, AmqpError> {
        match self.handle.await {
            Ok(exit) => exit,
            Err(err) => {
                error!(error = err.to_string(), "subscription task failed");
                Err(AmqpError::InternalError)
            }
        }
    }

    /// Aborts the loop immediately, dropping the delivery being handled.
    ///
    /// The channel is closed from a background task, so the broker requeues
    /// every delivery the subscription had not settled, including the aborted
    /// one. Outside a tokio runtime the channel stays open until the
    /// connection closes.
    pub fn abort(self) {
        self.handle.abort();

        let Subscription { channel, queue, .. } = self;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    info!(queue = %queue, "subscription aborted");
                    close_channel(channel.as_ref(), &queue).await;
                });
            }
            Err(_) => warn!(queue = %queue, "no runtime to close the channel of an aborted subscription"),
        }
    }
}

/// Starts typed subscriptions over a shared broker connection.
#[derive(Clone)]
pub struct Subscriber {
    topology: TopologyManager,
    options: SubscribeOptions,
}

impl Subscriber {
    /// Creates a subscriber whose queues dead-letter to `dead_letter_exchange`.
    ///
    /// # Parameters
    /// * `connection` - Shared broker connection; each subscription opens its own channel on it
    /// * `dead_letter_exchange` - Exchange every declared queue dead-letters to
    ///
    /// # Returns
    /// A subscriber using the default `SubscribeOptions`
    pub fn new(connection: Arc<dyn BrokerConnection>, dead_letter_exchange: &str) -> Subscriber {
        Subscriber::with_topology(TopologyManager::new(connection, dead_letter_exchange))
    }

    /// Creates a subscriber from the broker section of the configuration.
    ///
    /// # Parameters
    /// * `connection` - Shared broker connection
    /// * `cfg` - Loaded configuration; `rabbitmq.dead_letter_exchange` and
    ///   `rabbitmq.prefetch` are applied
    ///
    /// # Returns
    /// A subscriber whose subscriptions use the configured prefetch
    pub fn from_configs(connection: Arc<dyn BrokerConnection>, cfg: &Configs) -> Subscriber {
        Subscriber::new(connection, &cfg.rabbitmq.dead_letter_exchange)
            .options(SubscribeOptions::from_configs(&cfg.rabbitmq))
    }

    /// Creates a subscriber on an existing topology manager.
    pub fn with_topology(topology: TopologyManager) -> Subscriber {
        Subscriber {
            topology,
            options: SubscribeOptions::default(),
        }
    }

    /// Replaces the options applied to subscriptions started afterwards.
    pub fn options(mut self, options: SubscribeOptions) -> Self {
        self.options = options;
        self
    }

    /// Topology manager used to declare subscription queues.
    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// Subscribes with codec `C`.
    pub async fn subscribe<C, T, H>(
        &self,
        topology: &QueueTopology,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        C: Codec,
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.subscribe_with(topology, C::decode::<T>, handler).await
    }

    /// Subscribes to JSON payloads.
    pub async fn subscribe_json<T, H>(
        &self,
        topology: &QueueTopology,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.subscribe::<Json, T, H>(topology, handler).await
    }

    /// Subscribes to bincode payloads.
    pub async fn subscribe_bincode<T, H>(
        &self,
        topology: &QueueTopology,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.subscribe::<Bincode, T, H>(topology, handler).await
    }

    /// Subscribes with an arbitrary decoder.
    ///
    /// # Parameters
    /// * `topology` - Exchange, queue, routing key and durability class
    /// * `decode` - Turns a delivery body into the handler's message type
    /// * `handler` - Called once per decoded delivery; its verdict settles the delivery
    ///
    /// # Returns
    /// A handle to the running subscription, or the setup error that prevented
    /// it from starting. No task is spawned on error.
    pub async fn subscribe_with<T, D, H>(
        &self,
        topology: &QueueTopology,
        decode: D,
        handler: H,
    ) -> Result<Subscription, AmqpError>
    where
        T: Send + 'static,
        D: Fn(&[u8]) -> Result<T, AmqpError> + Send + Sync + 'static,
        H: MessageHandler<T>,
    {
        let (channel, queue) = self.topology.declare_and_bind(topology).await?;

        let consumer_tag = self
            .options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue.name, Uuid::new_v4()));

        let deliveries = match self.open_feed(channel.as_ref(), &queue.name, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "channel already closed");
                }
                return Err(err);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(run_loop(LoopState {
            channel: channel.clone(),
            queue: queue.name.clone(),
            deliveries,
            decode,
            handler,
            on_decode_failure: self.options.on_decode_failure,
            stop_rx,
        }));

        info!(
            queue = %queue.name,
            consumer_tag = %consumer_tag,
            prefetch = self.options.prefetch,
            "subscription started"
        );

        Ok(Subscription {
            queue: queue.name,
            consumer_tag,
            channel,
            handle,
            stop_tx: Some(stop_tx),
        })
    }

    async fn open_feed(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        channel
            .set_prefetch(self.options.prefetch)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                match err {
                    AmqpError::QoSDeclarationError(_) => err,
                    other => AmqpError::QoSDeclarationError(other.to_string()),
                }
            })?;

        channel.consume(queue, consumer_tag).await.map_err(|err| {
            error!(error = err.to_string(), "error to create the consumer");
            AmqpError::BindingConsumerError(queue.to_owned())
        })
    }
}

struct LoopState<D, H> {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    deliveries: DeliveryStream,
    decode: D,
    handler: H,
    on_decode_failure: DecodeFailurePolicy,
    stop_rx: oneshot::Receiver<()>,
}

async fn run_loop<T, D, H>(state: LoopState<D, H>) -> Result<SubscriptionExit, AmqpError>
where
    T: Send + 'static,
    D: Fn(&[u8]) -> Result<T, AmqpError> + Send + Sync + 'static,
    H: MessageHandler<T>,
{
    let LoopState {
        channel,
        queue,
        mut deliveries,
        decode,
        handler,
        on_decode_failure,
        mut stop_rx,
    } = state;

    let tracer = global::tracer(otel::CONSUMER_TRACER);
    let mut detached = false;

    loop {
        tokio::select! {
            biased;

            stop = &mut stop_rx, if !detached => {
                if stop.is_err() {
                    // handle dropped without stop(): keep consuming
                    detached = true;
                    continue;
                }

                info!(queue = %queue, "stopping subscription");
                close_channel(channel.as_ref(), &queue).await;
                return Ok(SubscriptionExit::Cancelled);
            }

            next = deliveries.next() => {
                let delivery = match next {
                    None => {
                        warn!(queue = %queue, "delivery feed closed");
                        return Ok(SubscriptionExit::FeedClosed);
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        continue;
                    }
                    Some(Ok(delivery)) => delivery,
                };

                match consume(
                    &tracer,
                    channel.as_ref(),
                    &queue,
                    &delivery,
                    &decode,
                    &handler,
                    on_decode_failure,
                )
                .await
                {
                    Ok(_) => {}
                    Err(AmqpError::DecodeError(msg)) => {
                        close_channel(channel.as_ref(), &queue).await;
                        return Err(AmqpError::DecodeError(msg));
                    }
                    Err(err) => error!(error = err.to_string(), "error consume msg"),
                }
            }
        }
    }
}

async fn close_channel(channel: &dyn BrokerChannel, queue: &str) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), queue = queue, "failure to close channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, Headers, MockBrokerChannel, MockBrokerConnection};
    use crate::consumer::AckVerdict;
    use crate::queue::QueueHandle;
    use futures_util::stream;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn delivery(tag: u64, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: tag,
            redelivered: false,
            exchange: "peril_direct".into(),
            routing_key: "pause".into(),
            content_type: None,
            headers: Headers::new(),
            body: body.to_vec(),
        }
    }

    fn declared_channel() -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().returning(|def| {
            Ok(QueueHandle {
                name: def.name().to_owned(),
                message_count: 0,
                consumer_count: 0,
            })
        });
        channel.expect_bind_queue().returning(|_| Ok(()));
        channel
    }

    fn connection_on(channel: MockBrokerChannel) -> Arc<dyn BrokerConnection> {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_channel()
            .returning(move || Ok(channel.clone()));
        Arc::new(conn)
    }

    fn subscriber_on(channel: MockBrokerChannel) -> Subscriber {
        Subscriber::new(connection_on(channel), "peril_dlx")
    }

    fn pause_topology() -> QueueTopology {
        QueueTopology::transient("peril_direct", "pause.alice", "pause")
    }

    #[tokio::test]
    async fn prefetch_and_manual_ack_feed_are_configured() {
        let mut channel = declared_channel();
        channel
            .expect_set_prefetch()
            .with(eq(DEFAULT_PREFETCH))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .with(eq("pause.alice"), eq("pause-consumer"))
            .times(1)
            .returning(|_, _| Ok(stream::empty().boxed()));
        channel.expect_close().returning(|| Ok(()));

        let subscriber = subscriber_on(channel)
            .options(SubscribeOptions::default().consumer_tag("pause-consumer"));
        let subscription = subscriber
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .unwrap();

        assert_eq!(subscription.queue(), "pause.alice");
        assert_eq!(subscription.join().await, Ok(SubscriptionExit::FeedClosed));
    }

    #[tokio::test]
    async fn qos_failure_aborts_setup_and_closes_channel() {
        let mut channel = declared_channel();
        channel
            .expect_set_prefetch()
            .returning(|_| Err(AmqpError::ChannelError));
        channel.expect_consume().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let err = subscriber_on(channel)
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .err()
            .unwrap();

        assert!(matches!(err, AmqpError::QoSDeclarationError(_)));
        assert!(err.is_setup_error());
    }

    #[tokio::test]
    async fn consume_failure_aborts_setup() {
        let mut channel = declared_channel();
        channel.expect_set_prefetch().returning(|_| Ok(()));
        channel
            .expect_consume()
            .returning(|_, _| Err(AmqpError::ChannelError));
        channel.expect_close().times(1).returning(|| Ok(()));

        let err = subscriber_on(channel)
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .err()
            .unwrap();

        assert_eq!(err, AmqpError::BindingConsumerError("pause.alice".into()));
    }

    #[tokio::test]
    async fn feed_errors_do_not_stop_the_loop() {
        let mut channel = declared_channel();
        channel.expect_set_prefetch().returning(|_| Ok(()));
        channel.expect_consume().returning(|_, _| {
            Ok(stream::iter(vec![
                Err(AmqpError::ConsumerError("frame".into())),
                Ok(delivery(1, b"true")),
            ])
            .boxed())
        });
        channel.expect_ack().with(eq(1)).times(1).returning(|_| Ok(()));

        let subscription = subscriber_on(channel)
            .subscribe_json(&pause_topology(), |paused: bool| async move {
                assert!(paused);
                AckVerdict::Ack
            })
            .await
            .unwrap();

        assert_eq!(subscription.join().await, Ok(SubscriptionExit::FeedClosed));
    }

    #[tokio::test]
    async fn halt_policy_ends_loop_with_decode_error() {
        let mut channel = declared_channel();
        channel.expect_set_prefetch().returning(|_| Ok(()));
        channel.expect_consume().returning(|_, _| {
            Ok(stream::iter(vec![Ok(delivery(1, b"garbage")), Ok(delivery(2, b"true"))]).boxed())
        });
        channel
            .expect_nack()
            .with(eq(1), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_ack().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let subscription = subscriber_on(channel)
            .options(SubscribeOptions::default().on_decode_failure(DecodeFailurePolicy::Halt))
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(1), subscription.join())
            .await
            .unwrap();
        assert!(matches!(exit, Err(AmqpError::DecodeError(_))));
    }

    #[tokio::test]
    async fn stop_closes_the_channel() {
        let mut channel = declared_channel();
        channel.expect_set_prefetch().returning(|_| Ok(()));
        channel
            .expect_consume()
            .returning(|_, _| Ok(stream::pending().boxed()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let subscription = subscriber_on(channel)
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .unwrap();

        assert!(subscription.is_active());
        assert_eq!(subscription.stop().await, Ok(SubscriptionExit::Cancelled));
    }

    #[tokio::test]
    async fn qos_error_from_channel_is_passed_through() {
        let mut channel = declared_channel();
        channel
            .expect_set_prefetch()
            .returning(|_| Err(AmqpError::QoSDeclarationError("prefetch refused".into())));
        channel.expect_consume().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let err = subscriber_on(channel)
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .err()
            .unwrap();

        assert_eq!(err, AmqpError::QoSDeclarationError("prefetch refused".into()));
    }

    #[tokio::test]
    async fn configured_prefetch_and_dead_letter_exchange_are_applied() {
        let mut cfg = Configs::default();
        cfg.rabbitmq.prefetch = 3;
        cfg.rabbitmq.dead_letter_exchange = "game_dlx".into();

        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.dead_letter() == Some("game_dlx"))
            .times(1)
            .returning(|def| {
                Ok(QueueHandle {
                    name: def.name().to_owned(),
                    message_count: 0,
                    consumer_count: 0,
                })
            });
        channel.expect_bind_queue().returning(|_| Ok(()));
        channel
            .expect_set_prefetch()
            .with(eq(3))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .returning(|_, _| Ok(stream::empty().boxed()));

        let subscriber = Subscriber::from_configs(connection_on(channel), &cfg);
        assert_eq!(subscriber.topology().dead_letter_exchange(), "game_dlx");

        let subscription = subscriber
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .unwrap();
        assert_eq!(subscription.join().await, Ok(SubscriptionExit::FeedClosed));
    }

    #[tokio::test]
    async fn abort_closes_the_channel_in_background() {
        let closed = Arc::new(AtomicBool::new(false));

        let mut channel = declared_channel();
        channel.expect_set_prefetch().returning(|_| Ok(()));
        channel
            .expect_consume()
            .returning(|_, _| Ok(stream::pending().boxed()));
        let flag = closed.clone();
        channel.expect_close().times(1).returning(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let subscription = subscriber_on(channel)
            .subscribe_json(&pause_topology(), |_: bool| async { AckVerdict::Ack })
            .await
            .unwrap();
        subscription.abort();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !closed.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
