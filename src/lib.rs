// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed RabbitMQ Consumption
//!
//! Subscribes typed handlers to RabbitMQ queues. A subscription declares its
//! queue (dead-lettered to a shared exchange), binds it to an exchange with a
//! routing pattern, caps in-flight deliveries with a prefetch window and runs
//! a background loop that decodes every delivery, hands it to the handler and
//! settles it according to the handler's [`AckVerdict`].
//!
//! ```no_run
//! use serde::Deserialize;
//! use typed_rabbitmq::{
//!     channel::AmqpConnection, configs::load_configs, AckVerdict, QueueTopology, Subscriber,
//! };
//!
//! #[derive(Deserialize)]
//! struct ArmyMove {
//!     player: String,
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = load_configs()?;
//! let conn = AmqpConnection::connect(&cfg).await?;
//! let subscriber = Subscriber::new(conn, &cfg.rabbitmq.dead_letter_exchange);
//!
//! let subscription = subscriber
//!     .subscribe_json(
//!         &QueueTopology::transient("peril_topic", "army_moves.alice", "army_moves.*"),
//!         |mv: ArmyMove| async move {
//!             println!("{} moved", mv.player);
//!             AckVerdict::Ack
//!         },
//!     )
//!     .await?;
//!
//! subscription.stop().await?;
//! # Ok(())
//! # }
//! ```

mod otel;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use codec::{Bincode, Codec, Json};
pub use consumer::{AckVerdict, DecodeFailurePolicy, MessageHandler};
pub use dispatcher::{SubscribeOptions, Subscriber, Subscription, SubscriptionExit};
pub use errors::AmqpError;
pub use queue::QueueKind;
pub use topology::{QueueTopology, TopologyManager};
