//! InletMQ - reconnecting, back-pressured MQTT consumption pipeline
//!
//! # Overview
//!
//! This crate turns a raw MQTT subscription into a supervised consumption
//! pipeline:
//! - Transport adapter over an external MQTT client, with manual
//!   acknowledgements and session resumption
//! - Reconnection supervisor with exponential backoff and jitter
//! - Bounded inbox decoupling broker receipt from handler execution
//! - Dispatch workers with per-topic FIFO ordering, bounded retries and
//!   dead-lettering
//! - At-least-once delivery bookkeeping across reconnects
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use inletmq::config::ConsumerConfig;
//! use inletmq::consumer::Consumer;
//! use inletmq::dispatch::{HandlerOutcome, LogDeadLetter, MessageHandler};
//! use inletmq::error::HandlerError;
//! use inletmq::message::InboundMessage;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(
//!         &self,
//!         message: &InboundMessage,
//!     ) -> Result<HandlerOutcome, HandlerError> {
//!         println!("{} {}", message.topic, message.payload_lossy());
//!         Ok(HandlerOutcome::Ack)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConsumerConfig::load_from_file(Path::new("inletmq.toml"))?;
//!     let consumer = Consumer::start(config, Arc::new(Printer), Arc::new(LogDeadLetter))?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     let report = consumer.shutdown().await;
//!     println!("drained, {} unacked", report.unacked);
//!     Ok(())
//! }
//! ```

pub mod ack;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod inbox;
pub mod message;
pub mod observability;
pub mod supervisor;
pub mod testing;
pub mod transport;

// Re-export the types most integrations need
pub use ack::AckTracker;
pub use config::*;
pub use consumer::{Consumer, DrainReport};
pub use dispatch::{DeadLetterSink, Dispatcher, HandlerOutcome, LogDeadLetter, MessageHandler};
pub use error::{HandlerError, PipelineError, PipelineResult, TransportError};
pub use inbox::{Inbox, PushOutcome};
pub use message::{DeliveryTag, InboundMessage, QosLevel, TopicSubscription};
pub use supervisor::{ConnectionState, Supervisor};
pub use transport::{MqttTransport, Transport, TransportEvent};
