//! # SQS Listener
//!
//! An asynchronous AWS SQS listener framework that takes care of receiving,
//! processing and deleting queue messages so that users only write the
//! handler.
//!
//! ## Features
//!
//! - Concurrency limits that can change while the listener is running
//! - Prefetching and batched receive strategies
//! - Batched deletion of processed messages
//! - FIFO queues with per message group ordering
//! - Decorator hooks around message processing, including automatic
//!   visibility extension for long running handlers
//! - Function handlers with shared resources or trait based handlers
//! - Graceful shutdown that finishes in-flight work and deletes what was processed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rs_sqs_listener::client::SqsQueueClient;
//! use rs_sqs_listener::container::{
//!     MessageListenerContainer, PrefetchingMessageListenerContainer,
//!     PrefetchingMessageListenerContainerProperties, handler_processor_factory,
//! };
//! use rs_sqs_listener::errors::BoxError;
//! use rs_sqs_listener::message::{Message, QueueProperties};
//! use rs_sqs_listener::processor::{AcknowledgeMode, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(SqsQueueClient::from_env().await);
//!     let queue = Arc::new(QueueProperties::new(
//!         "https://sqs.region.amazonaws.com/account/queue-name",
//!     ));
//!     let shared_data = "shared state".to_string();
//!
//!     let handler = handler_fn(
//!         |message: Message, shared: String| async move {
//!             println!("Processing message: {} with shared: {}", message.body(), shared);
//!             Ok::<(), BoxError>(())
//!         },
//!         shared_data,
//!     );
//!     let processor = handler_processor_factory(
//!         "my-listener",
//!         client.clone(),
//!         queue.clone(),
//!         Arc::new(handler),
//!         Vec::new(),
//!         AcknowledgeMode::Auto,
//!     );
//!
//!     let container = PrefetchingMessageListenerContainer::new(
//!         "my-listener",
//!         client,
//!         queue,
//!         processor,
//!         PrefetchingMessageListenerContainerProperties::new(10, 5, 20),
//!     )?;
//!     container.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     container.stop().await;
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod container;
pub mod coordinator;
pub mod decorator;
pub mod dynamic;
pub mod errors;
pub mod message;
pub mod processor;
pub mod resolver;
pub mod retriever;

mod backoff;

pub use client::{QueueClient, SharedQueueClient};
pub use container::{ContainerState, MessageListenerContainer};
pub use coordinator::ContainerCoordinator;
pub use dynamic::Dynamic;
pub use errors::{BoxError, ListenerError};
pub use message::{Message, QueueProperties};
