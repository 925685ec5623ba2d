//! Execution of user message handlers.
//!
//! A [`MessageProcessor`] runs the business logic for a single message and,
//! when that succeeds, resolves the message through the callback it was
//! given. The handler sees the message plus a [`HandlerContext`] carrying the
//! manual [`Acknowledge`] and [`VisibilityExtender`] capabilities.
//!
//! # Example
//!
//! ```rust,no_run
//! use rs_sqs_listener::errors::BoxError;
//! use rs_sqs_listener::message::Message;
//! use rs_sqs_listener::processor::handler_fn;
//!
//! let handler = handler_fn(
//!     |message: Message, prefix: String| async move {
//!         println!("{prefix}{}", message.body());
//!         Ok::<(), BoxError>(())
//!     },
//!     "received: ".to_string(),
//! );
//! ```

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::errors::{BoxError, MessageProcessingError, ResolveError};
use crate::message::Message;

mod acknowledge;
mod decorating;
mod functions;
mod handler;

pub use acknowledge::{Acknowledge, DEFAULT_VISIBILITY_EXTENSION, VisibilityExtender};
pub use decorating::{DecoratingMessageProcessor, MessageProcessingContext};
pub use functions::{FnMessageHandler, handler_fn};
pub use handler::{AcknowledgeMode, HandlerMessageProcessor};

/// Callback that queues the message being processed for resolution.
pub type ResolveCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ResolveError>> + Send + Sync>;

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Processes one message, calling `resolve` once it may be deleted.
    ///
    /// An `Err` means the message was not processed successfully and has not
    /// been resolved; it will be redelivered after its visibility timeout.
    async fn process_message(&self, message: Message, resolve: ResolveCallback) -> Result<(), MessageProcessingError>;
}

pub type SharedMessageProcessor = Arc<dyn MessageProcessor>;

/// User business logic for messages of one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, context: HandlerContext) -> Result<(), BoxError>;
}

pub type SharedMessageHandler = Arc<dyn MessageHandler>;

/// Capabilities available to a handler while it processes a message.
#[derive(Clone)]
pub struct HandlerContext {
    acknowledge: Acknowledge,
    visibility_extender: VisibilityExtender,
}

impl HandlerContext {
    pub fn new(acknowledge: Acknowledge, visibility_extender: VisibilityExtender) -> Self {
        HandlerContext {
            acknowledge,
            visibility_extender,
        }
    }

    pub fn acknowledge(&self) -> &Acknowledge {
        &self.acknowledge
    }

    pub fn visibility_extender(&self) -> &VisibilityExtender {
        &self.visibility_extender
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
