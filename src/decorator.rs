//! Hooks around message processing.
//!
//! Decorators are attached to a [`DecoratingMessageProcessor`] and called at
//! each stage of a message's lifecycle. Entry hooks run in the order the
//! decorators were registered and exit hooks in reverse order, like nested
//! middleware.
//!
//! [`DecoratingMessageProcessor`]: crate::processor::DecoratingMessageProcessor

use std::sync::Arc;

use crate::errors::{BoxError, MessageProcessingError, ResolveError};
use crate::message::Message;
use crate::processor::MessageProcessingContext;

mod auto_visibility;

pub use auto_visibility::{AutoVisibilityExtenderDecorator, AutoVisibilityExtenderProperties};

/// Observer of message processing.
///
/// Every hook has an empty default so implementations only override what they
/// need. Hooks cannot change the outcome of processing, with one exception: an
/// error from [`on_pre_processing`](Self::on_pre_processing) fails the message
/// before the handler runs. Panics in the other hooks are logged and ignored.
pub trait MessageProcessingDecorator: Send + Sync {
    /// Called before the handler runs.
    fn on_pre_processing(&self, _context: &MessageProcessingContext, _message: &Message) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called after the handler succeeded.
    fn on_post_processing(&self, _context: &MessageProcessingContext, _message: &Message) {}

    /// Called after the handler (or a pre-processing hook) failed.
    fn on_error(&self, _context: &MessageProcessingContext, _message: &Message, _error: &MessageProcessingError) {}

    /// Called once processing has finished, whatever the outcome.
    fn on_processing_complete(&self, _context: &MessageProcessingContext, _message: &Message) {}

    /// Called when the message is handed to the resolver, automatically or by
    /// a manual acknowledgement.
    fn on_resolve(&self, _context: &MessageProcessingContext, _message: &Message) {}

    fn on_resolve_success(&self, _context: &MessageProcessingContext, _message: &Message) {}

    fn on_resolve_failure(&self, _context: &MessageProcessingContext, _message: &Message, _error: &ResolveError) {}
}

pub type SharedMessageProcessingDecorator = Arc<dyn MessageProcessingDecorator>;
