//! Resolution (deletion) of successfully processed messages.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::errors::ResolveError;
use crate::message::Message;

mod batching;

pub use batching::{BatchingMessageResolver, BatchingMessageResolverProperties};

#[async_trait]
pub trait MessageResolver: Send + Sync {
    /// Queues `message` for deletion.
    ///
    /// The message is enqueued before this returns, so the returned future
    /// only needs to be awaited by callers interested in the outcome.
    fn resolve_message(&self, message: Message) -> BoxFuture<'static, Result<(), ResolveError>>;

    /// Runs the background loop that deletes queued messages until `cancel`
    /// fires. Everything queued by then is still deleted before returning.
    async fn run(&self, cancel: CancellationToken);
}

pub type SharedMessageResolver = Arc<dyn MessageResolver>;
