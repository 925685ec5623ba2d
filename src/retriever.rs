//! Strategies for obtaining messages from the queue.
//!
//! A retriever is driven by two parties: the broker asks for one message at a
//! time through [`MessageRetriever::retrieve_message`], while the container runs
//! [`MessageRetriever::run`] as a background task that talks to the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::errors::RetrieverError;
use crate::message::Message;

mod batching;
mod prefetching;

pub use batching::{BatchingMessageRetriever, BatchingMessageRetrieverProperties};
pub use prefetching::{PrefetchingMessageRetriever, PrefetchingMessageRetrieverProperties};

/// Backoff applied after a failed receive when none is configured.
pub const DEFAULT_ERROR_BACKOFF_TIME: Duration = Duration::from_secs(10);

#[async_trait]
pub trait MessageRetriever: Send + Sync {
    /// Registers demand for one message.
    ///
    /// Demand is recorded before this returns; the future resolves once a
    /// message has been assigned to it. Dropping the future withdraws the
    /// demand. Fails with [`RetrieverError::Stopped`] once [`run`](Self::run)
    /// has finished.
    fn retrieve_message(&self) -> BoxFuture<'static, Result<Message, RetrieverError>>;

    /// Runs the retrieval loop until `cancel` fires.
    ///
    /// Returns the messages that were received from the queue but never handed
    /// out, so the container can process them before shutting down.
    async fn run(&self, cancel: CancellationToken) -> Vec<Message>;
}

pub type SharedMessageRetriever = Arc<dyn MessageRetriever>;
