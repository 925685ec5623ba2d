//! Admission control: how many messages are processed at once and in what order.
//!
//! A [`MessageBroker`] pulls messages from a [`MessageSupplier`] and hands them
//! to a [`MessageDispatcher`] on the container's [`ProcessingPool`] until
//! [`KeepProcessing`] says to stop.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::errors::{MessageProcessingError, RetrieverError};
use crate::message::Message;

mod concurrent;
mod grouping;

pub use concurrent::{
    ConcurrentMessageBroker, ConcurrentMessageBrokerProperties, ConcurrentMessageBrokerPropertiesBuilder,
    DEFAULT_CONCURRENCY_POLLING_RATE,
};
pub use grouping::{GroupingFunction, GroupingMessageBroker, GroupingMessageBrokerProperties, message_group_id};

/// Registers demand for the next message, as [`MessageRetriever::retrieve_message`] does.
///
/// [`MessageRetriever::retrieve_message`]: crate::retriever::MessageRetriever::retrieve_message
pub type MessageSupplier = Arc<dyn Fn() -> BoxFuture<'static, Result<Message, RetrieverError>> + Send + Sync>;

/// Processes a message and resolves it on success.
pub type MessageDispatcher = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), MessageProcessingError>> + Send + Sync>;

/// Condition for a broker to keep requesting messages.
#[derive(Clone)]
pub struct KeepProcessing {
    token: CancellationToken,
    condition: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl KeepProcessing {
    /// Keeps processing until `token` is cancelled.
    pub fn until_cancelled(token: CancellationToken) -> Self {
        KeepProcessing { token, condition: None }
    }

    /// Keeps processing while `condition` holds and `token` is not cancelled.
    pub fn while_condition<F>(token: CancellationToken, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        KeepProcessing {
            token,
            condition: Some(Arc::new(condition)),
        }
    }

    pub fn should_continue(&self) -> bool {
        !self.token.is_cancelled() && self.condition.as_ref().is_none_or(|condition| condition())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Tasks processing messages for one container.
///
/// Every task can be dropped mid-flight through [`interrupt`](Self::interrupt),
/// which is how a container forcibly stops message processing.
#[derive(Clone, Default)]
pub struct ProcessingPool {
    tracker: TaskTracker,
    interrupt: CancellationToken,
}

impl ProcessingPool {
    pub fn new() -> Self {
        ProcessingPool::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let interrupt = self.interrupt.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Drops all running tasks at their next suspension point.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Waits until every spawned task has finished.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Runs until `keep_processing` says to stop. Messages already dispatched
    /// keep running on `pool` after this returns.
    async fn process_messages(
        &self,
        pool: &ProcessingPool,
        keep_processing: KeepProcessing,
        supplier: MessageSupplier,
        dispatcher: MessageDispatcher,
    );
}

pub type SharedMessageBroker = Arc<dyn MessageBroker>;
