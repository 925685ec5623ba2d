use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use super::ResolveCallback;
use crate::client::SharedQueueClient;
use crate::errors::{QueueClientError, ResolveError};
use crate::message::{Message, SharedQueueProperties, VisibilityEntry};

/// Visibility extension applied by [`VisibilityExtender::extend`].
pub const DEFAULT_VISIBILITY_EXTENSION: Duration = Duration::from_secs(30);

/// Resolves the message being processed before the handler returns.
///
/// Once a handler acknowledges, the processor no longer resolves the message
/// automatically on success.
#[derive(Clone)]
pub struct Acknowledge {
    resolve: ResolveCallback,
    acknowledged: Arc<AtomicBool>,
}

impl Acknowledge {
    pub fn new(resolve: ResolveCallback) -> Self {
        Acknowledge {
            resolve,
            acknowledged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queues the message for deletion. The returned future reports the
    /// outcome and does not have to be awaited.
    pub fn acknowledge(&self) -> BoxFuture<'static, Result<(), ResolveError>> {
        self.acknowledged.store(true, Ordering::SeqCst);
        (self.resolve)()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

/// Keeps the message being processed hidden from other consumers for longer.
#[derive(Clone)]
pub struct VisibilityExtender {
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    message: Message,
}

impl VisibilityExtender {
    pub fn new(client: SharedQueueClient, queue: SharedQueueProperties, message: Message) -> Self {
        VisibilityExtender { client, queue, message }
    }

    /// Extends the visibility timeout by [`DEFAULT_VISIBILITY_EXTENSION`].
    pub async fn extend(&self) -> Result<(), QueueClientError> {
        self.extend_by(DEFAULT_VISIBILITY_EXTENSION).await
    }

    /// Makes the message invisible for `visibility_timeout` from now.
    pub async fn extend_by(&self, visibility_timeout: Duration) -> Result<(), QueueClientError> {
        debug!(
            message_id = %self.message.message_id(),
            visibility_timeout_secs = visibility_timeout.as_secs(),
            "Extending message visibility"
        );
        let result = self
            .client
            .change_message_visibility_batch(
                self.queue.queue_url(),
                vec![VisibilityEntry::new(&self.message, visibility_timeout)],
            )
            .await?;
        match result.failed.into_iter().next() {
            Some(failure) => Err(QueueClientError::service(
                "ChangeMessageVisibility",
                format!("{}: {}", failure.code, failure.message),
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;

    use super::*;
    use crate::client::{InMemoryQueueClient, QueueClient};
    use crate::message::{OutgoingMessage, QueueProperties, ReceiveRequest};

    #[tokio::test]
    async fn acknowledge_resolves_and_records_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resolve: ResolveCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), ResolveError>(()) }.boxed()
        });
        let acknowledge = Acknowledge::new(resolve);
        let shared = acknowledge.clone();

        assert!(!acknowledge.is_acknowledged());
        shared.acknowledge().await.unwrap();
        assert!(acknowledge.is_acknowledged());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extend_changes_visibility_of_in_flight_message() {
        let queue_url = "http://localhost/queue/extend";
        let client = Arc::new(InMemoryQueueClient::new());
        client.send_message(queue_url, OutgoingMessage::new("x")).await.unwrap();
        let message = client
            .receive_messages(ReceiveRequest::new(queue_url, 1).wait_time(Duration::ZERO))
            .await
            .unwrap()
            .remove(0);

        let extender = VisibilityExtender::new(client.clone(), Arc::new(QueueProperties::new(queue_url)), message.clone());
        extender.extend().await.unwrap();

        client
            .delete_message_batch(queue_url, vec![(&message).into()])
            .await
            .unwrap();
        assert!(extender.extend().await.is_err());
    }
}
