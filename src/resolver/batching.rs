use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::MessageResolver;
use crate::client::{SharedQueueClient, log_client_error};
use crate::dynamic::Dynamic;
use crate::errors::ResolveError;
use crate::message::{DeleteEntry, MAX_NUMBER_OF_MESSAGES_IN_BATCH, Message, SharedQueueProperties};

type Completion = oneshot::Sender<Result<(), ResolveError>>;

struct Resolution {
    message: Message,
    completion: Completion,
}

/// Properties of a [`BatchingMessageResolver`].
#[derive(Debug, Clone)]
pub struct BatchingMessageResolverProperties {
    /// Messages per delete call, clamped to `1..=10`.
    pub buffering_size_limit: Dynamic<usize>,
    /// Longest time the first buffered message waits before a partial batch is sent.
    pub buffering_time: Dynamic<Duration>,
}

impl Default for BatchingMessageResolverProperties {
    fn default() -> Self {
        BatchingMessageResolverProperties {
            buffering_size_limit: Dynamic::fixed(MAX_NUMBER_OF_MESSAGES_IN_BATCH),
            buffering_time: Dynamic::fixed(Duration::from_secs(5)),
        }
    }
}

/// Resolver that deletes messages in batches.
///
/// A batch is sent once `buffering_size_limit` messages are waiting or
/// `buffering_time` has passed since the first of them was queued. Entries of
/// a batch succeed or fail independently and failed deletions are not
/// retried: the message becomes visible again once its visibility timeout
/// expires and is redelivered.
pub struct BatchingMessageResolver {
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    properties: BatchingMessageResolverProperties,
    sender: mpsc::UnboundedSender<Resolution>,
    receiver: Mutex<mpsc::UnboundedReceiver<Resolution>>,
}

impl BatchingMessageResolver {
    pub fn new(
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        properties: BatchingMessageResolverProperties,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        BatchingMessageResolver {
            client,
            queue,
            properties,
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    fn batch_size(&self) -> usize {
        self.properties
            .buffering_size_limit
            .get()
            .clamp(1, MAX_NUMBER_OF_MESSAGES_IN_BATCH)
    }

    fn submit(&self, batches: &mut JoinSet<()>, batch: Vec<Resolution>) {
        if batch.is_empty() {
            return;
        }
        batches.spawn(delete_batch(self.client.clone(), self.queue.clone(), batch));
    }
}

async fn delete_batch(client: SharedQueueClient, queue: SharedQueueProperties, batch: Vec<Resolution>) {
    // The same message may have been resolved twice; SQS rejects duplicate entry ids.
    let mut completions: HashMap<String, Vec<Completion>> = HashMap::new();
    let mut entries = Vec::with_capacity(batch.len());
    for Resolution { message, completion } in batch {
        let waiting = completions.entry(message.message_id().to_string()).or_default();
        if waiting.is_empty() {
            entries.push(DeleteEntry::from(&message));
        }
        waiting.push(completion);
    }

    debug!(queue_url = %queue, count = entries.len(), "Sending batch deletion");
    let result = match client.delete_message_batch(queue.queue_url(), entries).await {
        Ok(result) => result,
        Err(error) => {
            log_client_error("DeleteMessageBatch", queue.queue_url(), &error);
            let failure = ResolveError::BatchFailed(error.to_string());
            for completion in completions.into_values().flatten() {
                let _ = completion.send(Err(failure.clone()));
            }
            return;
        }
    };

    debug!(
        queue_url = %queue,
        successful = result.successful.len(),
        failed = result.failed.len(),
        "Batch deletion completed"
    );
    for id in result.successful {
        for completion in completions.remove(&id).into_iter().flatten() {
            let _ = completion.send(Ok(()));
        }
    }
    for failure in result.failed {
        error!(
            queue_url = %queue,
            message_id = %failure.id,
            code = %failure.code,
            error = %failure.message,
            "Failed to delete message"
        );
        let entry_error = ResolveError::EntryFailed {
            message_id: failure.id.clone(),
            code: failure.code,
            message: failure.message,
        };
        for completion in completions.remove(&failure.id).into_iter().flatten() {
            let _ = completion.send(Err(entry_error.clone()));
        }
    }
    if !completions.is_empty() {
        error!(
            queue_url = %queue,
            count = completions.len(),
            "Messages were not handled by the batch deletion"
        );
        for (message_id, waiting) in completions {
            for completion in waiting {
                let _ = completion.send(Err(ResolveError::EntryMissing {
                    message_id: message_id.clone(),
                }));
            }
        }
    }
}

#[async_trait]
impl MessageResolver for BatchingMessageResolver {
    fn resolve_message(&self, message: Message) -> BoxFuture<'static, Result<(), ResolveError>> {
        let (completion, outcome) = oneshot::channel();
        trace!(message_id = %message.message_id(), "Queueing message for deletion");
        if self.sender.send(Resolution { message, completion }).is_err() {
            return future::ready(Err(ResolveError::Stopped)).boxed();
        }
        async move { outcome.await.unwrap_or(Err(ResolveError::Stopped)) }.boxed()
    }

    async fn run(&self, cancel: CancellationToken) {
        info!(queue_url = %self.queue, "Started batching message resolver");
        let mut receiver = self.receiver.lock().await;
        let mut batches = JoinSet::new();

        let mut shutting_down = false;
        while !shutting_down {
            let batch_size = self.batch_size();
            let mut batch = Vec::with_capacity(batch_size);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                resolution = receiver.recv() => match resolution {
                    Some(resolution) => batch.push(resolution),
                    None => break,
                },
            }

            let deadline = Instant::now() + self.properties.buffering_time.get();
            while batch.len() < batch_size {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        shutting_down = true;
                        break;
                    }
                    resolution = receiver.recv() => match resolution {
                        Some(resolution) => batch.push(resolution),
                        None => {
                            shutting_down = true;
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            self.submit(&mut batches, batch);
            while batches.try_join_next().is_some() {}
        }

        // Later calls to resolve_message fail fast once the channel is closed.
        receiver.close();
        let mut remaining = Vec::new();
        while let Ok(resolution) = receiver.try_recv() {
            remaining.push(resolution);
        }
        if !remaining.is_empty() {
            debug!(queue_url = %self.queue, count = remaining.len(), "Flushing buffered messages");
        }
        let batch_size = self.batch_size();
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(batch_size));
            self.submit(&mut batches, remaining);
            remaining = rest;
        }

        debug!(queue_url = %self.queue, count = batches.len(), "Waiting for batch deletions to complete");
        while let Some(result) = batches.join_next().await {
            if let Err(error) = result {
                error!(queue_url = %self.queue, error = %error, "Batch deletion task failed");
            }
        }
        info!(queue_url = %self.queue, "Batching message resolver stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{InMemoryQueueClient, QueueClient};
    use crate::message::{OutgoingMessage, QueueProperties, ReceiveRequest};

    const QUEUE: &str = "http://localhost/queue/resolver";

    async fn received_messages(client: &InMemoryQueueClient, count: usize) -> Vec<Message> {
        for index in 0..count {
            client
                .send_message(QUEUE, OutgoingMessage::new(format!("body-{index}")))
                .await
                .unwrap();
        }
        let mut messages = Vec::new();
        while messages.len() < count {
            let request = ReceiveRequest::new(QUEUE, count - messages.len()).wait_time(Duration::ZERO);
            messages.extend(client.receive_messages(request).await.unwrap());
        }
        messages
    }

    fn resolver(client: &Arc<InMemoryQueueClient>, size: usize, time: Duration) -> Arc<BatchingMessageResolver> {
        Arc::new(BatchingMessageResolver::new(
            client.clone(),
            Arc::new(QueueProperties::new(QUEUE)),
            BatchingMessageResolverProperties {
                buffering_size_limit: size.into(),
                buffering_time: time.into(),
            },
        ))
    }

    fn spawn_run(resolver: &Arc<BatchingMessageResolver>, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(resolver);
        let cancel = cancel.clone();
        tokio::spawn(async move { resolver.run(cancel).await })
    }

    fn batch_sizes(client: &InMemoryQueueClient) -> Vec<usize> {
        client.delete_batches().iter().map(Vec::len).collect()
    }

    #[tokio::test]
    async fn full_batches_are_sent_and_remainder_flushed_on_stop() {
        let client = Arc::new(InMemoryQueueClient::new());
        let messages = received_messages(&client, 7).await;
        let resolver = resolver(&client, 3, Duration::from_secs(60));
        let outcomes: Vec<_> = messages.into_iter().map(|m| resolver.resolve_message(m)).collect();

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        tokio::time::timeout(Duration::from_secs(1), async {
            while batch_sizes(&client).len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(batch_sizes(&client), vec![3, 3]);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(batch_sizes(&client), vec![3, 3, 1]);
        for outcome in future::join_all(outcomes).await {
            assert!(outcome.is_ok());
        }
        assert_eq!(client.deleted_message_ids(QUEUE).len(), 7);
    }

    #[tokio::test]
    async fn partial_batch_is_flushed_after_buffering_time() {
        let client = Arc::new(InMemoryQueueClient::new());
        let message = received_messages(&client, 1).await.remove(0);
        let resolver = resolver(&client, 10, Duration::from_millis(100));

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(1), resolver.resolve_message(message))
            .await
            .unwrap();

        assert!(outcome.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(80));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn size_limit_is_clamped_to_service_maximum() {
        let client = Arc::new(InMemoryQueueClient::new());
        let messages = received_messages(&client, 12).await;
        let resolver = resolver(&client, 25, Duration::from_millis(50));
        let outcomes: Vec<_> = messages.into_iter().map(|m| resolver.resolve_message(m)).collect();

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        future::join_all(outcomes).await;

        assert_eq!(batch_sizes(&client), vec![10, 2]);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_entries_do_not_affect_others_and_are_not_retried() {
        let client = Arc::new(InMemoryQueueClient::new());
        let messages = received_messages(&client, 3).await;
        client.fail_deletes_for(messages[1].message_id());
        let resolver = resolver(&client, 3, Duration::from_secs(60));
        let outcomes: Vec<_> = messages.iter().cloned().map(|m| resolver.resolve_message(m)).collect();

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        let outcomes = future::join_all(outcomes).await;

        assert!(outcomes[0].is_ok());
        assert!(matches!(&outcomes[1], Err(ResolveError::EntryFailed { code, .. }) if code == "InternalError"));
        assert!(outcomes[2].is_ok());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(client.delete_batches().len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_call_fails_every_entry() {
        let client = Arc::new(InMemoryQueueClient::new());
        let messages = received_messages(&client, 2).await;
        client.fail_next_delete_calls(1);
        let resolver = resolver(&client, 2, Duration::from_secs(60));
        let outcomes: Vec<_> = messages.into_iter().map(|m| resolver.resolve_message(m)).collect();

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        for outcome in future::join_all(outcomes).await {
            assert!(matches!(outcome, Err(ResolveError::BatchFailed(_))));
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_resolutions_share_one_entry() {
        let client = Arc::new(InMemoryQueueClient::new());
        let message = received_messages(&client, 1).await.remove(0);
        let resolver = resolver(&client, 2, Duration::from_secs(60));
        let first = resolver.resolve_message(message.clone());
        let second = resolver.resolve_message(message);

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        let (first, second) = future::join(first, second).await;

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(batch_sizes(&client), vec![1]);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn resolving_after_stop_fails_fast() {
        let client = Arc::new(InMemoryQueueClient::new());
        let message = received_messages(&client, 1).await.remove(0);
        let resolver = resolver(&client, 10, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        cancel.cancel();
        resolver.run(cancel).await;

        assert!(matches!(
            resolver.resolve_message(message).await,
            Err(ResolveError::Stopped)
        ));
    }

    #[tokio::test]
    async fn deleting_from_a_missing_queue_fails_the_whole_batch() {
        let client = Arc::new(InMemoryQueueClient::new());
        let resolver = Arc::new(BatchingMessageResolver::new(
            client.clone(),
            Arc::new(QueueProperties::new("http://localhost/queue/missing")),
            BatchingMessageResolverProperties {
                buffering_size_limit: 2.into(),
                buffering_time: Duration::from_secs(60).into(),
            },
        ));
        let outcomes = vec![
            resolver.resolve_message(Message::builder("id-1", "handle-1").build()),
            resolver.resolve_message(Message::builder("id-2", "handle-2").build()),
        ];

        let cancel = CancellationToken::new();
        let handle = spawn_run(&resolver, &cancel);
        for outcome in future::join_all(outcomes).await {
            assert!(matches!(outcome, Err(ResolveError::BatchFailed(reason)) if reason.contains("queue not found")));
        }
        cancel.cancel();
        handle.await.unwrap();
    }
}
