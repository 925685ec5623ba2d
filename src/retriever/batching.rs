use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{DEFAULT_ERROR_BACKOFF_TIME, MessageRetriever};
use crate::backoff::sleep_unless_cancelled;
use crate::client::{SharedQueueClient, log_client_error};
use crate::dynamic::Dynamic;
use crate::errors::RetrieverError;
use crate::message::{MAX_NUMBER_OF_MESSAGES_FROM_SQS, Message, ReceiveRequest, SharedQueueProperties};

type MessageSender = oneshot::Sender<Message>;

/// Properties of a [`BatchingMessageRetriever`].
#[derive(Debug, Clone)]
pub struct BatchingMessageRetrieverProperties {
    /// Number of waiting requests that triggers a receive call, clamped to `1..=10`.
    pub batch_size: Dynamic<usize>,
    /// Longest time to wait for `batch_size` requests before receiving anyway.
    pub batching_period: Dynamic<Duration>,
    /// Visibility timeout override sent with each receive.
    pub message_visibility_timeout: Option<Dynamic<Duration>>,
    pub error_backoff_time: Dynamic<Duration>,
}

impl Default for BatchingMessageRetrieverProperties {
    fn default() -> Self {
        BatchingMessageRetrieverProperties {
            batch_size: Dynamic::fixed(MAX_NUMBER_OF_MESSAGES_FROM_SQS),
            batching_period: Dynamic::fixed(Duration::from_secs(2)),
            message_visibility_timeout: None,
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
        }
    }
}

/// Retriever that coalesces requests for messages into batched receive calls.
///
/// Fewer network calls are made than with one receive per request, at the cost
/// of callers waiting for the batch to fill or for the batching period to
/// pass. If the queue returns fewer messages than were asked for, the
/// remaining callers wait for the next batch.
pub struct BatchingMessageRetriever {
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    properties: BatchingMessageRetrieverProperties,
    request_sender: mpsc::UnboundedSender<MessageSender>,
    requests: Mutex<mpsc::UnboundedReceiver<MessageSender>>,
    stopped: CancellationToken,
}

impl BatchingMessageRetriever {
    pub fn new(
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        properties: BatchingMessageRetrieverProperties,
    ) -> Self {
        let (request_sender, requests) = mpsc::unbounded_channel();
        BatchingMessageRetriever {
            client,
            queue,
            properties,
            request_sender,
            requests: Mutex::new(requests),
            stopped: CancellationToken::new(),
        }
    }

    fn batch_size(&self) -> usize {
        self.properties
            .batch_size
            .get()
            .clamp(1, MAX_NUMBER_OF_MESSAGES_FROM_SQS)
    }

    fn receive_request(&self, number_of_messages: usize) -> ReceiveRequest {
        ReceiveRequest::new(self.queue.queue_url(), number_of_messages).visibility_timeout(
            self.properties
                .message_visibility_timeout
                .as_ref()
                .map(Dynamic::get),
        )
    }
}

/// Gives unclaimed messages to waiting requests in order, skipping requests
/// whose caller has gone away.
fn hand_out(waiting: &mut VecDeque<MessageSender>, unclaimed: &mut VecDeque<Message>) {
    'messages: while let Some(mut message) = unclaimed.pop_front() {
        while let Some(sender) = waiting.pop_front() {
            match sender.send(message) {
                Ok(()) => continue 'messages,
                Err(returned) => message = returned,
            }
        }
        unclaimed.push_front(message);
        break;
    }
}

#[async_trait]
impl MessageRetriever for BatchingMessageRetriever {
    fn retrieve_message(&self) -> BoxFuture<'static, Result<Message, RetrieverError>> {
        let (sender, receiver) = oneshot::channel();
        if self.stopped.is_cancelled() || self.request_sender.send(sender).is_err() {
            return future::ready(Err(RetrieverError::Stopped)).boxed();
        }
        async move { receiver.await.map_err(|_| RetrieverError::Stopped) }.boxed()
    }

    async fn run(&self, cancel: CancellationToken) -> Vec<Message> {
        info!(queue_url = %self.queue, "Started batching message retriever");
        let mut requests = self.requests.lock().await;
        let mut waiting: VecDeque<MessageSender> = VecDeque::new();
        let mut unclaimed: VecDeque<Message> = VecDeque::new();

        'retrieval: loop {
            if waiting.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'retrieval,
                    request = requests.recv() => match request {
                        Some(sender) => waiting.push_back(sender),
                        None => break 'retrieval,
                    },
                }
            }

            hand_out(&mut waiting, &mut unclaimed);
            if waiting.is_empty() {
                continue;
            }

            let batch_size = self.batch_size();
            let batching_period = self.properties.batching_period.get();
            trace!(
                batch_size,
                batching_period_ms = batching_period.as_millis() as u64,
                waiting = waiting.len(),
                "Waiting for requests to fill batch"
            );
            let deadline = Instant::now() + batching_period;
            while waiting.len() < batch_size {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'retrieval,
                    _ = tokio::time::sleep_until(deadline) => break,
                    request = requests.recv() => match request {
                        Some(sender) => waiting.push_back(sender),
                        None => break 'retrieval,
                    },
                }
            }

            waiting.retain(|sender| !sender.is_closed());
            if waiting.is_empty() {
                continue;
            }

            let number_of_messages = waiting.len().min(MAX_NUMBER_OF_MESSAGES_FROM_SQS);
            debug!(queue_url = %self.queue, count = number_of_messages, "Requesting messages");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'retrieval,
                result = self.client.receive_messages(self.receive_request(number_of_messages)) => result,
            };

            match result {
                Ok(messages) => {
                    debug!(queue_url = %self.queue, count = messages.len(), "Received messages");
                    unclaimed.extend(messages);
                    hand_out(&mut waiting, &mut unclaimed);
                }
                Err(error) => {
                    log_client_error("ReceiveMessage", self.queue.queue_url(), &error);
                    let backoff = self.properties.error_backoff_time.get();
                    if !sleep_unless_cancelled(&cancel, backoff).await {
                        break;
                    }
                }
            }
        }

        self.stopped.cancel();
        requests.close();
        while requests.try_recv().is_ok() {}
        // Dropping the remaining senders fails their callers with `Stopped`.
        drop(waiting);

        info!(
            queue_url = %self.queue,
            leftover = unclaimed.len(),
            "Batching message retriever stopped"
        );
        unclaimed.into()
    }
}
