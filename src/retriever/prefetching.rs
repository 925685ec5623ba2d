use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DEFAULT_ERROR_BACKOFF_TIME, MessageRetriever};
use crate::backoff::sleep_unless_cancelled;
use crate::client::{SharedQueueClient, log_client_error};
use crate::dynamic::Dynamic;
use crate::errors::{ConfigurationError, RetrieverError};
use crate::message::{MAX_NUMBER_OF_MESSAGES_FROM_SQS, Message, ReceiveRequest, SharedQueueProperties};

/// Properties of a [`PrefetchingMessageRetriever`].
#[derive(Debug, Clone)]
pub struct PrefetchingMessageRetrieverProperties {
    /// The retriever fetches more messages whenever fewer than this many are buffered.
    pub desired_min_prefetched_messages: usize,
    /// Upper bound on buffered messages.
    pub max_prefetched_messages: usize,
    pub message_visibility_timeout: Option<Dynamic<Duration>>,
    pub error_backoff_time: Dynamic<Duration>,
}

impl Default for PrefetchingMessageRetrieverProperties {
    fn default() -> Self {
        PrefetchingMessageRetrieverProperties {
            desired_min_prefetched_messages: 1,
            max_prefetched_messages: MAX_NUMBER_OF_MESSAGES_FROM_SQS,
            message_visibility_timeout: None,
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
        }
    }
}

impl PrefetchingMessageRetrieverProperties {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.desired_min_prefetched_messages == 0 {
            return Err(ConfigurationError::invalid(
                "desired_min_prefetched_messages",
                "must be greater than zero",
            ));
        }
        if self.max_prefetched_messages < self.desired_min_prefetched_messages {
            return Err(ConfigurationError::invalid(
                "max_prefetched_messages",
                "must be greater than or equal to desired_min_prefetched_messages",
            ));
        }
        Ok(())
    }
}

struct PrefetchBuffer {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
    buffered: AtomicUsize,
    slot_freed: Notify,
    stopped: CancellationToken,
}

/// Retriever that keeps a local buffer of messages topped up in the background.
///
/// Whenever fewer than `desired_min_prefetched_messages` are buffered, a
/// receive is issued for enough messages to fill the buffer up to
/// `max_prefetched_messages` (at most ten per call). Callers take messages
/// from the buffer in the order they asked.
///
/// Prefetched messages sit in memory while their visibility timeout runs, so
/// a large buffer on a slow consumer can lead to redeliveries.
pub struct PrefetchingMessageRetriever {
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    properties: PrefetchingMessageRetrieverProperties,
    buffer: Arc<PrefetchBuffer>,
}

impl PrefetchingMessageRetriever {
    pub fn new(
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        properties: PrefetchingMessageRetrieverProperties,
    ) -> Result<Self, ConfigurationError> {
        properties.validate()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(PrefetchingMessageRetriever {
            client,
            queue,
            properties,
            buffer: Arc::new(PrefetchBuffer {
                sender,
                receiver: Mutex::new(receiver),
                buffered: AtomicUsize::new(0),
                slot_freed: Notify::new(),
                stopped: CancellationToken::new(),
            }),
        })
    }

    /// Number of messages received but not yet handed out.
    pub fn buffered_messages(&self) -> usize {
        self.buffer.buffered.load(Ordering::SeqCst)
    }

    fn receive_request(&self, number_of_messages: usize) -> ReceiveRequest {
        ReceiveRequest::new(self.queue.queue_url(), number_of_messages).visibility_timeout(
            self.properties
                .message_visibility_timeout
                .as_ref()
                .map(Dynamic::get),
        )
    }

    /// Waits until the buffer drops below the desired minimum. Returns `false`
    /// if cancelled first.
    async fn wait_for_free_slot(&self, cancel: &CancellationToken) -> bool {
        while self.buffered_messages() >= self.properties.desired_min_prefetched_messages {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.buffer.slot_freed.notified() => {}
            }
        }
        true
    }
}

#[async_trait]
impl MessageRetriever for PrefetchingMessageRetriever {
    fn retrieve_message(&self) -> BoxFuture<'static, Result<Message, RetrieverError>> {
        let buffer = Arc::clone(&self.buffer);
        async move {
            let mut receiver = tokio::select! {
                biased;
                _ = buffer.stopped.cancelled() => return Err(RetrieverError::Stopped),
                receiver = buffer.receiver.lock() => receiver,
            };
            let message = tokio::select! {
                biased;
                _ = buffer.stopped.cancelled() => return Err(RetrieverError::Stopped),
                message = receiver.recv() => message.ok_or(RetrieverError::Stopped)?,
            };
            buffer.buffered.fetch_sub(1, Ordering::SeqCst);
            buffer.slot_freed.notify_one();
            Ok(message)
        }
        .boxed()
    }

    async fn run(&self, cancel: CancellationToken) -> Vec<Message> {
        info!(
            queue_url = %self.queue,
            desired_min = self.properties.desired_min_prefetched_messages,
            max = self.properties.max_prefetched_messages,
            "Started prefetching message retriever"
        );

        loop {
            if !self.wait_for_free_slot(&cancel).await {
                break;
            }

            let free_slots = self
                .properties
                .max_prefetched_messages
                .saturating_sub(self.buffered_messages());
            let number_of_messages = free_slots.min(MAX_NUMBER_OF_MESSAGES_FROM_SQS);
            debug!(queue_url = %self.queue, count = number_of_messages, "Prefetching messages");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.client.receive_messages(self.receive_request(number_of_messages)) => result,
            };
            match result {
                Ok(messages) => {
                    debug!(queue_url = %self.queue, count = messages.len(), "Received messages");
                    for message in messages {
                        self.buffer.buffered.fetch_add(1, Ordering::SeqCst);
                        // The receiving half lives in the buffer, so this cannot fail.
                        let _ = self.buffer.sender.send(message);
                    }
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

        self.buffer.stopped.cancel();
        let mut receiver = self.buffer.receiver.lock().await;
        receiver.close();
        let mut leftover = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            leftover.push(message);
        }
        self.buffer.buffered.store(0, Ordering::SeqCst);

        info!(
            queue_url = %self.queue,
            leftover = leftover.len(),
            "Prefetching message retriever stopped"
        );
        leftover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientCall, InMemoryQueueClient, QueueClient};
    use crate::message::{OutgoingMessage, QueueProperties};

    const QUEUE: &str = "http://localhost/queue/prefetching";

    fn retriever(client: &Arc<InMemoryQueueClient>, desired_min: usize, max: usize) -> Arc<PrefetchingMessageRetriever> {
        let properties = PrefetchingMessageRetrieverProperties {
            desired_min_prefetched_messages: desired_min,
            max_prefetched_messages: max,
            message_visibility_timeout: None,
            error_backoff_time: Duration::from_millis(10).into(),
        };
        Arc::new(PrefetchingMessageRetriever::new(client.clone(), Arc::new(QueueProperties::new(QUEUE)), properties).unwrap())
    }

    async fn send(client: &InMemoryQueueClient, count: usize) {
        for index in 0..count {
            client
                .send_message(QUEUE, OutgoingMessage::new(format!("body-{index}")))
                .await
                .unwrap();
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition was not met in time");
    }

    fn receive_sizes(client: &InMemoryQueueClient) -> Vec<usize> {
        client
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::Receive {
                    max_number_of_messages,
                    returned,
                } if returned > 0 => Some(max_number_of_messages),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn properties_are_validated() {
        let zero_min = PrefetchingMessageRetrieverProperties {
            desired_min_prefetched_messages: 0,
            ..Default::default()
        };
        assert!(zero_min.validate().is_err());

        let inverted = PrefetchingMessageRetrieverProperties {
            desired_min_prefetched_messages: 5,
            max_prefetched_messages: 2,
            ..Default::default()
        };
        assert_eq!(
            inverted.validate().unwrap_err(),
            ConfigurationError::invalid(
                "max_prefetched_messages",
                "must be greater than or equal to desired_min_prefetched_messages"
            )
        );
    }

    #[tokio::test]
    async fn prefetches_up_to_the_maximum_and_tops_up_below_the_minimum() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 8).await;
        let retriever = retriever(&client, 2, 5);
        let cancel = CancellationToken::new();
        let handle = {
            let retriever = Arc::clone(&retriever);
            let cancel = cancel.clone();
            tokio::spawn(async move { retriever.run(cancel).await })
        };

        eventually(|| retriever.buffered_messages() == 5).await;
        assert_eq!(receive_sizes(&client), vec![5]);

        for _ in 0..4 {
            retriever.retrieve_message().await.unwrap();
        }
        eventually(|| retriever.buffered_messages() == 4).await;
        assert_eq!(receive_sizes(&client), vec![5, 4]);

        cancel.cancel();
        let leftover = handle.await.unwrap();
        assert_eq!(leftover.len(), 4);
        assert!(matches!(
            retriever.retrieve_message().await,
            Err(RetrieverError::Stopped)
        ));
    }

    #[tokio::test]
    async fn callers_wait_for_messages() {
        let client = Arc::new(InMemoryQueueClient::new());
        let retriever = retriever(&client, 1, 1);
        let cancel = CancellationToken::new();
        let handle = {
            let retriever = Arc::clone(&retriever);
            let cancel = cancel.clone();
            tokio::spawn(async move { retriever.run(cancel).await })
        };

        let request = retriever.retrieve_message();
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&client, 1).await;

        let message = tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body(), "body-0");

        cancel.cancel();
        assert!(handle.await.unwrap().is_empty());
    }
}
