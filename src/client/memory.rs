//! In-memory queue client for tests and local development.
//!
//! Models the parts of SQS the listener depends on:
//! - visibility timeouts with redelivery of undeleted messages
//! - a fresh receipt handle per delivery and `ApproximateReceiveCount`
//! - long polling
//! - FIFO queues (`*.fifo`): a group with a message in flight is not delivered
//!   again until that message is deleted or becomes visible
//!
//! Failures can be injected and every call is recorded so tests can assert on
//! batching behaviour.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::QueueClient;
use crate::errors::QueueClientError;
use crate::message::{
    APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE, BatchFailure, BatchResult, DeleteEntry, MAX_NUMBER_OF_MESSAGES_IN_BATCH,
    MESSAGE_DEDUPLICATION_ID_ATTRIBUTE, MESSAGE_GROUP_ID_ATTRIBUTE, Message, OutgoingMessage, ReceiveRequest,
    VisibilityEntry,
};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const VISIBILITY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A call made against an [`InMemoryQueueClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Receive { max_number_of_messages: usize, returned: usize },
    DeleteBatch { message_ids: Vec<String> },
    ChangeVisibilityBatch { message_ids: Vec<String> },
    Send { message_id: String },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    message_id: String,
    body: String,
    message_attributes: HashMap<String, String>,
    group_id: Option<String>,
    deduplication_id: Option<String>,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Debug)]
struct InFlightMessage {
    message: StoredMessage,
    invisible_until: Instant,
}

#[derive(Debug)]
struct QueueState {
    fifo: bool,
    visibility_timeout: Duration,
    available: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlightMessage>,
    deleted: Vec<String>,
}

impl QueueState {
    fn new(queue_url: &str, visibility_timeout: Duration) -> Self {
        QueueState {
            fifo: queue_url.ends_with(".fifo"),
            visibility_timeout,
            available: VecDeque::new(),
            in_flight: HashMap::new(),
            deleted: Vec::new(),
        }
    }

    /// Puts a message back in sequence order so FIFO groups keep their order.
    fn make_available(&mut self, message: StoredMessage) {
        let position = self
            .available
            .iter()
            .position(|existing| existing.sequence > message.sequence)
            .unwrap_or(self.available.len());
        self.available.insert(position, message);
    }

    fn return_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.invisible_until <= now)
            .map(|(receipt_handle, _)| receipt_handle.clone())
            .collect();
        for receipt_handle in expired {
            if let Some(in_flight) = self.in_flight.remove(&receipt_handle) {
                self.make_available(in_flight.message);
            }
        }
    }

    fn take_deliverable(&mut self, max: usize, now: Instant) -> Vec<StoredMessage> {
        let mut blocked_groups: HashSet<String> = if self.fifo {
            self.in_flight
                .values()
                .filter_map(|in_flight| in_flight.message.group_id.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.available.len());
        while let Some(message) = self.available.pop_front() {
            let group_blocked = message
                .group_id
                .as_ref()
                .is_some_and(|group| blocked_groups.contains(group));
            if taken.len() < max && message.visible_at <= now && !group_blocked {
                taken.push(message);
            } else {
                if self.fifo {
                    // Later messages of a group must wait for earlier ones.
                    if let Some(group) = &message.group_id {
                        blocked_groups.insert(group.clone());
                    }
                }
                remaining.push_back(message);
            }
        }
        self.available = remaining;
        taken
    }
}

#[derive(Debug, Default)]
struct ClientState {
    queues: HashMap<String, QueueState>,
    calls: Vec<ClientCall>,
    next_sequence: u64,
    next_receipt: u64,
    failing_receives: usize,
    failing_delete_calls: usize,
    failing_delete_ids: HashSet<String>,
}

/// Thread-safe in-memory implementation of [`QueueClient`].
#[derive(Debug)]
pub struct InMemoryQueueClient {
    state: Mutex<ClientState>,
    message_sent: Notify,
    default_visibility_timeout: Duration,
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        InMemoryQueueClient::new()
    }
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        InMemoryQueueClient::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Creates a client whose queues hide received messages for `visibility_timeout`.
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        InMemoryQueueClient {
            state: Mutex::new(ClientState::default()),
            message_sent: Notify::new(),
            default_visibility_timeout: visibility_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes the next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.lock().failing_receives = count;
    }

    /// Makes the next `count` delete batch calls fail as a whole.
    pub fn fail_next_delete_calls(&self, count: usize) {
        self.lock().failing_delete_calls = count;
    }

    /// Reports a per-entry failure whenever this message id is deleted.
    pub fn fail_deletes_for(&self, message_id: impl Into<String>) {
        self.lock().failing_delete_ids.insert(message_id.into());
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.lock().calls.clone()
    }

    /// Message ids of every delete batch call, in call order.
    pub fn delete_batches(&self) -> Vec<Vec<String>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ClientCall::DeleteBatch { message_ids } => Some(message_ids.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, ClientCall::Receive { .. }))
            .count()
    }

    /// Ids of messages that were successfully deleted from `queue_url`.
    pub fn deleted_message_ids(&self, queue_url: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.deleted.clone())
            .unwrap_or_default()
    }

    /// Messages waiting to be received, visible or not.
    pub fn approximate_number_of_messages(&self, queue_url: &str) -> usize {
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.available.len())
            .unwrap_or(0)
    }

    pub fn approximate_number_of_messages_not_visible(&self, queue_url: &str) -> usize {
        self.lock()
            .queues
            .get(queue_url)
            .map(|queue| queue.in_flight.len())
            .unwrap_or(0)
    }

    fn try_receive(&self, request: &ReceiveRequest) -> Result<Vec<Message>, QueueClientError> {
        let mut state = self.lock();
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            state.calls.push(ClientCall::Receive {
                max_number_of_messages: request.max_number_of_messages,
                returned: 0,
            });
            return Err(QueueClientError::service("ReceiveMessage", "injected receive failure"));
        }

        let now = Instant::now();
        let default_visibility_timeout = self.default_visibility_timeout;
        let ClientState {
            queues, next_receipt, ..
        } = &mut *state;
        let queue = queues
            .entry(request.queue_url.clone())
            .or_insert_with(|| QueueState::new(&request.queue_url, default_visibility_timeout));
        queue.return_expired(now);

        let visibility_timeout = request.visibility_timeout.unwrap_or(queue.visibility_timeout);
        let mut received = Vec::new();
        for mut stored in queue.take_deliverable(request.max_number_of_messages, now) {
            stored.receive_count += 1;
            *next_receipt += 1;
            let receipt_handle = format!("{}-receipt-{}", stored.message_id, next_receipt);
            received.push(to_message(&stored, &receipt_handle));
            queue.in_flight.insert(
                receipt_handle,
                InFlightMessage {
                    message: stored,
                    invisible_until: now + visibility_timeout,
                },
            );
        }
        Ok(received)
    }

    fn record_receive(&self, request: &ReceiveRequest, returned: usize) {
        self.lock().calls.push(ClientCall::Receive {
            max_number_of_messages: request.max_number_of_messages,
            returned,
        });
    }

    fn store(&self, state: &mut ClientState, queue_url: &str, message: OutgoingMessage) -> String {
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let message_id = format!("msg-{sequence}");
        let visible_at = Instant::now() + message.delay.unwrap_or_default();
        let default_visibility_timeout = self.default_visibility_timeout;
        let queue = state
            .queues
            .entry(queue_url.to_string())
            .or_insert_with(|| QueueState::new(queue_url, default_visibility_timeout));
        queue.make_available(StoredMessage {
            sequence,
            message_id: message_id.clone(),
            body: message.body,
            message_attributes: message.message_attributes,
            group_id: message.group_id,
            deduplication_id: message.deduplication_id,
            receive_count: 0,
            visible_at,
        });
        state.calls.push(ClientCall::Send {
            message_id: message_id.clone(),
        });
        message_id
    }
}

fn to_message(stored: &StoredMessage, receipt_handle: &str) -> Message {
    let mut builder = Message::builder(stored.message_id.as_str(), receipt_handle)
        .body(stored.body.as_str())
        .attribute(APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE, stored.receive_count.to_string());
    if let Some(group_id) = &stored.group_id {
        builder = builder.attribute(MESSAGE_GROUP_ID_ATTRIBUTE, group_id.as_str());
    }
    if let Some(deduplication_id) = &stored.deduplication_id {
        builder = builder.attribute(MESSAGE_DEDUPLICATION_ID_ATTRIBUTE, deduplication_id.as_str());
    }
    for (name, value) in &stored.message_attributes {
        builder = builder.message_attribute(name.as_str(), value.as_str());
    }
    builder.build()
}

fn check_batch_size(size: usize) -> Result<(), QueueClientError> {
    if size > MAX_NUMBER_OF_MESSAGES_IN_BATCH {
        return Err(QueueClientError::BatchTooLarge {
            size,
            max_size: MAX_NUMBER_OF_MESSAGES_IN_BATCH,
        });
    }
    Ok(())
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>, QueueClientError> {
        let deadline = Instant::now() + request.wait_time;
        loop {
            let notified = self.message_sent.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.try_receive(&request)?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                self.record_receive(&request, messages.len());
                return Ok(messages);
            }

            // Also wake up periodically so expired visibility timeouts are noticed.
            let wait = deadline.saturating_duration_since(now).min(VISIBILITY_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult, QueueClientError> {
        check_batch_size(entries.len())?;
        let mut state = self.lock();
        state.calls.push(ClientCall::DeleteBatch {
            message_ids: entries.iter().map(|entry| entry.id.clone()).collect(),
        });
        if state.failing_delete_calls > 0 {
            state.failing_delete_calls -= 1;
            return Err(QueueClientError::service("DeleteMessageBatch", "injected delete failure"));
        }

        let ClientState {
            queues,
            failing_delete_ids,
            ..
        } = &mut *state;
        let queue = queues.get_mut(queue_url).ok_or_else(|| QueueClientError::QueueNotFound {
            queue_url: queue_url.to_string(),
        })?;

        let mut result = BatchResult::default();
        for entry in entries {
            if failing_delete_ids.contains(&entry.id) {
                result.failed.push(BatchFailure {
                    id: entry.id,
                    code: "InternalError".to_string(),
                    message: "injected entry failure".to_string(),
                    sender_fault: false,
                });
                continue;
            }
            match queue.in_flight.remove(&entry.receipt_handle) {
                Some(in_flight) => {
                    queue.deleted.push(in_flight.message.message_id);
                    result.successful.push(entry.id);
                }
                None => result.failed.push(BatchFailure {
                    id: entry.id,
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: format!("receipt handle {} is not in flight", entry.receipt_handle),
                    sender_fault: true,
                }),
            }
        }
        Ok(result)
    }

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult, QueueClientError> {
        check_batch_size(entries.len())?;
        let mut result = BatchResult::default();
        let mut made_visible = false;
        {
            let mut state = self.lock();
            state.calls.push(ClientCall::ChangeVisibilityBatch {
                message_ids: entries.iter().map(|entry| entry.id.clone()).collect(),
            });
            let queue = state
                .queues
                .get_mut(queue_url)
                .ok_or_else(|| QueueClientError::QueueNotFound {
                    queue_url: queue_url.to_string(),
                })?;

            let now = Instant::now();
            for entry in entries {
                if entry.visibility_timeout.is_zero() {
                    if let Some(in_flight) = queue.in_flight.remove(&entry.receipt_handle) {
                        queue.make_available(in_flight.message);
                        made_visible = true;
                        result.successful.push(entry.id);
                        continue;
                    }
                } else if let Some(in_flight) = queue.in_flight.get_mut(&entry.receipt_handle) {
                    in_flight.invisible_until = now + entry.visibility_timeout;
                    result.successful.push(entry.id);
                    continue;
                }
                result.failed.push(BatchFailure {
                    id: entry.id,
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: format!("receipt handle {} is not in flight", entry.receipt_handle),
                    sender_fault: true,
                });
            }
        }
        if made_visible {
            self.message_sent.notify_waiters();
        }
        Ok(result)
    }

    async fn send_message(&self, queue_url: &str, message: OutgoingMessage) -> Result<String, QueueClientError> {
        let message_id = {
            let mut state = self.lock();
            self.store(&mut state, queue_url, message)
        };
        self.message_sent.notify_waiters();
        Ok(message_id)
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<BatchResult, QueueClientError> {
        check_batch_size(messages.len())?;
        let mut result = BatchResult::default();
        {
            let mut state = self.lock();
            for (index, message) in messages.into_iter().enumerate() {
                self.store(&mut state, queue_url, message);
                result.successful.push(index.to_string());
            }
        }
        self.message_sent.notify_waiters();
        Ok(result)
    }
}
