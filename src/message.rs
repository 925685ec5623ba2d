//! Messages and queue descriptions shared by every component of a container.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// System attribute holding the FIFO message group of a message.
pub const MESSAGE_GROUP_ID_ATTRIBUTE: &str = "MessageGroupId";
/// System attribute holding the FIFO deduplication id of a message.
pub const MESSAGE_DEDUPLICATION_ID_ATTRIBUTE: &str = "MessageDeduplicationId";
/// System attribute holding how many times the message has been received.
pub const APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// Maximum number of messages SQS returns from a single receive call.
pub const MAX_NUMBER_OF_MESSAGES_FROM_SQS: usize = 10;
/// Maximum number of entries in a delete or change visibility batch.
pub const MAX_NUMBER_OF_MESSAGES_IN_BATCH: usize = 10;
/// Longest long-polling wait SQS supports.
pub const MAX_SQS_RECEIVE_WAIT_TIME: Duration = Duration::from_secs(20);

/// A message received from the queue.
///
/// Messages are immutable once received. Cloning is cheap enough for the
/// pipeline to hand copies to the resolver and decorators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    message_id: String,
    receipt_handle: String,
    body: String,
    attributes: HashMap<String, String>,
    message_attributes: HashMap<String, String>,
    group_id: Option<String>,
    deduplication_id: Option<String>,
}

impl Message {
    pub fn builder(message_id: impl Into<String>, receipt_handle: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            message: Message {
                message_id: message_id.into(),
                receipt_handle: receipt_handle.into(),
                body: String::new(),
                attributes: HashMap::new(),
                message_attributes: HashMap::new(),
                group_id: None,
                deduplication_id: None,
            },
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Token for this particular delivery, required to delete the message or
    /// change its visibility.
    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// System attributes, e.g. `ApproximateReceiveCount`.
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// User supplied message attributes.
    pub fn message_attributes(&self) -> &HashMap<String, String> {
        &self.message_attributes
    }

    pub fn message_attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(String::as_str)
    }

    /// FIFO message group, if the message came from a FIFO queue.
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn deduplication_id(&self) -> Option<&str> {
        self.deduplication_id.as_deref()
    }

    pub fn receive_count(&self) -> Option<u32> {
        self.attribute(APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|count| count.parse().ok())
    }
}

/// Builder for [`Message`], used by queue clients when converting responses.
#[derive(Debug)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.message.body = body.into();
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.attributes.insert(name.into(), value.into());
        self
    }

    pub fn message_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.message_attributes.insert(name.into(), value.into());
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.message.group_id = Some(group_id.into());
        self
    }

    pub fn deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.message.deduplication_id = Some(deduplication_id.into());
        self
    }

    pub fn build(mut self) -> Message {
        // Keep the typed fields and the raw system attributes consistent.
        if self.message.group_id.is_none() {
            self.message.group_id = self.message.attributes.get(MESSAGE_GROUP_ID_ATTRIBUTE).cloned();
        }
        if self.message.deduplication_id.is_none() {
            self.message.deduplication_id = self
                .message
                .attributes
                .get(MESSAGE_DEDUPLICATION_ID_ATTRIBUTE)
                .cloned();
        }
        self.message
    }
}

/// Static details about the queue a container listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProperties {
    queue_url: String,
    visibility_timeout: Option<Duration>,
}

/// Shared handle to the queue details of one container.
pub type SharedQueueProperties = Arc<QueueProperties>;

impl QueueProperties {
    pub fn new(queue_url: impl Into<String>) -> Self {
        QueueProperties {
            queue_url: queue_url.into(),
            visibility_timeout: None,
        }
    }

    /// Records the queue's default visibility timeout.
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = Some(visibility_timeout);
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout
    }

    pub fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }
}

impl fmt::Display for QueueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.queue_url)
    }
}

/// Parameters of a single receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub queue_url: String,
    pub max_number_of_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Option<Duration>,
}

impl ReceiveRequest {
    pub fn new(queue_url: impl Into<String>, max_number_of_messages: usize) -> Self {
        ReceiveRequest {
            queue_url: queue_url.into(),
            max_number_of_messages: max_number_of_messages.clamp(1, MAX_NUMBER_OF_MESSAGES_FROM_SQS),
            wait_time: MAX_SQS_RECEIVE_WAIT_TIME,
            visibility_timeout: None,
        }
    }

    pub fn wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time.min(MAX_SQS_RECEIVE_WAIT_TIME);
        self
    }

    /// Overrides the queue's visibility timeout. Zero durations are ignored.
    pub fn visibility_timeout(mut self, visibility_timeout: Option<Duration>) -> Self {
        self.visibility_timeout = visibility_timeout.filter(|timeout| !timeout.is_zero());
        self
    }
}

/// One entry of a delete batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

impl From<&Message> for DeleteEntry {
    fn from(message: &Message) -> Self {
        DeleteEntry {
            id: message.message_id().to_string(),
            receipt_handle: message.receipt_handle().to_string(),
        }
    }
}

/// One entry of a change visibility batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: Duration,
}

impl VisibilityEntry {
    pub fn new(message: &Message, visibility_timeout: Duration) -> Self {
        VisibilityEntry {
            id: message.message_id().to_string(),
            receipt_handle: message.receipt_handle().to_string(),
            visibility_timeout,
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub message_attributes: HashMap<String, String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub delay: Option<Duration>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        OutgoingMessage {
            body: body.into(),
            ..OutgoingMessage::default()
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message_attributes.insert(name.into(), value.into());
        self
    }
}

/// A failed entry of a batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

/// Per entry outcome of a batch call. Entries succeed or fail independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}
