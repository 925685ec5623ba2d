//! The queue service contract the pipeline is written against.
//!
//! [`SqsQueueClient`] talks to Amazon SQS through `aws-sdk-sqs`;
//! [`InMemoryQueueClient`] is a fully functional local queue for tests and
//! development.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::errors::QueueClientError;
use crate::message::{BatchResult, DeleteEntry, Message, OutgoingMessage, ReceiveRequest, VisibilityEntry};

mod memory;
mod sqs;

pub use memory::{ClientCall, InMemoryQueueClient};
pub use sqs::{SqsQueueClient, create_sqs_client_from_env, create_sqs_client_with_credentials};

/// Operations the listener needs from a queue service.
///
/// Batch operations report success or failure per entry; a returned `Err`
/// means the call as a whole failed.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receives up to `request.max_number_of_messages`, long polling for at most
    /// `request.wait_time`.
    async fn receive_messages(&self, request: ReceiveRequest) -> Result<Vec<Message>, QueueClientError>;

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult, QueueClientError>;

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult, QueueClientError>;

    /// Publishes a message, returning the id assigned by the service.
    async fn send_message(&self, queue_url: &str, message: OutgoingMessage) -> Result<String, QueueClientError>;

    /// Publishes up to ten messages. Entry ids in the result are the indexes of
    /// `messages`.
    async fn send_message_batch(
        &self,
        queue_url: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<BatchResult, QueueClientError>;
}

/// Shared handle to a queue client.
pub type SharedQueueClient = Arc<dyn QueueClient>;

/// Logs a failed queue call. Requests the service rejected outright are
/// reported separately from outages, as retrying them cannot succeed until
/// the queue or its configuration changes.
pub(crate) fn log_client_error(action: &'static str, queue_url: &str, error: &QueueClientError) {
    if error.is_transient() {
        error!(queue_url, action, error = %error, transient = true, "Queue request failed, retrying after backoff");
    } else {
        error!(
            queue_url,
            action,
            error = %error,
            transient = false,
            "Queue request rejected, it will keep failing until the queue configuration is fixed"
        );
    }
}
