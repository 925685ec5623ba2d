use thiserror::Error;

/// Boxed error returned by user message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top level error type for the listener framework.
///
/// Most of the pipeline never surfaces errors to the caller (they are logged and
/// retried), so this is mainly returned while assembling containers.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listener configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("container '{identifier}' is already registered")]
    DuplicateContainer { identifier: String },

    #[error("no container registered with identifier '{identifier}'")]
    UnknownContainer { identifier: String },
}

/// Errors raised by a [`QueueClient`](crate::client::QueueClient) implementation.
#[derive(Debug, Error)]
pub enum QueueClientError {
    /// The queue service rejected or failed the call.
    #[error("{operation} failed: {message}")]
    Service { operation: &'static str, message: String },

    /// The request could not be built, e.g. a missing receipt handle.
    #[error("invalid {operation} request: {message}")]
    InvalidRequest { operation: &'static str, message: String },

    #[error("batch of {size} entries exceeds the maximum of {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("queue not found: {queue_url}")]
    QueueNotFound { queue_url: String },
}

impl QueueClientError {
    pub fn service(operation: &'static str, message: impl Into<String>) -> Self {
        QueueClientError::Service {
            operation,
            message: message.into(),
        }
    }

    pub fn invalid_request(operation: &'static str, message: impl Into<String>) -> Self {
        QueueClientError::InvalidRequest {
            operation,
            message: message.into(),
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueClientError::Service { .. } => true,
            QueueClientError::InvalidRequest { .. } => false,
            QueueClientError::BatchTooLarge { .. } => false,
            QueueClientError::QueueNotFound { .. } => false,
        }
    }
}

/// Raised by property builders when a required value is missing or invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("required property '{field}' was not provided")]
    Missing { field: &'static str },

    #[error("property '{field}' is invalid: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigurationError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Failure to obtain a message from a [`MessageRetriever`](crate::retriever::MessageRetriever).
#[derive(Debug, Error)]
pub enum RetrieverError {
    /// The retriever's background loop has stopped and will not supply more messages.
    #[error("message retriever has been stopped")]
    Stopped,

    /// A bounded message source ran out of messages.
    #[error("no more messages available")]
    Exhausted,

    #[error(transparent)]
    Client(#[from] QueueClientError),
}

/// Failure to resolve (delete) a message.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The whole delete batch call failed.
    #[error("batch delete failed: {0}")]
    BatchFailed(String),

    /// The service reported a failure for this specific entry.
    #[error("deletion of message {message_id} failed with {code}: {message}")]
    EntryFailed {
        message_id: String,
        code: String,
        message: String,
    },

    /// The service response did not mention this entry at all.
    #[error("message {message_id} was not handled by the batch delete")]
    EntryMissing { message_id: String },

    #[error("message resolver has been stopped")]
    Stopped,
}

/// Failure while processing a single message.
#[derive(Debug, Error)]
pub enum MessageProcessingError {
    /// The user handler returned an error.
    #[error("message handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The user handler panicked.
    #[error("message handler panicked: {0}")]
    Panicked(String),

    /// A decorator rejected the message before the handler ran.
    #[error("decorator failed before processing: {0}")]
    Decorator(#[source] BoxError),

    /// Processing was cancelled because the container was shutting down.
    #[error("message processing was interrupted")]
    Interrupted,
}
