//! Containers own the lifecycle of one broker, retriever, processor and
//! resolver wired to a single queue.
//!
//! [`CoreMessageListenerContainer`] accepts any combination of components
//! through factories. The other containers are presets over it:
//!
//! - [`PrefetchingMessageListenerContainer`] keeps a buffer of messages ready
//!   for high throughput queues.
//! - [`BatchingMessageListenerContainer`] receives only what the broker asks
//!   for, in batches.
//! - [`FifoMessageListenerContainer`] processes each message group in order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::SharedMessageBroker;
use crate::client::SharedQueueClient;
use crate::decorator::SharedMessageProcessingDecorator;
use crate::errors::{ConfigurationError, ListenerError};
use crate::message::SharedQueueProperties;
use crate::processor::{
    AcknowledgeMode, DecoratingMessageProcessor, HandlerMessageProcessor, SharedMessageHandler, SharedMessageProcessor,
};
use crate::resolver::SharedMessageResolver;
use crate::retriever::SharedMessageRetriever;

mod batching;
mod core_container;
mod fifo;
mod prefetching;

pub use batching::{BatchingMessageListenerContainer, BatchingMessageListenerContainerProperties};
pub use core_container::{
    CoreMessageListenerContainer, CoreMessageListenerContainerBuilder, CoreMessageListenerContainerProperties,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use fifo::{FifoMessageListenerContainer, FifoMessageListenerContainerProperties};
pub use prefetching::{PrefetchingMessageListenerContainer, PrefetchingMessageListenerContainerProperties};

/// Creates a fresh component each time a container starts.
pub type ComponentFactory<T> = Arc<dyn Fn() -> Result<T, ConfigurationError> + Send + Sync>;

pub type BrokerFactory = ComponentFactory<SharedMessageBroker>;
pub type RetrieverFactory = ComponentFactory<SharedMessageRetriever>;
pub type ProcessorFactory = ComponentFactory<SharedMessageProcessor>;
pub type ResolverFactory = ComponentFactory<SharedMessageResolver>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a listener.
///
/// `start` and `stop` are idempotent: starting a running container or stopping
/// a stopped one does nothing.
#[async_trait]
pub trait MessageListenerContainer: Send + Sync {
    fn identifier(&self) -> &str;

    fn state(&self) -> ContainerState;

    fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    /// Builds the components and starts processing messages in the background.
    async fn start(&self) -> Result<(), ListenerError>;

    /// Stops processing and waits for the graceful shutdown to complete.
    async fn stop(&self);
}

pub type SharedMessageListenerContainer = Arc<dyn MessageListenerContainer>;

/// Factory for processors that run `handler` behind `decorators`.
///
/// With no decorators the handler processor is used directly.
pub fn handler_processor_factory(
    identifier: impl Into<String>,
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    handler: SharedMessageHandler,
    decorators: Vec<SharedMessageProcessingDecorator>,
    acknowledge_mode: AcknowledgeMode,
) -> ProcessorFactory {
    let identifier = identifier.into();
    Arc::new(move || {
        let processor: SharedMessageProcessor = Arc::new(
            HandlerMessageProcessor::new(client.clone(), queue.clone(), handler.clone())
                .with_acknowledge_mode(acknowledge_mode),
        );
        if decorators.is_empty() {
            return Ok(processor);
        }
        Ok(Arc::new(DecoratingMessageProcessor::new(
            identifier.clone(),
            queue.clone(),
            decorators.clone(),
            processor,
        )))
    })
}
