use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ContainerState, CoreMessageListenerContainer, CoreMessageListenerContainerProperties, MessageListenerContainer,
    ProcessorFactory,
};
use crate::broker::{
    DEFAULT_CONCURRENCY_POLLING_RATE, GroupingMessageBroker, GroupingMessageBrokerProperties, SharedMessageBroker,
};
use crate::client::SharedQueueClient;
use crate::dynamic::Dynamic;
use crate::errors::{ConfigurationError, ListenerError};
use crate::message::{MAX_NUMBER_OF_MESSAGES_FROM_SQS, SharedQueueProperties};
use crate::resolver::{BatchingMessageResolver, BatchingMessageResolverProperties, SharedMessageResolver};
use crate::retriever::{
    BatchingMessageRetriever, BatchingMessageRetrieverProperties, DEFAULT_ERROR_BACKOFF_TIME, SharedMessageRetriever,
};

const FIFO_BATCHING_PERIOD: Duration = Duration::from_secs(5);

/// Properties of a [`FifoMessageListenerContainer`].
#[derive(Debug, Clone)]
pub struct FifoMessageListenerContainerProperties {
    /// Maximum number of message groups processed at once.
    pub concurrency_level: Dynamic<usize>,
    pub concurrency_polling_rate: Dynamic<Duration>,
    pub error_backoff_time: Dynamic<Duration>,
    /// Messages requested per receive call, at most 10.
    pub maximum_messages_in_message_group: Dynamic<usize>,
    /// Retrieval pauses once this many groups have messages waiting.
    pub maximum_cached_message_groups: Dynamic<usize>,
    pub message_visibility_timeout: Option<Dynamic<Duration>>,
    /// Process cached messages on shutdown instead of leaving them on the queue.
    pub process_cached_messages_on_shutdown: bool,
    pub interrupt_message_processing_on_shutdown: bool,
    pub resolver_properties: BatchingMessageResolverProperties,
}

impl FifoMessageListenerContainerProperties {
    pub fn new(concurrency_level: impl Into<Dynamic<usize>>) -> Self {
        FifoMessageListenerContainerProperties {
            concurrency_level: concurrency_level.into(),
            concurrency_polling_rate: Dynamic::fixed(DEFAULT_CONCURRENCY_POLLING_RATE),
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
            maximum_messages_in_message_group: Dynamic::fixed(2),
            maximum_cached_message_groups: Dynamic::fixed(MAX_NUMBER_OF_MESSAGES_FROM_SQS),
            message_visibility_timeout: None,
            process_cached_messages_on_shutdown: false,
            interrupt_message_processing_on_shutdown: false,
            resolver_properties: BatchingMessageResolverProperties::default(),
        }
    }
}

/// Container for FIFO queues.
///
/// Messages of a group are processed one at a time in the order they were
/// received, while different groups run concurrently. When a message fails,
/// the rest of its group is left on the queue so it is redelivered in order.
/// The retriever is configured internally; messages are received in batches
/// sized by `maximum_messages_in_message_group`.
pub struct FifoMessageListenerContainer {
    delegate: CoreMessageListenerContainer,
}

impl FifoMessageListenerContainer {
    pub fn new(
        identifier: impl Into<String>,
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        processor: ProcessorFactory,
        properties: FifoMessageListenerContainerProperties,
    ) -> Result<Self, ConfigurationError> {
        if properties.maximum_cached_message_groups.get() == 0 {
            return Err(ConfigurationError::invalid(
                "maximum_cached_message_groups",
                "must be greater than zero",
            ));
        }

        let mut broker_properties = GroupingMessageBrokerProperties::new(
            properties.concurrency_level.clone(),
            properties.maximum_cached_message_groups.clone(),
        );
        broker_properties.concurrency_polling_rate = properties.concurrency_polling_rate.clone();
        broker_properties.error_backoff_time = properties.error_backoff_time.clone();
        broker_properties.purge_extra_messages_in_group_on_error = true;
        broker_properties.process_cached_messages_on_shutdown = properties.process_cached_messages_on_shutdown;

        let retriever_properties = BatchingMessageRetrieverProperties {
            batch_size: properties.maximum_messages_in_message_group.clone(),
            batching_period: Dynamic::fixed(FIFO_BATCHING_PERIOD),
            message_visibility_timeout: properties.message_visibility_timeout.clone(),
            error_backoff_time: properties.error_backoff_time.clone(),
        };
        let (retriever_client, retriever_queue) = (client.clone(), queue.clone());
        let resolver_properties = properties.resolver_properties.clone();

        let delegate = CoreMessageListenerContainer::builder(identifier)
            .broker(move || Ok(Arc::new(GroupingMessageBroker::new(broker_properties.clone())) as SharedMessageBroker))
            .retriever(move || {
                let retriever = BatchingMessageRetriever::new(
                    retriever_client.clone(),
                    retriever_queue.clone(),
                    retriever_properties.clone(),
                );
                Ok(Arc::new(retriever) as SharedMessageRetriever)
            })
            .processor_factory(processor)
            .resolver(move || {
                let resolver = BatchingMessageResolver::new(client.clone(), queue.clone(), resolver_properties.clone());
                Ok(Arc::new(resolver) as SharedMessageResolver)
            })
            .properties(CoreMessageListenerContainerProperties {
                // Leftovers are not processed: they may belong to groups with earlier messages still pending.
                process_extra_messages_on_shutdown: false,
                interrupt_message_processing_on_shutdown: properties.interrupt_message_processing_on_shutdown,
                ..Default::default()
            })
            .build()?;
        Ok(FifoMessageListenerContainer { delegate })
    }
}

#[async_trait]
impl MessageListenerContainer for FifoMessageListenerContainer {
    fn identifier(&self) -> &str {
        self.delegate.identifier()
    }

    fn state(&self) -> ContainerState {
        self.delegate.state()
    }

    async fn start(&self) -> Result<(), ListenerError> {
        self.delegate.start().await
    }

    async fn stop(&self) {
        self.delegate.stop().await
    }
}
