use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ContainerState, CoreMessageListenerContainer, CoreMessageListenerContainerProperties, MessageListenerContainer,
    ProcessorFactory,
};
use crate::broker::{ConcurrentMessageBroker, ConcurrentMessageBrokerProperties, DEFAULT_CONCURRENCY_POLLING_RATE, SharedMessageBroker};
use crate::client::SharedQueueClient;
use crate::dynamic::Dynamic;
use crate::errors::{ConfigurationError, ListenerError};
use crate::message::{MAX_NUMBER_OF_MESSAGES_FROM_SQS, SharedQueueProperties};
use crate::resolver::{BatchingMessageResolver, BatchingMessageResolverProperties, SharedMessageResolver};
use crate::retriever::{
    BatchingMessageRetriever, BatchingMessageRetrieverProperties, DEFAULT_ERROR_BACKOFF_TIME, SharedMessageRetriever,
};

/// Properties of a [`BatchingMessageListenerContainer`].
#[derive(Debug, Clone)]
pub struct BatchingMessageListenerContainerProperties {
    pub concurrency_level: Dynamic<usize>,
    pub concurrency_polling_rate: Dynamic<Duration>,
    pub error_backoff_time: Dynamic<Duration>,
    /// Number of waiting handlers that triggers a receive, at most 10.
    pub batch_size: Dynamic<usize>,
    pub batching_period: Dynamic<Duration>,
    pub message_visibility_timeout: Option<Dynamic<Duration>>,
    pub process_extra_messages_on_shutdown: bool,
    pub interrupt_message_processing_on_shutdown: bool,
    pub resolver_properties: BatchingMessageResolverProperties,
}

impl BatchingMessageListenerContainerProperties {
    pub fn new(concurrency_level: impl Into<Dynamic<usize>>, batch_size: impl Into<Dynamic<usize>>) -> Self {
        BatchingMessageListenerContainerProperties {
            concurrency_level: concurrency_level.into(),
            concurrency_polling_rate: Dynamic::fixed(DEFAULT_CONCURRENCY_POLLING_RATE),
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
            batch_size: batch_size.into(),
            batching_period: Dynamic::fixed(Duration::from_secs(2)),
            message_visibility_timeout: None,
            process_extra_messages_on_shutdown: true,
            interrupt_message_processing_on_shutdown: false,
            resolver_properties: BatchingMessageResolverProperties::default(),
        }
    }
}

/// Container that only receives messages when handlers are free to process
/// them, grouping their requests into batched receive calls.
///
/// Suited to slow handlers or long visibility-sensitive work, where
/// prefetched messages would sit in memory for too long.
pub struct BatchingMessageListenerContainer {
    delegate: CoreMessageListenerContainer,
}

impl BatchingMessageListenerContainer {
    pub fn new(
        identifier: impl Into<String>,
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        processor: ProcessorFactory,
        properties: BatchingMessageListenerContainerProperties,
    ) -> Result<Self, ConfigurationError> {
        let batch_size = properties.batch_size.get();
        if batch_size == 0 || batch_size > MAX_NUMBER_OF_MESSAGES_FROM_SQS {
            return Err(ConfigurationError::invalid("batch_size", "must be between 1 and 10"));
        }

        let broker_properties = ConcurrentMessageBrokerProperties {
            concurrency_level: properties.concurrency_level.clone(),
            concurrency_polling_rate: properties.concurrency_polling_rate.clone(),
            error_backoff_time: properties.error_backoff_time.clone(),
        };
        let retriever_properties = BatchingMessageRetrieverProperties {
            batch_size: properties.batch_size.clone(),
            batching_period: properties.batching_period.clone(),
            message_visibility_timeout: properties.message_visibility_timeout.clone(),
            error_backoff_time: properties.error_backoff_time.clone(),
        };
        let (retriever_client, retriever_queue) = (client.clone(), queue.clone());
        let resolver_properties = properties.resolver_properties.clone();

        let delegate = CoreMessageListenerContainer::builder(identifier)
            .broker(move || Ok(Arc::new(ConcurrentMessageBroker::new(broker_properties.clone())) as SharedMessageBroker))
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
                process_extra_messages_on_shutdown: properties.process_extra_messages_on_shutdown,
                interrupt_message_processing_on_shutdown: properties.interrupt_message_processing_on_shutdown,
                ..Default::default()
            })
            .build()?;
        Ok(BatchingMessageListenerContainer { delegate })
    }
}

#[async_trait]
impl MessageListenerContainer for BatchingMessageListenerContainer {
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
