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
use crate::message::SharedQueueProperties;
use crate::resolver::{BatchingMessageResolver, BatchingMessageResolverProperties, SharedMessageResolver};
use crate::retriever::{
    DEFAULT_ERROR_BACKOFF_TIME, PrefetchingMessageRetriever, PrefetchingMessageRetrieverProperties,
    SharedMessageRetriever,
};

/// Properties of a [`PrefetchingMessageListenerContainer`].
#[derive(Debug, Clone)]
pub struct PrefetchingMessageListenerContainerProperties {
    pub concurrency_level: Dynamic<usize>,
    pub concurrency_polling_rate: Dynamic<Duration>,
    pub error_backoff_time: Dynamic<Duration>,
    pub desired_min_prefetched_messages: usize,
    pub max_prefetched_messages: usize,
    pub message_visibility_timeout: Option<Dynamic<Duration>>,
    pub process_extra_messages_on_shutdown: bool,
    pub interrupt_message_processing_on_shutdown: bool,
    pub resolver_properties: BatchingMessageResolverProperties,
}

impl PrefetchingMessageListenerContainerProperties {
    pub fn new(
        concurrency_level: impl Into<Dynamic<usize>>,
        desired_min_prefetched_messages: usize,
        max_prefetched_messages: usize,
    ) -> Self {
        PrefetchingMessageListenerContainerProperties {
            concurrency_level: concurrency_level.into(),
            concurrency_polling_rate: Dynamic::fixed(DEFAULT_CONCURRENCY_POLLING_RATE),
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
            desired_min_prefetched_messages,
            max_prefetched_messages,
            message_visibility_timeout: None,
            process_extra_messages_on_shutdown: true,
            interrupt_message_processing_on_shutdown: false,
            resolver_properties: BatchingMessageResolverProperties::default(),
        }
    }

    fn retriever_properties(&self) -> PrefetchingMessageRetrieverProperties {
        PrefetchingMessageRetrieverProperties {
            desired_min_prefetched_messages: self.desired_min_prefetched_messages,
            max_prefetched_messages: self.max_prefetched_messages,
            message_visibility_timeout: self.message_visibility_timeout.clone(),
            error_backoff_time: self.error_backoff_time.clone(),
        }
    }
}

/// Container that keeps a buffer of prefetched messages for the broker.
///
/// Suited to queues with a steady stream of messages where handlers should
/// never wait on a receive call.
pub struct PrefetchingMessageListenerContainer {
    delegate: CoreMessageListenerContainer,
}

impl PrefetchingMessageListenerContainer {
    pub fn new(
        identifier: impl Into<String>,
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        processor: ProcessorFactory,
        properties: PrefetchingMessageListenerContainerProperties,
    ) -> Result<Self, ConfigurationError> {
        let retriever_properties = properties.retriever_properties();
        retriever_properties.validate()?;

        let broker_properties = ConcurrentMessageBrokerProperties {
            concurrency_level: properties.concurrency_level.clone(),
            concurrency_polling_rate: properties.concurrency_polling_rate.clone(),
            error_backoff_time: properties.error_backoff_time.clone(),
        };
        let (retriever_client, retriever_queue) = (client.clone(), queue.clone());
        let resolver_properties = properties.resolver_properties.clone();

        let delegate = CoreMessageListenerContainer::builder(identifier)
            .broker(move || Ok(Arc::new(ConcurrentMessageBroker::new(broker_properties.clone())) as SharedMessageBroker))
            .retriever(move || {
                let retriever = PrefetchingMessageRetriever::new(
                    retriever_client.clone(),
                    retriever_queue.clone(),
                    retriever_properties.clone(),
                )?;
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
        Ok(PrefetchingMessageListenerContainer { delegate })
    }
}

#[async_trait]
impl MessageListenerContainer for PrefetchingMessageListenerContainer {
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
