use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BrokerFactory, ContainerState, MessageListenerContainer, ProcessorFactory, ResolverFactory, RetrieverFactory,
};
use crate::broker::{
    KeepProcessing, MessageDispatcher, MessageSupplier, ProcessingPool, SharedMessageBroker,
};
use crate::errors::{ConfigurationError, ListenerError, RetrieverError};
use crate::message::Message;
use crate::processor::{ResolveCallback, SharedMessageProcessor};
use crate::resolver::SharedMessageResolver;
use crate::retriever::SharedMessageRetriever;

/// Timeout applied to each shutdown phase when none is configured.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Shutdown behaviour of a [`CoreMessageListenerContainer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreMessageListenerContainerProperties {
    /// Drop in-flight handler futures on shutdown instead of letting them finish.
    pub interrupt_message_processing_on_shutdown: bool,
    /// Process messages the retriever had received but not handed out before
    /// shutting down.
    pub process_extra_messages_on_shutdown: bool,
    pub message_broker_shutdown_timeout: Duration,
    pub message_retriever_shutdown_timeout: Duration,
    pub message_processing_shutdown_timeout: Duration,
    pub message_resolver_shutdown_timeout: Duration,
}

impl Default for CoreMessageListenerContainerProperties {
    fn default() -> Self {
        CoreMessageListenerContainerProperties {
            interrupt_message_processing_on_shutdown: false,
            process_extra_messages_on_shutdown: true,
            message_broker_shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            message_retriever_shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            message_processing_shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            message_resolver_shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Default)]
pub struct CoreMessageListenerContainerBuilder {
    identifier: String,
    broker: Option<BrokerFactory>,
    retriever: Option<RetrieverFactory>,
    processor: Option<ProcessorFactory>,
    resolver: Option<ResolverFactory>,
    properties: CoreMessageListenerContainerProperties,
}

impl CoreMessageListenerContainerBuilder {
    pub fn broker<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<SharedMessageBroker, ConfigurationError> + Send + Sync + 'static,
    {
        self.broker = Some(Arc::new(factory));
        self
    }

    pub fn retriever<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<SharedMessageRetriever, ConfigurationError> + Send + Sync + 'static,
    {
        self.retriever = Some(Arc::new(factory));
        self
    }

    pub fn processor<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<SharedMessageProcessor, ConfigurationError> + Send + Sync + 'static,
    {
        self.processor = Some(Arc::new(factory));
        self
    }

    /// Uses an already shared processor factory, e.g. from
    /// [`handler_processor_factory`](super::handler_processor_factory).
    pub fn processor_factory(mut self, factory: ProcessorFactory) -> Self {
        self.processor = Some(factory);
        self
    }

    pub fn resolver<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<SharedMessageResolver, ConfigurationError> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(factory));
        self
    }

    pub fn properties(mut self, properties: CoreMessageListenerContainerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn build(self) -> Result<CoreMessageListenerContainer, ConfigurationError> {
        if self.identifier.trim().is_empty() {
            return Err(ConfigurationError::invalid("identifier", "must not be blank"));
        }
        Ok(CoreMessageListenerContainer {
            identifier: self.identifier,
            factories: Factories {
                broker: self.broker.ok_or(ConfigurationError::Missing { field: "broker" })?,
                retriever: self.retriever.ok_or(ConfigurationError::Missing { field: "retriever" })?,
                processor: self.processor.ok_or(ConfigurationError::Missing { field: "processor" })?,
                resolver: self.resolver.ok_or(ConfigurationError::Missing { field: "resolver" })?,
            },
            properties: self.properties,
            state: Mutex::new(ContainerState::Stopped),
            running: tokio::sync::Mutex::new(None),
        })
    }
}

struct Factories {
    broker: BrokerFactory,
    retriever: RetrieverFactory,
    processor: ProcessorFactory,
    resolver: ResolverFactory,
}

struct Components {
    broker: SharedMessageBroker,
    retriever: SharedMessageRetriever,
    processor: SharedMessageProcessor,
    resolver: SharedMessageResolver,
}

struct RunningContainer {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Container that runs any broker, retriever, processor and resolver.
///
/// Components are built from their factories on every start, so a stopped
/// container can be started again. Shutdown happens in phases, each bounded by
/// its own timeout:
///
/// 1. the broker stops requesting messages;
/// 2. the retriever stops and returns messages it received but never handed out;
/// 3. those messages are processed, if `process_extra_messages_on_shutdown` is set;
/// 4. in-flight processing finishes, or is dropped when
///    `interrupt_message_processing_on_shutdown` is set;
/// 5. the resolver deletes everything resolved so far.
///
/// An expired timeout is logged and shutdown moves on to the next phase.
pub struct CoreMessageListenerContainer {
    identifier: String,
    factories: Factories,
    properties: CoreMessageListenerContainerProperties,
    state: Mutex<ContainerState>,
    running: tokio::sync::Mutex<Option<RunningContainer>>,
}

impl CoreMessageListenerContainer {
    pub fn builder(identifier: impl Into<String>) -> CoreMessageListenerContainerBuilder {
        CoreMessageListenerContainerBuilder {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    pub fn properties(&self) -> &CoreMessageListenerContainerProperties {
        &self.properties
    }

    fn lock_state(&self) -> MutexGuard<'_, ContainerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: ContainerState) {
        *self.lock_state() = state;
    }

    fn build_components(&self) -> Result<Components, ConfigurationError> {
        Ok(Components {
            broker: (self.factories.broker)()?,
            retriever: (self.factories.retriever)()?,
            processor: (self.factories.processor)()?,
            resolver: (self.factories.resolver)()?,
        })
    }
}

#[async_trait]
impl MessageListenerContainer for CoreMessageListenerContainer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn state(&self) -> ContainerState {
        *self.lock_state()
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            info!(container = %self.identifier, "Container has already been started, no action taken");
            return Ok(());
        }

        info!(container = %self.identifier, "Container is being started");
        self.set_state(ContainerState::Starting);
        let components = match self.build_components() {
            Ok(components) => components,
            Err(error) => {
                error!(container = %self.identifier, error = %error, "Failed to build container components");
                self.set_state(ContainerState::Stopped);
                return Err(error.into());
            }
        };

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_container(
            self.identifier.clone(),
            components,
            self.properties.clone(),
            shutdown.clone(),
        ));
        *running = Some(RunningContainer { shutdown, handle });
        self.set_state(ContainerState::Running);
        Ok(())
    }

    async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(container) = running.take() else {
            debug!(container = %self.identifier, "Container is not running, no action taken");
            return;
        };

        info!(container = %self.identifier, "Container is being stopped");
        self.set_state(ContainerState::Stopping);
        container.shutdown.cancel();
        if let Err(error) = container.handle.await {
            error!(container = %self.identifier, error = %error, "Container task failed during shutdown");
        }
        self.set_state(ContainerState::Stopped);
    }
}

fn message_supplier(retriever: &SharedMessageRetriever) -> MessageSupplier {
    let retriever = Arc::clone(retriever);
    Arc::new(move || retriever.retrieve_message())
}

fn message_dispatcher(processor: &SharedMessageProcessor, resolver: &SharedMessageResolver) -> MessageDispatcher {
    let processor = Arc::clone(processor);
    let resolver = Arc::clone(resolver);
    Arc::new(move |message: Message| {
        let processor = Arc::clone(&processor);
        let resolver = Arc::clone(&resolver);
        let to_resolve = message.clone();
        let resolve: ResolveCallback = Arc::new(move || resolver.resolve_message(to_resolve.clone()));
        async move { processor.process_message(message, resolve).await }.boxed()
    })
}

/// Waits for `handle` up to `timeout`, aborting it when the timeout expires.
async fn join_within<T>(container: &str, phase: &'static str, handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            error!(container, phase, error = %error, "Container component failed");
            None
        }
        Err(_) => {
            warn!(
                container,
                phase,
                timeout_ms = timeout.as_millis() as u64,
                "Container component did not stop within the timeout"
            );
            abort.abort();
            None
        }
    }
}

async fn run_container(
    identifier: String,
    components: Components,
    properties: CoreMessageListenerContainerProperties,
    shutdown: CancellationToken,
) {
    let Components {
        broker,
        retriever,
        processor,
        resolver,
    } = components;
    let pool = ProcessingPool::new();
    let dispatcher = message_dispatcher(&processor, &resolver);

    let resolver_stop = CancellationToken::new();
    let resolver_task = {
        let (resolver, stop) = (Arc::clone(&resolver), resolver_stop.clone());
        tokio::spawn(async move { resolver.run(stop).await })
    };
    let retriever_stop = CancellationToken::new();
    let retriever_task = {
        let (retriever, stop) = (Arc::clone(&retriever), retriever_stop.clone());
        tokio::spawn(async move { retriever.run(stop).await })
    };

    info!(container = %identifier, "Container is beginning to process messages");
    let broker_task = {
        let (broker, pool, dispatcher) = (Arc::clone(&broker), pool.clone(), Arc::clone(&dispatcher));
        let keep_processing = KeepProcessing::until_cancelled(shutdown.clone());
        let supplier = message_supplier(&retriever);
        tokio::spawn(async move {
            broker
                .process_messages(&pool, keep_processing, supplier, dispatcher)
                .await
        })
    };

    shutdown.cancelled().await;
    info!(container = %identifier, "Container is being shutdown");

    join_within(&identifier, "broker", broker_task, properties.message_broker_shutdown_timeout).await;

    debug!(container = %identifier, "Shutting down message retriever");
    retriever_stop.cancel();
    let extra_messages = join_within(
        &identifier,
        "retriever",
        retriever_task,
        properties.message_retriever_shutdown_timeout,
    )
    .await
    .unwrap_or_default();

    if !extra_messages.is_empty() {
        if properties.process_extra_messages_on_shutdown {
            process_extra_messages(&identifier, &broker, &pool, dispatcher, extra_messages, &properties).await;
        } else {
            debug!(
                container = %identifier,
                count = extra_messages.len(),
                "Leaving extra messages to be redelivered"
            );
        }
    }

    debug!(container = %identifier, "Waiting for message processing to finish");
    if properties.interrupt_message_processing_on_shutdown {
        pool.interrupt();
        debug!(container = %identifier, "Interrupted message processing");
    }
    let processing_timeout = properties.message_processing_shutdown_timeout;
    if tokio::time::timeout(processing_timeout, pool.wait()).await.is_err() {
        warn!(
            container = %identifier,
            phase = "processing",
            timeout_ms = processing_timeout.as_millis() as u64,
            active = pool.active_tasks(),
            "Message processing did not finish within the timeout"
        );
    }

    debug!(container = %identifier, "Shutting down message resolver");
    resolver_stop.cancel();
    join_within(&identifier, "resolver", resolver_task, properties.message_resolver_shutdown_timeout).await;

    info!(container = %identifier, "Container has stopped");
}

async fn process_extra_messages(
    identifier: &str,
    broker: &SharedMessageBroker,
    pool: &ProcessingPool,
    dispatcher: MessageDispatcher,
    messages: Vec<Message>,
    properties: &CoreMessageListenerContainerProperties,
) {
    debug!(container = identifier, count = messages.len(), "Processing extra messages before shutdown");
    let remaining = Arc::new(Mutex::new(VecDeque::from(messages)));
    let supplier: MessageSupplier = {
        let remaining = Arc::clone(&remaining);
        Arc::new(move || {
            let next = match remaining.lock() {
                Ok(mut messages) => messages.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            future::ready(next.ok_or(RetrieverError::Exhausted)).boxed()
        })
    };
    let keep_processing = KeepProcessing::while_condition(CancellationToken::new(), move || match remaining.lock() {
        Ok(messages) => !messages.is_empty(),
        Err(poisoned) => !poisoned.into_inner().is_empty(),
    });

    let timeout = properties.message_broker_shutdown_timeout;
    if tokio::time::timeout(timeout, broker.process_messages(pool, keep_processing, supplier, dispatcher))
        .await
        .is_err()
    {
        warn!(
            container = identifier,
            phase = "extra messages",
            timeout_ms = timeout.as_millis() as u64,
            "Extra messages were not dispatched within the timeout"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::broker::{ConcurrentMessageBroker, ConcurrentMessageBrokerProperties};
    use crate::client::{InMemoryQueueClient, QueueClient};
    use crate::errors::BoxError;
    use crate::message::{OutgoingMessage, QueueProperties, SharedQueueProperties};
    use crate::processor::{AcknowledgeMode, HandlerMessageProcessor, handler_fn};
    use crate::resolver::{BatchingMessageResolver, BatchingMessageResolverProperties};
    use crate::retriever::{PrefetchingMessageRetriever, PrefetchingMessageRetrieverProperties};

    const QUEUE: &str = "http://localhost/queue/core-container";

    /// Counts handled messages and the most handlers seen running at once.
    #[derive(Default)]
    struct Handled {
        count: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Handled {
        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    fn container(
        client: &Arc<InMemoryQueueClient>,
        handled: &Arc<Handled>,
        handler_delay: Duration,
        properties: CoreMessageListenerContainerProperties,
    ) -> CoreMessageListenerContainer {
        let queue: SharedQueueProperties = Arc::new(QueueProperties::new(QUEUE));
        let (retriever_client, retriever_queue) = (client.clone(), queue.clone());
        let (processor_client, processor_queue) = (client.clone(), queue.clone());
        let (resolver_client, resolver_queue) = (client.clone(), queue.clone());
        let handled = Arc::clone(handled);

        CoreMessageListenerContainer::builder("core-test")
            .broker(|| {
                let properties = ConcurrentMessageBrokerProperties::new(2);
                Ok(Arc::new(ConcurrentMessageBroker::new(properties)) as SharedMessageBroker)
            })
            .retriever(move || {
                let retriever = PrefetchingMessageRetriever::new(
                    retriever_client.clone(),
                    retriever_queue.clone(),
                    PrefetchingMessageRetrieverProperties {
                        desired_min_prefetched_messages: 5,
                        max_prefetched_messages: 10,
                        ..Default::default()
                    },
                )?;
                Ok(Arc::new(retriever) as SharedMessageRetriever)
            })
            .processor(move || {
                let handled = Arc::clone(&handled);
                let handler = handler_fn(
                    move |_message: Message, handled: Arc<Handled>| async move {
                        let running = handled.running.fetch_add(1, Ordering::SeqCst) + 1;
                        handled.peak.fetch_max(running, Ordering::SeqCst);
                        tokio::time::sleep(handler_delay).await;
                        handled.running.fetch_sub(1, Ordering::SeqCst);
                        handled.count.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), BoxError>(())
                    },
                    handled,
                );
                let processor = HandlerMessageProcessor::new(processor_client.clone(), processor_queue.clone(), Arc::new(handler))
                    .with_acknowledge_mode(AcknowledgeMode::Auto);
                Ok(Arc::new(processor) as SharedMessageProcessor)
            })
            .resolver(move || {
                let resolver = BatchingMessageResolver::new(
                    resolver_client.clone(),
                    resolver_queue.clone(),
                    BatchingMessageResolverProperties {
                        buffering_size_limit: 10.into(),
                        buffering_time: Duration::from_millis(20).into(),
                    },
                );
                Ok(Arc::new(resolver) as SharedMessageResolver)
            })
            .properties(properties)
            .build()
            .unwrap()
    }

    async fn send(client: &InMemoryQueueClient, count: usize) {
        for index in 0..count {
            client
                .send_message(QUEUE, OutgoingMessage::new(format!("message-{index}")))
                .await
                .unwrap();
        }
    }

    #[test]
    fn builder_requires_every_component() {
        let missing = CoreMessageListenerContainer::builder("listener").build();
        assert!(matches!(missing, Err(ConfigurationError::Missing { field: "broker" })));

        let blank = CoreMessageListenerContainer::builder("  ").build();
        assert!(matches!(blank, Err(ConfigurationError::Invalid { field: "identifier", .. })));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let client = Arc::new(InMemoryQueueClient::new());
        let handled = Arc::new(Handled::default());
        let container = container(&client, &handled, Duration::ZERO, Default::default());

        assert_eq!(container.state(), ContainerState::Stopped);
        container.stop().await;
        container.start().await.unwrap();
        container.start().await.unwrap();
        assert!(container.is_running());

        container.stop().await;
        container.stop().await;
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn processes_and_deletes_messages() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 5).await;
        let handled = Arc::new(Handled::default());
        let container = container(&client, &handled, Duration::ZERO, Default::default());

        container.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.deleted_message_ids(QUEUE).len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        container.stop().await;

        assert_eq!(handled.count(), 5);
        assert_eq!(client.approximate_number_of_messages(QUEUE), 0);
    }

    #[tokio::test]
    async fn prefetched_messages_are_processed_on_shutdown() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 6).await;
        let handled = Arc::new(Handled::default());
        let container = container(&client, &handled, Duration::from_millis(100), Default::default());

        container.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        container.stop().await;

        assert_eq!(handled.count(), 6);
        assert_eq!(client.deleted_message_ids(QUEUE).len(), 6);
    }

    #[tokio::test]
    async fn extra_messages_wait_for_running_handlers_to_free_a_slot() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 8).await;
        let handled = Arc::new(Handled::default());
        let container = container(&client, &handled, Duration::from_millis(100), Default::default());

        container.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handled.peak(), 2);
        container.stop().await;

        assert_eq!(handled.count(), 8);
        assert_eq!(handled.peak(), 2);
        assert_eq!(client.deleted_message_ids(QUEUE).len(), 8);
    }

    #[tokio::test]
    async fn extra_messages_are_left_on_the_queue_when_disabled() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 6).await;
        let handled = Arc::new(Handled::default());
        let properties = CoreMessageListenerContainerProperties {
            process_extra_messages_on_shutdown: false,
            ..Default::default()
        };
        let container = container(&client, &handled, Duration::from_millis(100), properties);

        container.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        container.stop().await;

        assert_eq!(handled.count(), 2);
        assert_eq!(client.deleted_message_ids(QUEUE).len(), 2);
        assert_eq!(client.approximate_number_of_messages_not_visible(QUEUE), 4);
    }

    #[tokio::test]
    async fn interrupting_drops_in_flight_processing() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 2).await;
        let handled = Arc::new(Handled::default());
        let properties = CoreMessageListenerContainerProperties {
            interrupt_message_processing_on_shutdown: true,
            process_extra_messages_on_shutdown: false,
            ..Default::default()
        };
        let container = container(&client, &handled, Duration::from_secs(60), properties);

        container.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::time::timeout(Duration::from_secs(5), container.stop())
            .await
            .unwrap();

        assert_eq!(handled.count(), 0);
        assert!(client.deleted_message_ids(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn processing_timeout_does_not_block_shutdown() {
        let client = Arc::new(InMemoryQueueClient::new());
        send(&client, 1).await;
        let handled = Arc::new(Handled::default());
        let properties = CoreMessageListenerContainerProperties {
            message_processing_shutdown_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let container = container(&client, &handled, Duration::from_secs(60), properties);

        container.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::time::timeout(Duration::from_secs(5), container.stop())
            .await
            .unwrap();

        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn container_can_be_restarted() {
        let client = Arc::new(InMemoryQueueClient::new());
        let handled = Arc::new(Handled::default());
        let container = container(&client, &handled, Duration::ZERO, Default::default());

        container.start().await.unwrap();
        container.stop().await;
        send(&client, 1).await;
        container.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handled.count() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        container.stop().await;

        assert_eq!(client.deleted_message_ids(QUEUE).len(), 1);
    }
}
