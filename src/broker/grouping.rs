use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::StreamExt;
use futures::stream::FuturesOrdered;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::concurrent::{DEFAULT_CONCURRENCY_POLLING_RATE, log_retrieval_error};
use super::{
    ConcurrentMessageBroker, ConcurrentMessageBrokerProperties, KeepProcessing, MessageBroker, MessageDispatcher,
    MessageSupplier, ProcessingPool,
};
use crate::backoff::sleep_unless_cancelled;
use crate::dynamic::Dynamic;
use crate::errors::RetrieverError;
use crate::message::Message;
use crate::retriever::DEFAULT_ERROR_BACKOFF_TIME;

/// Messages of a failed group that arrive within this window are dropped too.
const FAILED_GROUP_IGNORE_WINDOW: Duration = Duration::from_secs(1);

/// Maps a message to the group whose messages must be processed one at a time.
pub type GroupingFunction = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Groups messages by their FIFO message group id, falling back to the
/// message id so ungrouped messages never block each other.
pub fn message_group_id(message: &Message) -> String {
    message
        .group_id()
        .unwrap_or_else(|| message.message_id())
        .to_string()
}

/// Properties of a [`GroupingMessageBroker`].
#[derive(Clone)]
pub struct GroupingMessageBrokerProperties {
    /// Maximum number of groups processing at once.
    pub concurrency_level: Dynamic<usize>,
    pub concurrency_polling_rate: Dynamic<Duration>,
    pub error_backoff_time: Dynamic<Duration>,
    /// Retrieval pauses once this many groups have messages waiting.
    pub maximum_number_of_cached_message_groups: Dynamic<usize>,
    /// Drop the rest of a group's cached messages when one of them fails.
    pub purge_extra_messages_in_group_on_error: bool,
    /// Process cached messages after the broker is told to stop instead of
    /// leaving them to reappear on the queue.
    pub process_cached_messages_on_shutdown: bool,
    pub grouping_function: GroupingFunction,
}

impl GroupingMessageBrokerProperties {
    pub fn new(
        concurrency_level: impl Into<Dynamic<usize>>,
        maximum_number_of_cached_message_groups: impl Into<Dynamic<usize>>,
    ) -> Self {
        GroupingMessageBrokerProperties {
            concurrency_level: concurrency_level.into(),
            concurrency_polling_rate: Dynamic::fixed(DEFAULT_CONCURRENCY_POLLING_RATE),
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
            maximum_number_of_cached_message_groups: maximum_number_of_cached_message_groups.into(),
            purge_extra_messages_in_group_on_error: true,
            process_cached_messages_on_shutdown: false,
            grouping_function: Arc::new(message_group_id),
        }
    }
}

#[derive(Default)]
struct GroupState {
    /// Messages waiting for their group to become free, in arrival order.
    cache: HashMap<String, VecDeque<Message>>,
    /// Groups in `cache`, oldest first.
    order: VecDeque<String>,
    processing: HashSet<String>,
    failed: HashMap<String, Instant>,
    /// Requests from the delegate broker for the next message to process.
    waiting: VecDeque<oneshot::Sender<Message>>,
}

impl GroupState {
    fn cache_message(&mut self, group: String, message: Message) {
        if let Some(failed_at) = self.failed.get(&group) {
            if failed_at.elapsed() < FAILED_GROUP_IGNORE_WINDOW {
                debug!(
                    message_id = %message.message_id(),
                    group = %group,
                    "Ignoring message from a group that recently failed"
                );
                return;
            }
            self.failed.remove(&group);
        }

        match self.cache.get_mut(&group) {
            Some(messages) => messages.push_back(message),
            None => {
                self.cache.insert(group.clone(), VecDeque::from([message]));
                self.order.push_back(group);
            }
        }
    }

    fn cached_messages(&self) -> usize {
        self.cache.values().map(VecDeque::len).sum()
    }

    /// Hands cached messages of idle groups to waiting requests.
    fn dispatch(&mut self) {
        self.waiting.retain(|sender| !sender.is_closed());
        while !self.waiting.is_empty() {
            let Some(position) = self
                .order
                .iter()
                .position(|group| !self.processing.contains(group))
            else {
                return;
            };
            let Some(group) = self.order.remove(position) else {
                return;
            };
            let Some(mut messages) = self.cache.remove(&group) else {
                continue;
            };
            let Some(message) = messages.pop_front() else {
                continue;
            };

            let mut undelivered = Some(message);
            while let Some(message) = undelivered.take() {
                let Some(sender) = self.waiting.pop_front() else {
                    undelivered = Some(message);
                    break;
                };
                if let Err(returned) = sender.send(message) {
                    undelivered = Some(returned);
                }
            }

            match undelivered {
                None => {
                    trace!(group = %group, "Dispatching message of idle group");
                    self.processing.insert(group.clone());
                    if !messages.is_empty() {
                        self.cache.insert(group.clone(), messages);
                        self.order.insert(position, group);
                    }
                }
                Some(message) => {
                    messages.push_front(message);
                    self.cache.insert(group.clone(), messages);
                    self.order.insert(position, group);
                    return;
                }
            }
        }
    }

    fn complete(&mut self, group: &str, purge: bool) {
        self.processing.remove(group);
        if purge {
            let now = Instant::now();
            self.failed
                .retain(|_, failed_at| now.duration_since(*failed_at) < FAILED_GROUP_IGNORE_WINDOW);
            self.failed.insert(group.to_string(), now);
            if let Some(purged) = self.cache.remove(group) {
                self.order.retain(|cached| cached != group);
                debug!(group = %group, purged = purged.len(), "Purged messages of failed group");
            }
        }
    }
}

struct Shared {
    state: Mutex<GroupState>,
    changed: Notify,
    grouping: GroupingFunction,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, GroupState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn receive(&self, message: Message) {
        let group = (self.grouping)(&message);
        let mut state = self.lock();
        state.cache_message(group, message);
        state.dispatch();
    }
}

/// Broker that never processes two messages of the same group at once and
/// processes each group's messages in the order they were received.
///
/// Retrieved messages are cached per group until the group is free; retrieval
/// pauses while `maximum_number_of_cached_message_groups` groups are waiting.
/// When a message fails and `purge_extra_messages_in_group_on_error` is set,
/// the group's cached messages are dropped so they are redelivered in order
/// after the failed one.
pub struct GroupingMessageBroker {
    properties: GroupingMessageBrokerProperties,
    delegate: ConcurrentMessageBroker,
}

impl GroupingMessageBroker {
    pub fn new(properties: GroupingMessageBrokerProperties) -> Self {
        let delegate = ConcurrentMessageBroker::new(ConcurrentMessageBrokerProperties {
            concurrency_level: properties.concurrency_level.clone(),
            concurrency_polling_rate: properties.concurrency_polling_rate.clone(),
            error_backoff_time: properties.error_backoff_time.clone(),
        });
        GroupingMessageBroker { properties, delegate }
    }

    /// Keeps up to `maximum_number_of_cached_message_groups` retrievals and
    /// cached groups outstanding. Results are consumed in request order so
    /// messages from one receive are cached in the order the queue returned
    /// them.
    async fn retrieve_messages(&self, shared: &Shared, keep_processing: &KeepProcessing, supplier: &MessageSupplier) {
        let mut retrievals = FuturesOrdered::new();
        while keep_processing.should_continue() {
            let maximum = self.properties.maximum_number_of_cached_message_groups.get().max(1);
            while shared.lock().cache.len() + retrievals.len() < maximum {
                retrievals.push_back(supplier());
            }

            let polling_rate = self.properties.concurrency_polling_rate.get();
            tokio::select! {
                biased;
                _ = keep_processing.cancelled() => break,
                Some(result) = retrievals.next(), if !retrievals.is_empty() => match result {
                    Ok(message) => shared.receive(message),
                    Err(RetrieverError::Exhausted) => {}
                    Err(error) => {
                        log_retrieval_error(&error);
                        let backoff = self.properties.error_backoff_time.get();
                        sleep_unless_cancelled(keep_processing.token(), backoff).await;
                    }
                },
                _ = shared.changed.notified() => {}
                _ = tokio::time::sleep(polling_rate) => {}
            }
        }
        // Dropping the outstanding retrievals withdraws their demand.
        drop(retrievals);
    }

    fn group_supplier(shared: &Arc<Shared>) -> MessageSupplier {
        let shared = Arc::clone(shared);
        Arc::new(move || {
            let (sender, receiver) = oneshot::channel();
            {
                let mut state = shared.lock();
                state.waiting.push_back(sender);
                state.dispatch();
            }
            shared.changed.notify_one();
            async move { receiver.await.map_err(|_| RetrieverError::Stopped) }.boxed()
        })
    }

    fn group_dispatcher(&self, shared: &Arc<Shared>, dispatcher: MessageDispatcher) -> MessageDispatcher {
        let shared = Arc::clone(shared);
        let purge_on_error = self.properties.purge_extra_messages_in_group_on_error;
        Arc::new(move |message: Message| {
            let group = (shared.grouping)(&message);
            let dispatcher = Arc::clone(&dispatcher);
            let shared = Arc::clone(&shared);
            async move {
                let outcome = dispatcher(message).await;
                {
                    let mut state = shared.lock();
                    state.complete(&group, outcome.is_err() && purge_on_error);
                    state.dispatch();
                }
                shared.changed.notify_one();
                outcome
            }
            .boxed()
        })
    }
}

#[async_trait]
impl MessageBroker for GroupingMessageBroker {
    async fn process_messages(
        &self,
        pool: &ProcessingPool,
        keep_processing: KeepProcessing,
        supplier: MessageSupplier,
        dispatcher: MessageDispatcher,
    ) {
        let shared = Arc::new(Shared {
            state: Mutex::new(GroupState::default()),
            changed: Notify::new(),
            grouping: Arc::clone(&self.properties.grouping_function),
        });
        let group_dispatcher = self.group_dispatcher(&shared, dispatcher);

        debug!("Beginning processing of grouped messages");
        tokio::join!(
            self.retrieve_messages(&shared, &keep_processing, &supplier),
            self.delegate.process_messages(
                pool,
                keep_processing.clone(),
                Self::group_supplier(&shared),
                Arc::clone(&group_dispatcher),
            ),
        );
        shared.lock().waiting.clear();

        let cached = shared.lock().cached_messages();
        if cached == 0 {
            return;
        }
        if !self.properties.process_cached_messages_on_shutdown {
            debug!(cached, "Leaving cached messages to be redelivered");
            shared.lock().cache.clear();
            return;
        }

        debug!(cached, "Processing cached messages before shutting down");
        let drain = CancellationToken::new();
        let remaining = Arc::clone(&shared);
        self.delegate
            .process_messages(
                pool,
                KeepProcessing::while_condition(drain.clone(), move || !remaining.lock().cache.is_empty()),
                Self::group_supplier(&shared),
                group_dispatcher,
            )
            .await;
        // Every cached message has been handed out; release surplus requests.
        drain.cancel();
    }
}
