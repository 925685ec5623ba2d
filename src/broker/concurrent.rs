use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use super::{KeepProcessing, MessageBroker, MessageDispatcher, MessageSupplier, ProcessingPool};
use crate::dynamic::Dynamic;
use crate::errors::{ConfigurationError, RetrieverError};
use crate::message::Message;
use crate::retriever::DEFAULT_ERROR_BACKOFF_TIME;

/// How long a broker waits at its concurrency limit before re-reading it.
pub const DEFAULT_CONCURRENCY_POLLING_RATE: Duration = Duration::from_secs(60);

/// Properties of a [`ConcurrentMessageBroker`].
#[derive(Debug, Clone)]
pub struct ConcurrentMessageBrokerProperties {
    /// Maximum number of messages being retrieved or processed at once.
    pub concurrency_level: Dynamic<usize>,
    /// How long to wait at the concurrency limit before re-reading it.
    pub concurrency_polling_rate: Dynamic<Duration>,
    /// Pause after a failed retrieval.
    pub error_backoff_time: Dynamic<Duration>,
}

impl ConcurrentMessageBrokerProperties {
    pub fn new(concurrency_level: impl Into<Dynamic<usize>>) -> Self {
        ConcurrentMessageBrokerProperties {
            concurrency_level: concurrency_level.into(),
            concurrency_polling_rate: Dynamic::fixed(DEFAULT_CONCURRENCY_POLLING_RATE),
            error_backoff_time: Dynamic::fixed(DEFAULT_ERROR_BACKOFF_TIME),
        }
    }

    pub fn builder() -> ConcurrentMessageBrokerPropertiesBuilder {
        ConcurrentMessageBrokerPropertiesBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConcurrentMessageBrokerPropertiesBuilder {
    concurrency_level: Option<Dynamic<usize>>,
    concurrency_polling_rate: Option<Dynamic<Duration>>,
    error_backoff_time: Option<Dynamic<Duration>>,
}

impl ConcurrentMessageBrokerPropertiesBuilder {
    pub fn concurrency_level(mut self, concurrency_level: impl Into<Dynamic<usize>>) -> Self {
        self.concurrency_level = Some(concurrency_level.into());
        self
    }

    pub fn concurrency_polling_rate(mut self, polling_rate: impl Into<Dynamic<Duration>>) -> Self {
        self.concurrency_polling_rate = Some(polling_rate.into());
        self
    }

    pub fn error_backoff_time(mut self, backoff: impl Into<Dynamic<Duration>>) -> Self {
        self.error_backoff_time = Some(backoff.into());
        self
    }

    pub fn build(self) -> Result<ConcurrentMessageBrokerProperties, ConfigurationError> {
        let concurrency_level = self
            .concurrency_level
            .ok_or(ConfigurationError::Missing {
                field: "concurrency_level",
            })?;
        let mut properties = ConcurrentMessageBrokerProperties::new(concurrency_level);
        if let Some(polling_rate) = self.concurrency_polling_rate {
            properties.concurrency_polling_rate = polling_rate;
        }
        if let Some(backoff) = self.error_backoff_time {
            properties.error_backoff_time = backoff;
        }
        Ok(properties)
    }
}

/// Slot accounting and retrieval health shared by every
/// [`process_messages`](MessageBroker::process_messages) call of one broker,
/// so a second pass started during shutdown still counts the handlers of the
/// first.
#[derive(Default)]
struct BrokerState {
    in_flight: AtomicUsize,
    slot_freed: Notify,
    /// Set while retrieval is failing: no retrieval starts before this
    /// instant, and then only one at a time until one succeeds.
    recovering_until: Mutex<Option<Instant>>,
}

impl BrokerState {
    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn recovering_until(&self) -> Option<Instant> {
        *self.lock_recovery()
    }

    fn retrieval_failed(&self, backoff: Duration) {
        let until = Instant::now() + backoff;
        let mut recovering = self.lock_recovery();
        if recovering.is_none_or(|current| current < until) {
            *recovering = Some(until);
        }
    }

    fn retrieval_recovered(&self) {
        if self.lock_recovery().take().is_some() {
            info!("Message retrieval recovered");
        }
    }

    fn lock_recovery(&self) -> MutexGuard<'_, Option<Instant>> {
        match self.recovering_until.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases a concurrency slot when the task holding it finishes or is dropped.
struct InFlight {
    state: Arc<BrokerState>,
}

impl InFlight {
    fn acquire(state: &Arc<BrokerState>) -> Self {
        state.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            state: Arc::clone(state),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.state.slot_freed.notify_one();
    }
}

pub(super) fn log_retrieval_error(error: &RetrieverError) {
    match error {
        RetrieverError::Client(client_error) => {
            error!(error = %error, transient = client_error.is_transient(), "Error retrieving message")
        }
        error => error!(error = %error, "Error retrieving message"),
    }
}

async fn dispatch(dispatcher: MessageDispatcher, message: Message) {
    let message_id = message.message_id().to_string();
    if let Err(error) = dispatcher(message).await {
        error!(message_id = %message_id, error = %error, "Error processing message");
    }
}

/// Broker that processes up to a configurable number of messages at once.
///
/// The concurrency level is read again after every message and whenever the
/// broker has waited `concurrency_polling_rate` at the limit, so raising it
/// takes effect without restarting the container. Lowering it lets in-flight
/// messages finish; no new retrieval starts until the count is below the new
/// level. The limit holds across repeated `process_messages` calls, including
/// the extra pass a container runs on shutdown.
///
/// When a retrieval fails the broker pauses for `error_backoff_time`, then
/// retrieves one message at a time until retrieval succeeds again.
pub struct ConcurrentMessageBroker {
    properties: ConcurrentMessageBrokerProperties,
    state: Arc<BrokerState>,
}

impl ConcurrentMessageBroker {
    pub fn new(properties: ConcurrentMessageBrokerProperties) -> Self {
        ConcurrentMessageBroker {
            properties,
            state: Arc::new(BrokerState::default()),
        }
    }

    /// Messages currently being retrieved or processed.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight()
    }
}

#[async_trait]
impl MessageBroker for ConcurrentMessageBroker {
    async fn process_messages(
        &self,
        pool: &ProcessingPool,
        keep_processing: KeepProcessing,
        supplier: MessageSupplier,
        dispatcher: MessageDispatcher,
    ) {
        debug!(in_flight = self.state.in_flight(), "Beginning processing of messages");

        while keep_processing.should_continue() {
            let concurrency_level = self.properties.concurrency_level.get();
            let current = self.state.in_flight();
            if current >= concurrency_level {
                trace!(current, concurrency_level, "Concurrency limit reached, waiting for a free slot");
                let polling_rate = self.properties.concurrency_polling_rate.get();
                tokio::select! {
                    biased;
                    _ = keep_processing.cancelled() => break,
                    _ = self.state.slot_freed.notified() => {}
                    _ = tokio::time::sleep(polling_rate) => {}
                }
                continue;
            }

            if let Some(until) = self.state.recovering_until() {
                tokio::select! {
                    biased;
                    _ = keep_processing.cancelled() => break,
                    _ = tokio::time::sleep_until(until) => {}
                }
                let slot = InFlight::acquire(&self.state);
                let result = tokio::select! {
                    biased;
                    _ = keep_processing.cancelled() => break,
                    result = supplier() => result,
                };
                match result {
                    Ok(message) => {
                        self.state.retrieval_recovered();
                        let dispatcher = Arc::clone(&dispatcher);
                        pool.spawn(async move {
                            let _slot = slot;
                            dispatch(dispatcher, message).await;
                        });
                    }
                    Err(RetrieverError::Exhausted) => {}
                    Err(error) => {
                        log_retrieval_error(&error);
                        self.state.retrieval_failed(self.properties.error_backoff_time.get());
                    }
                }
                continue;
            }

            let slot = InFlight::acquire(&self.state);
            let retrieval = supplier();
            let dispatcher = Arc::clone(&dispatcher);
            let stop = keep_processing.token().clone();
            let state = Arc::clone(&self.state);
            let error_backoff_time = self.properties.error_backoff_time.get();
            pool.spawn(async move {
                let _slot = slot;
                let message = tokio::select! {
                    biased;
                    result = retrieval => result,
                    _ = stop.cancelled() => return,
                };
                match message {
                    Ok(message) => dispatch(dispatcher, message).await,
                    Err(RetrieverError::Exhausted) => {}
                    Err(error) => {
                        if !stop.is_cancelled() {
                            log_retrieval_error(&error);
                            state.retrieval_failed(error_backoff_time);
                        }
                    }
                }
            });
        }

        info!(in_flight = self.state.in_flight(), "Broker stopped requesting messages");
    }
}
