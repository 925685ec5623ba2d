use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::MessageProcessingDecorator;
use crate::client::SharedQueueClient;
use crate::errors::{BoxError, ConfigurationError};
use crate::message::{MAX_NUMBER_OF_MESSAGES_IN_BATCH, Message, SharedQueueProperties, VisibilityEntry};
use crate::processor::MessageProcessingContext;

/// Properties of an [`AutoVisibilityExtenderDecorator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoVisibilityExtenderProperties {
    /// Visibility timeout applied on every extension.
    pub visibility_timeout: Duration,
    /// How long before expiry the extension is sent. Must be shorter than
    /// `visibility_timeout`.
    pub buffer_duration: Duration,
    /// Extensions stop once a message has been processing this long.
    pub max_duration: Duration,
}

impl Default for AutoVisibilityExtenderProperties {
    fn default() -> Self {
        AutoVisibilityExtenderProperties {
            visibility_timeout: Duration::from_secs(30),
            buffer_duration: Duration::from_secs(2),
            max_duration: Duration::from_secs(15 * 60),
        }
    }
}

impl AutoVisibilityExtenderProperties {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.visibility_timeout.is_zero() {
            return Err(ConfigurationError::invalid("visibility_timeout", "must be positive"));
        }
        if self.buffer_duration >= self.visibility_timeout {
            return Err(ConfigurationError::invalid(
                "buffer_duration",
                "must be shorter than visibility_timeout",
            ));
        }
        Ok(())
    }

    fn extension_interval(&self) -> Duration {
        self.visibility_timeout - self.buffer_duration
    }
}

struct TrackedMessage {
    message: Message,
    started: Instant,
    next_extension: Instant,
}

#[derive(Default)]
struct ExtenderState {
    tracked: HashMap<String, TrackedMessage>,
    worker_running: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ExtenderState>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ExtenderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Decorator that keeps extending the visibility of messages while they are
/// being processed.
///
/// A background task sends batched visibility changes shortly before each
/// message would become visible again. Tracking stops when processing
/// completes, when the message is acknowledged, or after `max_duration`; the
/// handler itself is not cancelled at that point, its message simply becomes
/// visible again once the last extension runs out.
pub struct AutoVisibilityExtenderDecorator {
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    properties: AutoVisibilityExtenderProperties,
    shared: Arc<Shared>,
}

impl AutoVisibilityExtenderDecorator {
    pub fn new(
        client: SharedQueueClient,
        queue: SharedQueueProperties,
        properties: AutoVisibilityExtenderProperties,
    ) -> Result<Self, ConfigurationError> {
        properties.validate()?;
        Ok(AutoVisibilityExtenderDecorator {
            client,
            queue,
            properties,
            shared: Arc::new(Shared::default()),
        })
    }

    /// Number of messages whose visibility is currently being extended.
    pub fn tracked_messages(&self) -> usize {
        self.shared.lock().tracked.len()
    }

    fn stop_tracking(&self, message: &Message) {
        if self.shared.lock().tracked.remove(message.receipt_handle()).is_some() {
            debug!(message_id = %message.message_id(), "Stopped extending message visibility");
            self.shared.changed.notify_one();
        }
    }
}

impl MessageProcessingDecorator for AutoVisibilityExtenderDecorator {
    fn on_pre_processing(&self, context: &MessageProcessingContext, message: &Message) -> Result<(), BoxError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let now = Instant::now();
        let mut state = self.shared.lock();
        state.tracked.insert(
            message.receipt_handle().to_string(),
            TrackedMessage {
                message: message.clone(),
                started: now,
                next_extension: now + self.properties.extension_interval(),
            },
        );
        if !state.worker_running {
            state.worker_running = true;
            debug!(
                container = %context.listener_identifier(),
                "Starting auto visibility extender"
            );
            runtime.spawn(run_extender(
                self.client.clone(),
                self.queue.clone(),
                self.properties.clone(),
                Arc::clone(&self.shared),
            ));
        }
        drop(state);
        self.shared.changed.notify_one();
        Ok(())
    }

    fn on_processing_complete(&self, _context: &MessageProcessingContext, message: &Message) {
        self.stop_tracking(message);
    }

    fn on_resolve(&self, _context: &MessageProcessingContext, message: &Message) {
        // Manually acknowledged messages no longer need extending.
        self.stop_tracking(message);
    }
}

async fn run_extender(
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    properties: AutoVisibilityExtenderProperties,
    shared: Arc<Shared>,
) {
    loop {
        let next_wake = {
            let mut state = shared.lock();
            if state.tracked.is_empty() {
                state.worker_running = false;
                debug!(queue_url = %queue, "Auto visibility extender has no messages left");
                return;
            }

            let now = Instant::now();
            state.tracked.retain(|_, tracked| {
                let expired = now >= tracked.started + properties.max_duration;
                if expired {
                    warn!(
                        message_id = %tracked.message.message_id(),
                        "Message exceeded maximum processing duration, no longer extending visibility"
                    );
                }
                !expired
            });

            let mut due = Vec::new();
            for tracked in state.tracked.values_mut() {
                if now >= tracked.next_extension {
                    info!(message_id = %tracked.message.message_id(), "Automatically extending visibility timeout");
                    due.push(VisibilityEntry::new(&tracked.message, properties.visibility_timeout));
                    tracked.next_extension = now + properties.extension_interval();
                }
            }
            while !due.is_empty() {
                let rest = due.split_off(due.len().min(MAX_NUMBER_OF_MESSAGES_IN_BATCH));
                tokio::spawn(extend_batch(client.clone(), queue.clone(), due));
                due = rest;
            }

            state
                .tracked
                .values()
                .map(|tracked| tracked.next_extension.min(tracked.started + properties.max_duration))
                .min()
        };

        if let Some(wake_at) = next_wake {
            tokio::select! {
                _ = shared.changed.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

async fn extend_batch(client: SharedQueueClient, queue: SharedQueueProperties, entries: Vec<VisibilityEntry>) {
    let message_ids: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
    match client.change_message_visibility_batch(queue.queue_url(), entries).await {
        Ok(result) if result.has_failures() => {
            let failed: Vec<&str> = result.failed.iter().map(|failure| failure.id.as_str()).collect();
            error!(queue_url = %queue, ?failed, "Some messages failed to have their visibility timeout changed");
        }
        Ok(_) => {}
        Err(error) => {
            error!(
                queue_url = %queue,
                ?message_ids,
                error = %error,
                "Error changing visibility timeout of messages"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientCall, InMemoryQueueClient, QueueClient};
    use crate::message::{OutgoingMessage, QueueProperties, ReceiveRequest};

    const QUEUE: &str = "http://localhost/queue/auto-visibility";

    async fn in_flight_message(client: &InMemoryQueueClient) -> Message {
        client.send_message(QUEUE, OutgoingMessage::new("slow")).await.unwrap();
        client
            .receive_messages(ReceiveRequest::new(QUEUE, 1).wait_time(Duration::ZERO))
            .await
            .unwrap()
            .remove(0)
    }

    fn extension_calls(client: &InMemoryQueueClient) -> usize {
        client
            .calls()
            .iter()
            .filter(|call| matches!(call, ClientCall::ChangeVisibilityBatch { .. }))
            .count()
    }

    fn decorator(client: &Arc<InMemoryQueueClient>, max_duration: Duration) -> AutoVisibilityExtenderDecorator {
        AutoVisibilityExtenderDecorator::new(
            client.clone(),
            Arc::new(QueueProperties::new(QUEUE)),
            AutoVisibilityExtenderProperties {
                visibility_timeout: Duration::from_millis(100),
                buffer_duration: Duration::from_millis(50),
                max_duration,
            },
        )
        .unwrap()
    }

    #[test]
    fn buffer_must_be_shorter_than_visibility_timeout() {
        let properties = AutoVisibilityExtenderProperties {
            visibility_timeout: Duration::from_secs(5),
            buffer_duration: Duration::from_secs(5),
            max_duration: Duration::from_secs(60),
        };
        assert!(properties.validate().is_err());
        assert!(AutoVisibilityExtenderProperties::default().validate().is_ok());
    }

    #[tokio::test]
    async fn extends_until_processing_completes() {
        let client = Arc::new(InMemoryQueueClient::with_visibility_timeout(Duration::from_millis(100)));
        let message = in_flight_message(&client).await;
        let decorator = decorator(&client, Duration::from_secs(60));
        let context = MessageProcessingContext::new("listener", Arc::new(QueueProperties::new(QUEUE)));

        decorator.on_pre_processing(&context, &message).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(extension_calls(&client) >= 2);
        assert_eq!(client.approximate_number_of_messages(QUEUE), 0);

        decorator.on_processing_complete(&context, &message);
        assert_eq!(decorator.tracked_messages(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = extension_calls(&client);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(extension_calls(&client), calls);
    }

    #[tokio::test]
    async fn stops_extending_after_max_duration() {
        let client = Arc::new(InMemoryQueueClient::new());
        let message = in_flight_message(&client).await;
        let decorator = decorator(&client, Duration::from_millis(120));
        let context = MessageProcessingContext::new("listener", Arc::new(QueueProperties::new(QUEUE)));

        decorator.on_pre_processing(&context, &message).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(decorator.tracked_messages(), 0);

        let calls = extension_calls(&client);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(extension_calls(&client), calls);
    }

    #[tokio::test]
    async fn acknowledgement_stops_extension() {
        let client = Arc::new(InMemoryQueueClient::new());
        let message = in_flight_message(&client).await;
        let decorator = decorator(&client, Duration::from_secs(60));
        let context = MessageProcessingContext::new("listener", Arc::new(QueueProperties::new(QUEUE)));

        decorator.on_pre_processing(&context, &message).unwrap();
        decorator.on_resolve(&context, &message);

        assert_eq!(decorator.tracked_messages(), 0);
    }
}
