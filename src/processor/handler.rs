use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, trace};

use super::{
    Acknowledge, HandlerContext, MessageProcessor, ResolveCallback, SharedMessageHandler, VisibilityExtender,
    panic_message,
};
use crate::client::SharedQueueClient;
use crate::errors::MessageProcessingError;
use crate::message::{Message, SharedQueueProperties};

/// Whether the processor resolves messages once the handler succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcknowledgeMode {
    /// Resolve after the handler returns `Ok`, unless it already acknowledged.
    #[default]
    Auto,
    /// Only resolve when the handler calls [`Acknowledge::acknowledge`].
    Manual,
}

/// Processor that runs a [`MessageHandler`](super::MessageHandler).
///
/// Handler errors and panics are reported as [`MessageProcessingError`]s and
/// leave the message unresolved.
pub struct HandlerMessageProcessor {
    client: SharedQueueClient,
    queue: SharedQueueProperties,
    handler: SharedMessageHandler,
    acknowledge_mode: AcknowledgeMode,
}

impl HandlerMessageProcessor {
    pub fn new(client: SharedQueueClient, queue: SharedQueueProperties, handler: SharedMessageHandler) -> Self {
        HandlerMessageProcessor {
            client,
            queue,
            handler,
            acknowledge_mode: AcknowledgeMode::Auto,
        }
    }

    pub fn with_acknowledge_mode(mut self, acknowledge_mode: AcknowledgeMode) -> Self {
        self.acknowledge_mode = acknowledge_mode;
        self
    }
}

#[async_trait]
impl MessageProcessor for HandlerMessageProcessor {
    async fn process_message(&self, message: Message, resolve: ResolveCallback) -> Result<(), MessageProcessingError> {
        let acknowledge = Acknowledge::new(resolve.clone());
        let context = HandlerContext::new(
            acknowledge.clone(),
            VisibilityExtender::new(self.client.clone(), self.queue.clone(), message.clone()),
        );

        trace!(message_id = %message.message_id(), "Invoking message handler");
        let outcome = AssertUnwindSafe(self.handler.handle(message.clone(), context))
            .catch_unwind()
            .await;
        match outcome {
            Err(payload) => return Err(MessageProcessingError::Panicked(panic_message(payload))),
            Ok(Err(error)) => return Err(MessageProcessingError::Handler(error)),
            Ok(Ok(())) => {}
        }

        if self.acknowledge_mode == AcknowledgeMode::Auto && !acknowledge.is_acknowledged() {
            let resolving = resolve();
            let message_id = message.message_id().to_string();
            tokio::spawn(async move {
                if let Err(error) = resolving.await {
                    error!(message_id = %message_id, error = %error, "Error resolving successfully processed message");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::client::InMemoryQueueClient;
    use crate::errors::{BoxError, ResolveError};
    use crate::message::QueueProperties;
    use crate::processor::{MessageHandler, handler_fn};

    fn counting_resolver() -> (ResolveCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let resolve: ResolveCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), ResolveError>(()) }.boxed()
        });
        (resolve, count)
    }

    fn processor(handler: SharedMessageHandler) -> HandlerMessageProcessor {
        HandlerMessageProcessor::new(
            Arc::new(InMemoryQueueClient::new()),
            Arc::new(QueueProperties::new("http://localhost/queue/processor")),
            handler,
        )
    }

    fn message() -> Message {
        Message::builder("id-1", "handle-1").body("payload").build()
    }

    struct AcknowledgingHandler;

    #[async_trait]
    impl MessageHandler for AcknowledgingHandler {
        async fn handle(&self, _message: Message, context: HandlerContext) -> Result<(), BoxError> {
            context.acknowledge().acknowledge().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_handler_resolves_message() {
        let handler = handler_fn(|_message: Message, _: ()| async { Ok::<(), BoxError>(()) }, ());
        let (resolve, resolved) = counting_resolver();

        processor(Arc::new(handler)).process_message(message(), resolve).await.unwrap();

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_leaves_message_unresolved() {
        let handler = handler_fn(|_message: Message, _: ()| async { Err::<(), BoxError>("boom".into()) }, ());
        let (resolve, resolved) = counting_resolver();

        let result = processor(Arc::new(handler)).process_message(message(), resolve).await;

        assert!(matches!(result, Err(MessageProcessingError::Handler(_))));
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_reported() {
        let handler = handler_fn(
            |_message: Message, _: ()| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), BoxError>(())
            },
            (),
        );
        let (resolve, resolved) = counting_resolver();

        let result = processor(Arc::new(handler)).process_message(message(), resolve).await;

        match result {
            Err(MessageProcessingError::Panicked(reason)) => assert_eq!(reason, "handler exploded"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_acknowledgement_is_not_repeated() {
        let (resolve, resolved) = counting_resolver();

        processor(Arc::new(AcknowledgingHandler))
            .process_message(message(), resolve)
            .await
            .unwrap();

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_mode_requires_acknowledgement() {
        let handler = handler_fn(|_message: Message, _: ()| async { Ok::<(), BoxError>(()) }, ());
        let (resolve, resolved) = counting_resolver();

        processor(Arc::new(handler))
            .with_acknowledge_mode(AcknowledgeMode::Manual)
            .process_message(message(), resolve)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(resolved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shared_resources_are_passed_to_function_handlers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn(
            |_message: Message, seen: Arc<AtomicUsize>| async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            },
            Arc::clone(&seen),
        );
        let (resolve, _) = counting_resolver();
        let processor = processor(Arc::new(handler));

        processor.process_message(message(), resolve.clone()).await.unwrap();
        processor.process_message(message(), resolve).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
