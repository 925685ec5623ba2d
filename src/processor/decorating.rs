use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use super::{MessageProcessor, ResolveCallback, SharedMessageProcessor, panic_message};
use crate::decorator::SharedMessageProcessingDecorator;
use crate::errors::{BoxError, MessageProcessingError, ResolveError};
use crate::message::{Message, SharedQueueProperties};

/// Details about the message being processed, shared by all decorators.
///
/// A fresh context is created for every message. Decorators can use the
/// attribute map to pass state between their own hooks or to each other.
#[derive(Debug)]
pub struct MessageProcessingContext {
    listener_identifier: String,
    queue: SharedQueueProperties,
    attributes: Mutex<HashMap<String, String>>,
}

impl MessageProcessingContext {
    pub fn new(listener_identifier: impl Into<String>, queue: SharedQueueProperties) -> Self {
        MessageProcessingContext {
            listener_identifier: listener_identifier.into(),
            queue,
            attributes: Mutex::new(HashMap::new()),
        }
    }

    /// Identifier of the container processing the message.
    pub fn listener_identifier(&self) -> &str {
        &self.listener_identifier
    }

    pub fn queue_properties(&self) -> &SharedQueueProperties {
        &self.queue
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes().get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes().insert(key.into(), value.into());
    }

    pub fn remove_attribute(&self, key: &str) -> Option<String> {
        self.attributes().remove(key)
    }

    fn attributes(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.attributes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Processor that calls [`MessageProcessingDecorator`] hooks around a
/// delegate processor.
///
/// The decorator list is fixed at construction.
///
/// [`MessageProcessingDecorator`]: crate::decorator::MessageProcessingDecorator
pub struct DecoratingMessageProcessor {
    listener_identifier: String,
    queue: SharedQueueProperties,
    decorators: Arc<[SharedMessageProcessingDecorator]>,
    delegate: SharedMessageProcessor,
}

impl DecoratingMessageProcessor {
    pub fn new(
        listener_identifier: impl Into<String>,
        queue: SharedQueueProperties,
        decorators: Vec<SharedMessageProcessingDecorator>,
        delegate: SharedMessageProcessor,
    ) -> Self {
        DecoratingMessageProcessor {
            listener_identifier: listener_identifier.into(),
            queue,
            decorators: decorators.into(),
            delegate,
        }
    }

    fn run_pre_processing(&self, context: &MessageProcessingContext, message: &Message) -> Result<(), BoxError> {
        for decorator in self.decorators.iter() {
            match catch_unwind(AssertUnwindSafe(|| decorator.on_pre_processing(context, message))) {
                Ok(result) => result?,
                Err(payload) => return Err(panic_message(payload).into()),
            }
        }
        Ok(())
    }
}

/// Runs a hook on every decorator in registration order, logging panics.
fn run_in_order<F>(decorators: &[SharedMessageProcessingDecorator], hook: &'static str, f: F)
where
    F: Fn(&SharedMessageProcessingDecorator),
{
    for decorator in decorators {
        run_safely(decorator, hook, &f);
    }
}

/// Runs a hook on every decorator in reverse registration order, logging panics.
fn run_in_reverse<F>(decorators: &[SharedMessageProcessingDecorator], hook: &'static str, f: F)
where
    F: Fn(&SharedMessageProcessingDecorator),
{
    for decorator in decorators.iter().rev() {
        run_safely(decorator, hook, &f);
    }
}

fn run_safely<F>(decorator: &SharedMessageProcessingDecorator, hook: &'static str, f: &F)
where
    F: Fn(&SharedMessageProcessingDecorator),
{
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(decorator))) {
        error!(hook, panic = %panic_message(payload), "Message processing decorator panicked");
    }
}

#[async_trait]
impl MessageProcessor for DecoratingMessageProcessor {
    async fn process_message(&self, message: Message, resolve: ResolveCallback) -> Result<(), MessageProcessingError> {
        let context = Arc::new(MessageProcessingContext::new(
            self.listener_identifier.clone(),
            self.queue.clone(),
        ));

        if let Err(cause) = self.run_pre_processing(&context, &message) {
            let error = MessageProcessingError::Decorator(cause);
            run_in_reverse(&self.decorators, "on_error", |d| d.on_error(&context, &message, &error));
            run_in_reverse(&self.decorators, "on_processing_complete", |d| {
                d.on_processing_complete(&context, &message)
            });
            return Err(error);
        }

        let wrapped_resolve: ResolveCallback = {
            let decorators = Arc::clone(&self.decorators);
            let context = Arc::clone(&context);
            let message = message.clone();
            Arc::new(move || {
                run_in_order(&decorators, "on_resolve", |d| d.on_resolve(&context, &message));
                let resolving = resolve();
                let decorators = Arc::clone(&decorators);
                let context = Arc::clone(&context);
                let message = message.clone();
                // Outcome hooks run even if the caller drops the returned future.
                let outcome_hooks = tokio::spawn(async move {
                    let outcome = resolving.await;
                    match &outcome {
                        Ok(()) => run_in_reverse(&decorators, "on_resolve_success", |d| {
                            d.on_resolve_success(&context, &message)
                        }),
                        Err(error) => run_in_reverse(&decorators, "on_resolve_failure", |d| {
                            d.on_resolve_failure(&context, &message, error)
                        }),
                    }
                    outcome
                });
                async move { outcome_hooks.await.unwrap_or_else(|_| Err(ResolveError::Stopped)) }.boxed()
            })
        };

        let outcome = self.delegate.process_message(message.clone(), wrapped_resolve).await;
        match &outcome {
            Ok(()) => run_in_reverse(&self.decorators, "on_post_processing", |d| {
                d.on_post_processing(&context, &message)
            }),
            Err(error) => run_in_reverse(&self.decorators, "on_error", |d| d.on_error(&context, &message, error)),
        }
        run_in_reverse(&self.decorators, "on_processing_complete", |d| {
            d.on_processing_complete(&context, &message)
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::decorator::MessageProcessingDecorator;
    use crate::errors::ResolveError;
    use crate::message::QueueProperties;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingDecorator {
        name: &'static str,
        journal: Journal,
        reject: bool,
    }

    impl RecordingDecorator {
        fn record(&self, event: &str) {
            self.journal.lock().unwrap().push(format!("{}:{}", self.name, event));
        }
    }

    impl MessageProcessingDecorator for RecordingDecorator {
        fn on_pre_processing(&self, context: &MessageProcessingContext, _message: &Message) -> Result<(), BoxError> {
            self.record("pre");
            context.set_attribute(self.name, "seen");
            if self.reject {
                return Err("rejected".into());
            }
            Ok(())
        }

        fn on_post_processing(&self, context: &MessageProcessingContext, _message: &Message) {
            assert_eq!(context.attribute(self.name).as_deref(), Some("seen"));
            self.record("post");
        }

        fn on_error(&self, _context: &MessageProcessingContext, _message: &Message, _error: &MessageProcessingError) {
            self.record("error");
        }

        fn on_processing_complete(&self, _context: &MessageProcessingContext, _message: &Message) {
            self.record("complete");
        }

        fn on_resolve(&self, _context: &MessageProcessingContext, _message: &Message) {
            self.record("resolve");
        }

        fn on_resolve_success(&self, _context: &MessageProcessingContext, _message: &Message) {
            self.record("resolved");
        }

        fn on_resolve_failure(&self, _context: &MessageProcessingContext, _message: &Message, _error: &ResolveError) {
            self.record("resolve-failed");
        }
    }

    struct PanickingDecorator;

    impl MessageProcessingDecorator for PanickingDecorator {
        fn on_post_processing(&self, _context: &MessageProcessingContext, _message: &Message) {
            panic!("decorator bug");
        }
    }

    struct Delegate {
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageProcessor for Delegate {
        async fn process_message(&self, _message: Message, resolve: ResolveCallback) -> Result<(), MessageProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                resolve().await.map_err(|e| MessageProcessingError::Handler(e.into()))
            } else {
                Err(MessageProcessingError::Handler("failed".into()))
            }
        }
    }

    /// Acknowledges without waiting for the outcome.
    struct FireAndForget;

    #[async_trait]
    impl MessageProcessor for FireAndForget {
        async fn process_message(&self, _message: Message, resolve: ResolveCallback) -> Result<(), MessageProcessingError> {
            drop(resolve());
            Ok(())
        }
    }

    fn decorating(
        decorators: Vec<SharedMessageProcessingDecorator>,
        delegate: Arc<Delegate>,
        resolve_ok: bool,
    ) -> (DecoratingMessageProcessor, ResolveCallback) {
        let processor = DecoratingMessageProcessor::new(
            "listener",
            Arc::new(QueueProperties::new("http://localhost/queue/decorated")),
            decorators,
            delegate,
        );
        let resolve: ResolveCallback = Arc::new(move || {
            async move {
                if resolve_ok {
                    Ok(())
                } else {
                    Err(ResolveError::Stopped)
                }
            }
            .boxed()
        });
        (processor, resolve)
    }

    fn recording(name: &'static str, journal: &Journal, reject: bool) -> SharedMessageProcessingDecorator {
        Arc::new(RecordingDecorator {
            name,
            journal: Arc::clone(journal),
            reject,
        })
    }

    fn message() -> Message {
        Message::builder("id-1", "handle-1").build()
    }

    #[tokio::test]
    async fn hooks_nest_around_successful_processing() {
        let journal = Journal::default();
        let delegate = Arc::new(Delegate {
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (processor, resolve) = decorating(
            vec![recording("a", &journal, false), recording("b", &journal, false)],
            delegate,
            true,
        );

        processor.process_message(message(), resolve).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "a:pre",
                "b:pre",
                "a:resolve",
                "b:resolve",
                "b:resolved",
                "a:resolved",
                "b:post",
                "a:post",
                "b:complete",
                "a:complete"
            ]
        );
    }

    #[tokio::test]
    async fn failures_reach_error_hooks() {
        let journal = Journal::default();
        let delegate = Arc::new(Delegate {
            succeed: false,
            calls: AtomicUsize::new(0),
        });
        let (processor, resolve) = decorating(vec![recording("a", &journal, false)], delegate, true);

        let result = processor.process_message(message(), resolve).await;

        assert!(matches!(result, Err(MessageProcessingError::Handler(_))));
        assert_eq!(*journal.lock().unwrap(), vec!["a:pre", "a:error", "a:complete"]);
    }

    #[tokio::test]
    async fn failing_pre_processing_skips_the_delegate() {
        let journal = Journal::default();
        let delegate = Arc::new(Delegate {
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (processor, resolve) = decorating(
            vec![recording("a", &journal, true), recording("b", &journal, false)],
            Arc::clone(&delegate),
            true,
        );

        let result = processor.process_message(message(), resolve).await;

        assert!(matches!(result, Err(MessageProcessingError::Decorator(_))));
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["a:pre", "b:error", "a:error", "b:complete", "a:complete"]
        );
    }

    #[tokio::test]
    async fn resolve_failures_are_reported() {
        let journal = Journal::default();
        let delegate = Arc::new(Delegate {
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (processor, resolve) = decorating(vec![recording("a", &journal, false)], delegate, false);

        let result = processor.process_message(message(), resolve).await;

        assert!(result.is_err());
        assert!(journal.lock().unwrap().contains(&"a:resolve-failed".to_string()));
    }

    #[tokio::test]
    async fn panicking_exit_hooks_are_ignored() {
        let journal = Journal::default();
        let delegate = Arc::new(Delegate {
            succeed: true,
            calls: AtomicUsize::new(0),
        });
        let (processor, resolve) = decorating(
            vec![recording("a", &journal, false), Arc::new(PanickingDecorator) as SharedMessageProcessingDecorator],
            delegate,
            true,
        );

        processor.process_message(message(), resolve).await.unwrap();

        assert!(journal.lock().unwrap().contains(&"a:post".to_string()));
    }

    #[tokio::test]
    async fn resolve_outcome_is_reported_when_acknowledgement_is_not_awaited() {
        let journal = Journal::default();
        let processor = DecoratingMessageProcessor::new(
            "listener",
            Arc::new(QueueProperties::new("http://localhost/queue/decorated")),
            vec![recording("a", &journal, false)],
            Arc::new(FireAndForget),
        );
        let resolve: ResolveCallback = Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<(), ResolveError>(())
            }
            .boxed()
        });

        processor.process_message(message(), resolve).await.unwrap();
        assert!(!journal.lock().unwrap().contains(&"a:resolved".to_string()));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !journal.lock().unwrap().contains(&"a:resolved".to_string()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["a:pre", "a:resolve", "a:post", "a:complete", "a:resolved"]
        );
    }
}
