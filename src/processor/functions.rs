use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::{HandlerContext, MessageHandler};
use crate::errors::BoxError;
use crate::message::Message;

/// Implementation of [`MessageHandler`] that calls an async function.
///
/// This struct wraps a user-provided function and the resources shared between
/// its invocations. Each message is passed to the function together with a
/// clone of the shared resources.
///
/// # Type Parameters
///
/// * `RFn` - The message handler function type
/// * `Fut` - The future returned by the handler function
/// * `TShared` - The type of shared resources passed to the handler
pub struct FnMessageHandler<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    rv_fn: RFn,
    shared_resources: TShared,
    _future: PhantomData<fn() -> Fut>,
}

impl<RFn, Fut, TShared> FnMessageHandler<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    /// Creates a new handler around a function.
    ///
    /// # Arguments
    ///
    /// * `rv_fn` - The message handler function
    /// * `shared_resources` - Resources shared between message processing calls
    pub fn new(rv_fn: RFn, shared_resources: TShared) -> Self {
        FnMessageHandler {
            rv_fn,
            shared_resources,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<RFn, Fut, TShared> MessageHandler for FnMessageHandler<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    async fn handle(&self, message: Message, _context: HandlerContext) -> Result<(), BoxError> {
        (self.rv_fn)(message, self.shared_resources.clone()).await
    }
}

/// Wraps an async function and its shared resources into a [`MessageHandler`].
///
/// The function only sees the message; use a [`MessageHandler`]
/// implementation when the handler needs to acknowledge manually or extend
/// the visibility of the message.
///
/// # Arguments
///
/// * `rv_fn` - Called with every message and a clone of `shared_resources`
/// * `shared_resources` - Resources shared between message processing calls
pub fn handler_fn<RFn, Fut, TShared>(rv_fn: RFn, shared_resources: TShared) -> FnMessageHandler<RFn, Fut, TShared>
where
    RFn: Fn(Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    FnMessageHandler::new(rv_fn, shared_resources)
}
