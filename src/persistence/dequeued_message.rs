use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use crate::messaging::body::MessageBody;

pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A storage operation that is prepared when a record is read, and executed once the consumer
///  decides what happens to the record.
pub type DeferredAction = Box<dyn FnOnce() -> ActionFuture + Send>;

/// Wraps an async closure as a [DeferredAction]
pub fn deferred<F, Fut>(f: F) -> DeferredAction
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()) as ActionFuture)
}


/// A record that was read from a queue but is not yet removed from it: the consumer must call
///  either [DequeuedMessage::complete] or [DequeuedMessage::abort] exactly once, which is
///  enforced by both consuming `self`.
///
/// Dropping a dequeued message without completing or aborting it leaves the record's storage
///  in an unspecified state until the queue is reopened.
pub struct DequeuedMessage {
    body: MessageBody,
    completion_actions: Vec<DeferredAction>,
    abort_actions: Vec<DeferredAction>,
}

impl Debug for DequeuedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DequeuedMessage")
            .field("body", &self.body)
            .finish()
    }
}

impl DequeuedMessage {
    pub fn new(body: MessageBody, completion: DeferredAction, abort: DeferredAction) -> DequeuedMessage {
        DequeuedMessage {
            body,
            completion_actions: vec![completion],
            abort_actions: vec![abort],
        }
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Registers an additional action to run after the record was successfully completed.
    pub fn enlist_completion(&mut self, action: DeferredAction) {
        self.completion_actions.push(action);
    }

    /// Registers an additional action to run when the record is aborted, after the actions
    ///  registered so far.
    pub fn enlist_abort(&mut self, action: DeferredAction) {
        self.abort_actions.push(action);
    }

    /// Marks the record as consumed. Actions run in registration order, and the first failure
    ///  is returned without running the remaining actions.
    pub async fn complete(self) -> anyhow::Result<()> {
        for action in self.completion_actions {
            action().await?;
        }
        Ok(())
    }

    /// Returns the record to the queue so that it is read again. All abort actions run even if
    ///  some of them fail; failures are logged.
    pub async fn abort(self) {
        for action in self.abort_actions {
            if let Err(e) = action().await {
                warn!("error aborting dequeued message: {}", e);
            }
        }
    }
}
