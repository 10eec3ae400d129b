//! Capabilities a task may expose. A concrete task implements exactly the
//! subset it supports; shared delivery logic lives in [`super::dispatch`].

use async_trait::async_trait;

use super::TaskIdentity;
use crate::event_bus::EventBus;
use crate::sequence::AsyncEventSequence;

pub trait Identifiable {
    type Request: Send + Sync + 'static;

    fn identity(&self) -> &TaskIdentity<Self::Request>;

    /// Bus the task publishes on.
    fn bus(&self) -> &EventBus;

    /// True once the task published its result envelope or is about to.
    fn is_terminated(&self) -> bool;
}

#[async_trait]
pub trait ResultProducing: Identifiable {
    type Success: Clone + Send + Sync + 'static;
    type Failure: Clone + Send + Sync + 'static;

    /// Wait for the terminal outcome. May be awaited any number of times.
    async fn result(&self) -> Result<Self::Success, Self::Failure>;

    /// The terminal outcome, if the task already ended.
    fn outcome(&self) -> Option<Result<Self::Success, Self::Failure>>;

    /// Wait for the terminal outcome, consuming the handle.
    async fn value(self) -> Result<Self::Success, Self::Failure>
    where
        Self: Sized + Send + Sync,
    {
        self.result().await
    }
}

pub trait StreamProducing: Identifiable {
    /// Element of the sequence, also published as in-process envelopes.
    type Element: Send + Sync + 'static;
    type StreamError: Send + Sync + 'static;

    /// Take the task's sequence. It has a single consumer, so only the first
    /// call returns it.
    fn sequence(&self) -> Option<AsyncEventSequence<Self::Element, Self::StreamError>>;
}

pub trait Cancellable {
    /// Request cancellation. Idempotent.
    fn cancel(&self);
}
