//! GraphQL subscription lifecycle.
//!
//! `Created -> Validating -> AcquiringConnection -> Connected -> Terminated`.
//! No state is re-entered, and `Terminated` is reached exactly once: on a
//! server disconnect, a decode failure, a transport failure, a validation or
//! configuration failure, a connection failure, or a cancel.

mod lifecycle;

use taskhub_protocol::SubscriptionEvent;

use crate::error::ApiError;
use crate::sequence::AsyncEventSequence;

pub use lifecycle::SubscriptionTask;

/// The consumer's view of a subscription.
pub type SubscriptionSequence<T> = AsyncEventSequence<SubscriptionEvent<T>, ApiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Validating,
    AcquiringConnection,
    Connected,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Validating => "validating",
            LifecycleState::AcquiringConnection => "acquiring_connection",
            LifecycleState::Connected => "connected",
            LifecycleState::Terminated => "terminated",
        }
    }
}
