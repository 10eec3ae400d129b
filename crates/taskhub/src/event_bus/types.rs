use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::task::TaskId;

/// Type-erased value carried by an envelope.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

// ============================================================================
// Channels
// ============================================================================

/// Category a task belongs to. Each category maps to one bus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Api,
    Auth,
    Hub,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Api => "API",
            Category::Auth => "Auth",
            Category::Hub => "Hub",
        }
    }
}

/// Coarse routing key on the bus; many tasks share one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel(String);

impl Channel {
    pub fn custom(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Category> for Channel {
    fn from(category: Category) -> Self {
        Self(category.as_str().to_string())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Payload of one envelope: a terminal result or an in-process value, never both.
#[derive(Clone)]
pub enum Payload {
    InProcess(AnyValue),
    Result(AnyValue),
}

impl Payload {
    pub fn in_process<I: Send + Sync + 'static>(value: I) -> Self {
        Payload::InProcess(Arc::new(value))
    }

    pub fn result<S, E>(outcome: Result<S, E>) -> Self
    where
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Payload::Result(Arc::new(outcome))
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Payload::Result(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::InProcess(_) => "in_process",
            Payload::Result(_) => "result",
        }
    }
}

/// Unit exchanged on the event bus.
#[derive(Clone)]
pub struct Envelope {
    /// Bus-assigned monotonic sequence number, set at delivery
    pub cursor: u64,

    /// Time the envelope was created
    pub time: DateTime<Utc>,

    /// Event name, `<Category>.<action>`
    pub event_name: String,

    /// Task that produced the envelope
    pub task_id: TaskId,

    /// Snapshot of the originating request
    pub request: AnyValue,

    pub payload: Payload,
}

impl Envelope {
    pub fn new(event_name: impl Into<String>, task_id: TaskId, request: AnyValue, payload: Payload) -> Self {
        Self {
            cursor: 0,
            time: Utc::now(),
            event_name: event_name.into(),
            task_id,
            request,
            payload,
        }
    }

    /// The request snapshot, if it is an `R`.
    pub fn request<R: 'static>(&self) -> Option<&R> {
        self.request.downcast_ref::<R>()
    }

    /// The in-process value, if this envelope carries an `I`.
    pub fn in_process<I: 'static>(&self) -> Option<&I> {
        match &self.payload {
            Payload::InProcess(value) => value.downcast_ref::<I>(),
            Payload::Result(_) => None,
        }
    }

    /// The terminal outcome, if this envelope carries a `Result<S, E>`.
    pub fn result<S: 'static, E: 'static>(&self) -> Option<&Result<S, E>> {
        match &self.payload {
            Payload::Result(value) => value.downcast_ref::<Result<S, E>>(),
            Payload::InProcess(_) => None,
        }
    }

    pub fn is_result(&self) -> bool {
        self.payload.is_result()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("cursor", &self.cursor)
            .field("time", &self.time)
            .field("event_name", &self.event_name)
            .field("task_id", &self.task_id)
            .field("payload", &self.payload.kind())
            .finish()
    }
}

// ============================================================================
// Filters & tokens
// ============================================================================

/// Predicate scoping a listener to a subset of a channel's envelopes.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&Envelope) -> bool + Send + Sync>);

impl Filter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Matches envelopes produced by one task.
    pub fn task(task_id: TaskId) -> Self {
        Self::new(move |envelope| envelope.task_id == task_id)
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        (self.0)(envelope)
    }
}

/// Handle returned by `listen`, required to remove the listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    pub(crate) channel: Channel,
    pub(crate) id: u64,
}

impl ListenerToken {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

/// Returned by self-removing listeners after each invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Keep,
    Remove,
}
