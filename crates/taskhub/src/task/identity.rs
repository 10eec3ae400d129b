use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_bus::{Category, Channel, Envelope, Filter, Payload};

/// Unique task identifier, the correlation key between a task and its observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable identity shared by every view of one task.
pub struct TaskIdentity<R> {
    id: TaskId,
    request: Arc<R>,
    category: Category,
    event_name: String,
}

impl<R> Clone for TaskIdentity<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            request: self.request.clone(),
            category: self.category,
            event_name: self.event_name.clone(),
        }
    }
}

impl<R: Send + Sync + 'static> TaskIdentity<R> {
    pub fn new(category: Category, event_name: impl Into<String>, request: R) -> Self {
        Self {
            id: TaskId::new(),
            request: Arc::new(request),
            category,
            event_name: event_name.into(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn request(&self) -> &Arc<R> {
        &self.request
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn channel(&self) -> Channel {
        self.category.into()
    }

    /// Filter matching only this task's envelopes.
    pub fn filter(&self) -> Filter {
        Filter::task(self.id)
    }

    pub fn envelope(&self, payload: Payload) -> Envelope {
        Envelope::new(self.event_name.clone(), self.id, self.request.clone(), payload)
    }
}

impl<R> fmt::Debug for TaskIdentity<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskIdentity")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("event_name", &self.event_name)
            .finish()
    }
}
