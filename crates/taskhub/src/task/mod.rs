// Task framework
//
// A task is one asynchronous unit of work with a stable identity. It can be
// observed through its result, its event sequence, the event bus, or any mix
// of them, and it can be cancelled. Concrete tasks implement the capability
// traits they support; delivery logic is shared through free functions.

pub mod capability;
pub mod dispatch;
pub mod identity;
pub mod operation;

pub use capability::{Cancellable, Identifiable, ResultProducing, StreamProducing};
pub use dispatch::{dispatch_in_process, dispatch_result, subscribe_in_process, subscribe_result, unsubscribe};
pub use identity::{TaskId, TaskIdentity};
pub use operation::{Operation, Progress};
