// Event Bus
//
// Typed publish-subscribe between tasks and their observers. A bus instance is
// created once by the application and handed to every component that publishes
// or listens; there is no global registry.

pub mod bus;
pub mod observer;
pub mod types;

pub use bus::EventBus;
pub use observer::attach_log_observer;
pub use types::{AnyValue, Category, Channel, Envelope, Filter, ListenerControl, ListenerToken, Payload};
