pub mod client;
pub mod config;
pub mod connection;
pub mod decode;
pub mod error;
pub mod event_bus;
pub mod request;
pub mod sequence;
pub mod subscription;
pub mod task;

pub use client::{ApiClient, GraphQLOperation, GraphQLTransport, SubscriptionListeners};
pub use config::{EndpointConfig, Settings};
pub use error::ApiError;
pub use event_bus::{Category, Channel, EventBus};
pub use request::{GraphQLRequest, RequestOptions};
pub use sequence::AsyncEventSequence;
pub use subscription::{LifecycleState, SubscriptionSequence, SubscriptionTask};
pub use task::{Cancellable, Identifiable, ResultProducing, StreamProducing, TaskId};

pub use taskhub_protocol as protocol;
