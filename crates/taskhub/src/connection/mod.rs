//! Connection collaborator contract.
//!
//! The lifecycle never talks to a socket directly. It asks a
//! [`ConnectionFactory`] for a (possibly shared) [`Connection`] to an
//! endpoint, registers a subscription with an [`EventHandler`], and later
//! unsubscribes with the returned [`SubscriptionHandle`]. Pooling and
//! synchronization of the shared connection belong to the factory.

mod loopback;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use taskhub_protocol::{AuthMode, TransportEvent};
use uuid::Uuid;

use crate::config::EndpointConfig;

pub use loopback::{LoopbackConnection, LoopbackConnectionFactory};

/// Resolved authorization for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthContext {
    pub mode: AuthMode,
    pub api_key: Option<String>,
}

impl AuthContext {
    pub fn none() -> Self {
        Self {
            mode: AuthMode::None,
            api_key: None,
        }
    }
}

/// Callback a connection invokes for every event of one subscription.
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Identifies one subscription registered on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: String,
}

impl SubscriptionHandle {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A live logical connection able to carry many subscriptions.
pub trait Connection: Send + Sync {
    /// Register a subscription. Events for it are delivered to `handler`.
    fn subscribe(&self, document: &str, variables: Option<&Value>, handler: EventHandler) -> SubscriptionHandle;

    /// Remove a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Creates or reuses connections per endpoint and auth context.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn get_or_create_connection(
        &self,
        endpoint: &EndpointConfig,
        auth: &AuthContext,
    ) -> Result<Arc<dyn Connection>, ConnectionError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unable to get connection for api {endpoint}: {message}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub message: String,
}

impl ConnectionError {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}
