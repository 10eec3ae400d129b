//! In-memory transport.
//!
//! [`LoopbackConnectionFactory`] pools one [`LoopbackConnection`] per endpoint
//! and auth mode. Nothing leaves the process: whoever holds the connection
//! pushes [`TransportEvent`]s to its subscribers with [`LoopbackConnection::emit`].
//! The replay binary and the integration tests drive subscriptions this way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use taskhub_protocol::{AuthMode, TransportEvent};
use tokio::sync::{Notify, RwLock};

use super::{AuthContext, Connection, ConnectionError, ConnectionFactory, EventHandler, SubscriptionHandle};
use crate::config::EndpointConfig;

type PoolKey = (String, AuthMode);

#[derive(Clone, Default)]
pub struct LoopbackConnectionFactory {
    /// (endpoint name, auth mode) -> shared connection
    connections: Arc<RwLock<HashMap<PoolKey, Arc<LoopbackConnection>>>>,
    /// When set, every acquisition fails with this message
    refusal: Arc<Mutex<Option<String>>>,
}

impl LoopbackConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent acquisition fail.
    pub fn refuse_connections(&self, message: impl Into<String>) {
        if let Ok(mut refusal) = self.refusal.lock() {
            *refusal = Some(message.into());
        }
    }

    /// The pooled connection for an endpoint, if one was created.
    pub async fn connection(&self, endpoint: &str, mode: AuthMode) -> Option<Arc<LoopbackConnection>> {
        self.connections
            .read()
            .await
            .get(&(endpoint.to_string(), mode))
            .cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackConnectionFactory {
    async fn get_or_create_connection(
        &self,
        endpoint: &EndpointConfig,
        auth: &AuthContext,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        let refusal = self.refusal.lock().ok().and_then(|r| r.clone());
        if let Some(message) = refusal {
            tracing::warn!(endpoint = %endpoint.name, error = %message, "loopback connection refused");
            return Err(ConnectionError::new(&endpoint.name, message));
        }

        let key = (endpoint.name.clone(), auth.mode);
        let mut connections = self.connections.write().await;
        let connection = connections
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(
                    endpoint = %endpoint.name,
                    auth_mode = auth.mode.as_str(),
                    "creating loopback connection"
                );
                Arc::new(LoopbackConnection::new(endpoint.name.clone()))
            })
            .clone();

        Ok(connection)
    }
}

struct LoopbackSubscription {
    document: String,
    handler: EventHandler,
}

/// One shared in-memory connection.
pub struct LoopbackConnection {
    endpoint: String,
    subscriptions: Mutex<HashMap<SubscriptionHandle, LoopbackSubscription>>,
    subscribed: Notify,
}

impl LoopbackConnection {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            subscriptions: Mutex::new(HashMap::new()),
            subscribed: Notify::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Documents of all live subscriptions.
    pub fn documents(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.values().map(|sub| sub.document.clone()).collect())
            .unwrap_or_default()
    }

    /// Wait until at least `count` subscriptions are registered.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        loop {
            let notified = self.subscribed.notified();
            if self.subscription_count() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Deliver an event to every live subscription.
    pub fn emit(&self, event: TransportEvent) {
        let handlers: Vec<EventHandler> = match self.subscriptions.lock() {
            Ok(subs) => subs.values().map(|s| s.handler.clone()).collect(),
            Err(_) => return,
        };
        // Handlers run outside the lock so they may unsubscribe.
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Deliver an event to one subscription; returns false if it is gone.
    pub fn emit_to(&self, handle: &SubscriptionHandle, event: TransportEvent) -> bool {
        let handler = match self.subscriptions.lock() {
            Ok(subs) => subs.get(handle).map(|s| s.handler.clone()),
            Err(_) => None,
        };
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}

impl Connection for LoopbackConnection {
    fn subscribe(&self, document: &str, _variables: Option<&Value>, handler: EventHandler) -> SubscriptionHandle {
        let handle = SubscriptionHandle::generate();
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(
                handle.clone(),
                LoopbackSubscription {
                    document: document.to_string(),
                    handler,
                },
            );
        }
        tracing::debug!(endpoint = %self.endpoint, subscription = %handle, "loopback subscription added");
        self.subscribed.notify_waiters();
        handle
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self
            .subscriptions
            .lock()
            .map(|mut subs| subs.remove(handle).is_some())
            .unwrap_or(false);
        if removed {
            tracing::debug!(endpoint = %self.endpoint, subscription = %handle, "loopback subscription removed");
        }
    }
}
