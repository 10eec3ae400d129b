//! API category facade.
//!
//! [`ApiClient`] turns requests into tasks: one-shot queries and mutations
//! become [`Operation`]s, subscriptions become [`SubscriptionTask`]s. All of
//! them publish on the client's event bus.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use taskhub_protocol::{EndpointType, EventName, GraphQLResponse, SubscriptionEvent, TransportError};
use tokio_util::sync::CancellationToken;

use crate::config::{EndpointConfig, Settings};
use crate::connection::{AuthContext, ConnectionFactory};
use crate::decode::{JsonResponseDecoder, ResponseDecoder};
use crate::error::ApiError;
use crate::event_bus::{Category, EventBus};
use crate::request::GraphQLRequest;
use crate::subscription::SubscriptionTask;
use crate::task::{subscribe_in_process, subscribe_result, Operation, TaskIdentity};

/// Executes one-shot GraphQL requests.
#[async_trait]
pub trait GraphQLTransport: Send + Sync {
    /// Send `document` to `endpoint` and return the raw response body.
    async fn execute(
        &self,
        endpoint: &EndpointConfig,
        auth: &AuthContext,
        document: &str,
        variables: Option<&Value>,
    ) -> Result<Vec<u8>, TransportError>;
}

/// A query or mutation in flight.
pub type GraphQLOperation<T> = Operation<GraphQLRequest<T>, GraphQLResponse<T>, (), ApiError>;

pub type ResultListener<S> = Box<dyn FnOnce(Result<S, ApiError>) + Send>;

/// Listeners attached to a subscription before it starts.
pub struct SubscriptionListeners<T> {
    value: Option<Box<dyn Fn(&SubscriptionEvent<T>) + Send + Sync>>,
    completion: Option<ResultListener<()>>,
}

impl<T> Default for SubscriptionListeners<T> {
    fn default() -> Self {
        Self {
            value: None,
            completion: None,
        }
    }
}

impl<T> SubscriptionListeners<T> {
    /// Called for every connection and data event.
    pub fn on_value<F>(mut self, listener: F) -> Self
    where
        F: Fn(&SubscriptionEvent<T>) + Send + Sync + 'static,
    {
        self.value = Some(Box::new(listener));
        self
    }

    /// Called once when the subscription terminates.
    pub fn on_completion<F>(mut self, listener: F) -> Self
    where
        F: FnOnce(Result<(), ApiError>) + Send + 'static,
    {
        self.completion = Some(Box::new(listener));
        self
    }
}

#[derive(Clone)]
pub struct ApiClient {
    bus: EventBus,
    settings: Arc<Settings>,
    connections: Arc<dyn ConnectionFactory>,
    transport: Option<Arc<dyn GraphQLTransport>>,
    shutdown: CancellationToken,
}

impl ApiClient {
    pub fn new(bus: EventBus, settings: Settings, connections: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            bus,
            settings: Arc::new(settings),
            connections,
            transport: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn GraphQLTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn query<T>(&self, request: GraphQLRequest<T>) -> GraphQLOperation<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.operation(EventName::API_QUERY, request, None)
    }

    pub fn query_with_listener<T, F>(&self, request: GraphQLRequest<T>, listener: F) -> GraphQLOperation<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce(Result<GraphQLResponse<T>, ApiError>) + Send + 'static,
    {
        self.operation(EventName::API_QUERY, request, Some(Box::new(listener)))
    }

    pub fn mutate<T>(&self, request: GraphQLRequest<T>) -> GraphQLOperation<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.operation(EventName::API_MUTATE, request, None)
    }

    pub fn mutate_with_listener<T, F>(&self, request: GraphQLRequest<T>, listener: F) -> GraphQLOperation<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce(Result<GraphQLResponse<T>, ApiError>) + Send + 'static,
    {
        self.operation(EventName::API_MUTATE, request, Some(Box::new(listener)))
    }

    /// Start a subscription.
    pub fn subscribe<T>(&self, request: GraphQLRequest<T>) -> SubscriptionTask<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.subscribe_with(request, SubscriptionListeners::default())
    }

    /// Start a subscription with listeners registered before any event can fire.
    pub fn subscribe_with<T>(&self, request: GraphQLRequest<T>, listeners: SubscriptionListeners<T>) -> SubscriptionTask<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let task = SubscriptionTask::new(self.bus.clone(), self.settings.clone(), self.connections.clone(), request);

        if let Some(listener) = listeners.value {
            subscribe_in_process(&task, move |event: &SubscriptionEvent<T>| listener(event));
        }
        if let Some(listener) = listeners.completion {
            subscribe_result(&task, listener);
        }

        task.start(self.shutdown.child_token());
        task
    }

    /// Cancel every subscription and operation started by this client.
    pub fn shutdown(&self) {
        tracing::info!("api client shutting down");
        self.shutdown.cancel();
    }

    fn operation<T>(
        &self,
        event_name: &'static str,
        request: GraphQLRequest<T>,
        listener: Option<ResultListener<GraphQLResponse<T>>>,
    ) -> GraphQLOperation<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let identity = TaskIdentity::new(Category::Api, event_name, request);
        let request = identity.request().clone();
        let operation = Operation::new(self.bus.clone(), identity);
        if let Some(listener) = listener {
            subscribe_result(&operation, listener);
        }

        let settings = self.settings.clone();
        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();
        operation.start(move |_progress, _token| async move {
            tokio::select! {
                _ = shutdown.cancelled() => Err(ApiError::Cancelled),
                result = execute(&settings, transport.as_deref(), &*request) => result,
            }
        });
        operation
    }
}

async fn execute<T>(
    settings: &Settings,
    transport: Option<&dyn GraphQLTransport>,
    request: &GraphQLRequest<T>,
) -> Result<GraphQLResponse<T>, ApiError>
where
    T: DeserializeOwned,
{
    request.validate()?;
    let endpoint = settings.endpoint(request.api_name.as_deref(), EndpointType::GraphQL)?;
    let auth = endpoint.auth_context(request.options.auth_mode)?;
    let transport = transport.ok_or_else(|| ApiError::configuration("no GraphQL transport configured"))?;

    let raw = transport
        .execute(endpoint, &auth, &request.document, request.variables.as_ref())
        .await
        .map_err(|e| ApiError::from_transport("request failed with error", e))?;

    let decoder: &dyn ResponseDecoder<T> = &JsonResponseDecoder;
    Ok(decoder.decode(&raw, request)?)
}
