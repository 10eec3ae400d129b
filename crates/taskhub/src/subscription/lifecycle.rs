use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use taskhub_protocol::{ConnectionState, EndpointType, EventName, SubscriptionEvent, TransportEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LifecycleState, SubscriptionSequence};
use crate::config::Settings;
use crate::connection::{Connection, ConnectionFactory, EventHandler, SubscriptionHandle};
use crate::decode::{JsonResponseDecoder, ResponseDecoder};
use crate::error::ApiError;
use crate::event_bus::{Category, EventBus};
use crate::request::GraphQLRequest;
use crate::sequence::{AsyncEventSequence, SequenceSender};
use crate::task::dispatch::{publish_in_process, publish_result};
use crate::task::{Cancellable, Identifiable, ResultProducing, StreamProducing, TaskIdentity};

/// Connection side of the lifecycle. Connect and teardown both run under
/// this lock so a cancel can never land between acquiring the connection
/// and registering the subscription.
#[derive(Default)]
struct Lane {
    connection: Option<Arc<dyn Connection>>,
    handle: Option<SubscriptionHandle>,
}

/// Consumer side of the lifecycle. Every emission and state change happens
/// under this lock. Lock order: lane, then emitter.
struct Emitter<T> {
    state: LifecycleState,
    sender: SequenceSender<SubscriptionEvent<T>, ApiError>,
}

struct Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    identity: TaskIdentity<GraphQLRequest<T>>,
    bus: EventBus,
    settings: Arc<Settings>,
    connections: Arc<dyn ConnectionFactory>,
    decoder: Arc<dyn ResponseDecoder<T>>,
    /// Cancelled once the lifecycle is over, or by the sequence's consumer
    token: CancellationToken,
    lane: Mutex<Lane>,
    emitter: Mutex<Emitter<T>>,
    sequence: Mutex<Option<SubscriptionSequence<T>>>,
    outcome: watch::Sender<Option<Result<(), ApiError>>>,
}

/// One GraphQL subscription: validates the request, acquires a shared
/// connection, streams decoded events, and tears down exactly once.
///
/// Events reach the consumer through [`StreamProducing::sequence`] and are
/// published on the `API` channel as `API.subscribe` envelopes. The terminal
/// result is `Ok(())` for a disconnect or a cancel and `Err` for a failure.
/// Dropping the last handle cancels the subscription.
pub struct SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a subscription decoding payloads with [`JsonResponseDecoder`].
    pub fn new(
        bus: EventBus,
        settings: Arc<Settings>,
        connections: Arc<dyn ConnectionFactory>,
        request: GraphQLRequest<T>,
    ) -> Self
    where
        T: DeserializeOwned,
    {
        Self::with_decoder(bus, settings, connections, Arc::new(JsonResponseDecoder), request)
    }

    pub fn with_decoder(
        bus: EventBus,
        settings: Arc<Settings>,
        connections: Arc<dyn ConnectionFactory>,
        decoder: Arc<dyn ResponseDecoder<T>>,
        request: GraphQLRequest<T>,
    ) -> Self {
        let token = CancellationToken::new();
        let (sender, sequence) = AsyncEventSequence::channel(token.clone());
        let (outcome, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                identity: TaskIdentity::new(Category::Api, EventName::API_SUBSCRIBE, request),
                bus,
                settings,
                connections,
                decoder,
                token,
                lane: Mutex::new(Lane::default()),
                emitter: Mutex::new(Emitter {
                    state: LifecycleState::Created,
                    sender,
                }),
                sequence: Mutex::new(Some(sequence)),
                outcome,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// Spawn [`run`](Self::run) on the Tokio runtime.
    pub fn start(&self, parent: CancellationToken) -> JoinHandle<()> {
        let task = self.clone();
        tokio::spawn(async move { task.run(parent).await })
    }

    /// Validate, resolve the endpoint, acquire a connection and subscribe.
    ///
    /// Returns once the subscription is registered or the lifecycle ended.
    /// Cancelling `parent` at any point cancels the subscription.
    pub async fn run(&self, parent: CancellationToken) {
        let inner = &self.inner;
        let task_id = inner.identity.id();

        if parent.is_cancelled() || inner.token.is_cancelled() {
            tracing::debug!(task_id = %task_id, "subscription cancelled before start");
            inner.cancel();
            return;
        }
        if !inner.advance(LifecycleState::Created, LifecycleState::Validating) {
            tracing::warn!(task_id = %task_id, state = ?inner.state(), "subscription already started");
            return;
        }
        inner.watch_cancellation(parent);

        let request = inner.identity.request().clone();
        if let Err(error) = request.validate() {
            inner.fail(error);
            return;
        }

        let resolved = inner
            .settings
            .endpoint(request.api_name.as_deref(), EndpointType::GraphQL)
            .and_then(|endpoint| {
                let auth = endpoint.auth_context(request.options.auth_mode)?;
                Ok((endpoint.clone(), auth))
            });
        let (endpoint, auth) = match resolved {
            Ok(resolved) => resolved,
            Err(error) => {
                inner.fail(error);
                return;
            }
        };
        if !inner.advance(LifecycleState::Validating, LifecycleState::AcquiringConnection) {
            return;
        }

        tracing::debug!(
            task_id = %task_id,
            endpoint = %endpoint.name,
            auth_mode = auth.mode.as_str(),
            "acquiring connection"
        );
        let connection = match inner.connections.get_or_create_connection(&endpoint, &auth).await {
            Ok(connection) => connection,
            Err(e) => {
                inner.fail(ApiError::connection(e.to_string(), e));
                return;
            }
        };

        inner.connect(connection, &request);
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn state(&self) -> LifecycleState {
        self.emitter
            .lock()
            .map(|emitter| emitter.state)
            .unwrap_or(LifecycleState::Terminated)
    }

    fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let Ok(mut emitter) = self.emitter.lock() else {
            return false;
        };
        if emitter.state != from {
            return false;
        }
        tracing::debug!(task_id = %self.identity.id(), from = ?from, to = ?to, "subscription state changed");
        emitter.state = to;
        true
    }

    fn watch_cancellation(self: &Arc<Self>, parent: CancellationToken) {
        let weak = Arc::downgrade(self);
        let internal = self.token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {}
                _ = internal.cancelled() => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.cancel();
            }
        });
    }

    fn connect(self: &Arc<Self>, connection: Arc<dyn Connection>, request: &GraphQLRequest<T>) {
        let Ok(mut lane) = self.lane.lock() else {
            return;
        };
        if !self.advance(LifecycleState::AcquiringConnection, LifecycleState::Connected) {
            tracing::debug!(task_id = %self.identity.id(), "cancelled while acquiring connection");
            return;
        }

        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        });
        let handle = connection.subscribe(&request.document, request.variables.as_ref(), handler);

        // The connection may have ended the subscription while registering it.
        if self.state() == LifecycleState::Terminated {
            connection.unsubscribe(&handle);
            return;
        }

        tracing::info!(task_id = %self.identity.id(), subscription = %handle, "subscription registered");
        lane.connection = Some(connection);
        lane.handle = Some(handle);
    }

    fn handle_event(&self, event: TransportEvent) {
        let Ok(mut emitter) = self.emitter.lock() else {
            return;
        };
        if emitter.state != LifecycleState::Connected {
            tracing::trace!(task_id = %self.identity.id(), state = ?emitter.state, "transport event dropped");
            return;
        }

        match event {
            TransportEvent::Connection(ConnectionState::Disconnected) => {
                self.emit(&emitter, SubscriptionEvent::Connection(ConnectionState::Disconnected));
                self.terminate(&mut emitter, None);
            }
            TransportEvent::Connection(state) => {
                self.emit(&emitter, SubscriptionEvent::Connection(state));
            }
            TransportEvent::Data(raw) => match self.decoder.decode(&raw, self.identity.request()) {
                Ok(response) => self.emit(&emitter, SubscriptionEvent::Data(response)),
                Err(e) => self.terminate(&mut emitter, Some(e.into())),
            },
            TransportEvent::Failed(error) => {
                self.terminate(&mut emitter, Some(ApiError::from(error)));
            }
        }
    }

    fn emit(&self, emitter: &Emitter<T>, event: SubscriptionEvent<T>) {
        emitter.sender.send(event.clone());
        publish_in_process(&self.bus, &self.identity, event);
    }

    fn fail(&self, error: ApiError) {
        if let Ok(mut emitter) = self.emitter.lock() {
            self.terminate(&mut emitter, Some(error));
        }
    }

    /// Single exit point: ends the sequence, records and publishes the result.
    fn terminate(&self, emitter: &mut Emitter<T>, failure: Option<ApiError>) {
        if emitter.state == LifecycleState::Terminated {
            return;
        }
        let from = emitter.state;
        emitter.state = LifecycleState::Terminated;

        let outcome = match failure {
            Some(error) => {
                tracing::warn!(
                    task_id = %self.identity.id(),
                    state = ?from,
                    kind = error.as_label(),
                    error = %error,
                    "subscription failed"
                );
                emitter.sender.fail(error.clone());
                Err(error)
            }
            None => {
                tracing::info!(task_id = %self.identity.id(), state = ?from, "subscription finished");
                emitter.sender.finish();
                Ok(())
            }
        };

        self.outcome.send_replace(Some(outcome.clone()));
        publish_result(&self.bus, &self.identity, outcome);
        self.token.cancel();
    }

    fn cancel(&self) {
        let Ok(mut lane) = self.lane.lock() else {
            return;
        };
        if self.state() == LifecycleState::Terminated {
            return;
        }

        // Unsubscribe without the emitter lock: the connection may deliver a
        // final event synchronously.
        let subscribed = match (lane.connection.take(), lane.handle.take()) {
            (Some(connection), Some(handle)) => {
                connection.unsubscribe(&handle);
                true
            }
            _ => false,
        };

        let Ok(mut emitter) = self.emitter.lock() else {
            return;
        };
        if emitter.state == LifecycleState::Terminated {
            return;
        }
        tracing::info!(task_id = %self.identity.id(), state = ?emitter.state, "subscription cancelled");
        if subscribed {
            self.emit(&emitter, SubscriptionEvent::Connection(ConnectionState::Disconnected));
        }
        self.terminate(&mut emitter, None);
    }
}

impl<T> Drop for Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cancel();
        if let Ok(lane) = self.lane.get_mut() {
            if let (Some(connection), Some(handle)) = (lane.connection.take(), lane.handle.take()) {
                connection.unsubscribe(&handle);
            }
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

impl<T> Identifiable for SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Request = GraphQLRequest<T>;

    fn identity(&self) -> &TaskIdentity<GraphQLRequest<T>> {
        &self.inner.identity
    }

    fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn is_terminated(&self) -> bool {
        self.inner.state() == LifecycleState::Terminated
    }
}

#[async_trait]
impl<T> ResultProducing for SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Success = ();
    type Failure = ApiError;

    async fn result(&self) -> Result<(), ApiError> {
        let mut outcome = self.inner.outcome.subscribe();
        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(ready) => ready.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or(Err(ApiError::Cancelled))
    }

    fn outcome(&self) -> Option<Result<(), ApiError>> {
        self.inner.outcome.borrow().clone()
    }
}

impl<T> StreamProducing for SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Element = SubscriptionEvent<T>;
    type StreamError = ApiError;

    fn sequence(&self) -> Option<SubscriptionSequence<T>> {
        self.inner.sequence.lock().ok().and_then(|mut s| s.take())
    }
}

impl<T> Cancellable for SubscriptionTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn cancel(&self) {
        self.inner.cancel();
    }
}
