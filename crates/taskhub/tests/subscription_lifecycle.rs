//! End-to-end subscription lifecycle tests against the loopback transport.
//!
//! Covers:
//! - Happy path ordering of connection and data events
//! - Decode, server and unauthorized failures
//! - Cancellation by the caller, the client and the server
//! - Cancellation racing connection acquisition
//! - Listener cleanup on the event bus

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

use taskhub::connection::{
    AuthContext, Connection, ConnectionError, ConnectionFactory, LoopbackConnection, LoopbackConnectionFactory,
};
use taskhub::protocol::{
    AuthMode, ConnectionState, EndpointType, GraphQLResponseError, SubscriptionEvent, TransportError, TransportEvent,
};
use taskhub::{
    ApiClient, ApiError, Cancellable, Category, EndpointConfig, EventBus, GraphQLRequest, LifecycleState,
    ResultProducing, Settings, StreamProducing, SubscriptionListeners, SubscriptionSequence, SubscriptionTask,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Message {
    id: String,
    content: String,
}

type Item = Result<SubscriptionEvent<Message>, ApiError>;

const DOCUMENT: &str = "subscription OnCreateMessage { onCreateMessage { id content } }";

struct Harness {
    client: ApiClient,
    bus: EventBus,
    factory: Arc<LoopbackConnectionFactory>,
    connection: Arc<LoopbackConnection>,
}

async fn harness() -> Harness {
    let endpoint = EndpointConfig::graphql("chat", "wss://chat.example.com/graphql/realtime");
    let settings = Settings::default().with_endpoint(endpoint.clone());
    let factory = Arc::new(LoopbackConnectionFactory::new());

    // Pool the connection up front so tests can drive it.
    let auth = endpoint.auth_context(None).unwrap();
    factory.get_or_create_connection(&endpoint, &auth).await.unwrap();
    let connection = factory.connection("chat", AuthMode::None).await.unwrap();

    let bus = EventBus::new();
    let client = ApiClient::new(bus.clone(), settings, factory.clone());
    Harness {
        client,
        bus,
        factory,
        connection,
    }
}

fn request() -> GraphQLRequest<Message> {
    GraphQLRequest::new(DOCUMENT).with_decode_path("onCreateMessage")
}

fn payload(id: &str, content: &str) -> TransportEvent {
    let body = json!({ "data": { "onCreateMessage": { "id": id, "content": content } } });
    TransportEvent::Data(serde_json::to_vec(&body).unwrap())
}

fn message(id: &str, content: &str) -> SubscriptionEvent<Message> {
    SubscriptionEvent::Data(Ok(Message {
        id: id.to_string(),
        content: content.to_string(),
    }))
}

async fn subscribed(
    harness: &Harness,
    listeners: SubscriptionListeners<Message>,
) -> (SubscriptionTask<Message>, SubscriptionSequence<Message>) {
    let expected = harness.connection.subscription_count() + 1;
    let task = harness.client.subscribe_with(request(), listeners);
    let sequence = task.sequence().expect("sequence already taken");
    timeout(Duration::from_secs(1), harness.connection.wait_for_subscriptions(expected))
        .await
        .expect("subscription was never registered");
    assert_eq!(task.state(), LifecycleState::Connected);
    (task, sequence)
}

async fn next(sequence: &mut SubscriptionSequence<Message>) -> Option<Item> {
    timeout(Duration::from_secs(1), sequence.next())
        .await
        .expect("timed out waiting for the next event")
}

async fn rest(sequence: SubscriptionSequence<Message>) -> Vec<Item> {
    timeout(Duration::from_secs(1), sequence.collect::<Vec<_>>())
        .await
        .expect("sequence never ended")
}

#[tokio::test]
async fn test_happy_path_preserves_order() {
    let harness = harness().await;
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let listeners = SubscriptionListeners::<Message>::default().on_value(move |event| sink.lock().unwrap().push(event.clone()));
    let (task, mut sequence) = subscribed(&harness, listeners).await;

    harness.connection.emit(TransportEvent::Connection(ConnectionState::Connecting));
    harness.connection.emit(TransportEvent::Connection(ConnectionState::Connected));
    harness.connection.emit(payload("1", "A"));
    harness.connection.emit(payload("2", "B"));

    let expected = vec![
        SubscriptionEvent::Connection(ConnectionState::Connecting),
        SubscriptionEvent::Connection(ConnectionState::Connected),
        message("1", "A"),
        message("2", "B"),
    ];
    for event in &expected {
        assert_eq!(next(&mut sequence).await.unwrap().unwrap(), *event);
    }

    harness.bus.flush().await;
    assert_eq!(*observed.lock().unwrap(), expected);
    task.cancel();
}

#[tokio::test]
async fn test_decode_failure_ends_subscription() {
    let harness = harness().await;
    let (task, mut sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    harness.connection.emit(TransportEvent::Connection(ConnectionState::Connected));
    harness.connection.emit(TransportEvent::Data(b"{not json".to_vec()));
    harness.connection.emit(payload("1", "after failure"));
    harness.connection.emit(TransportEvent::Connection(ConnectionState::Disconnected));

    assert_eq!(
        next(&mut sequence).await.unwrap().unwrap(),
        SubscriptionEvent::Connection(ConnectionState::Connected)
    );
    let remaining = rest(sequence).await;
    assert_eq!(remaining.len(), 1);
    assert!(matches!(remaining[0], Err(ApiError::Decode { .. })));

    assert_eq!(task.state(), LifecycleState::Terminated);
    assert!(matches!(task.result().await, Err(ApiError::Decode { .. })));
}

#[tokio::test]
async fn test_shape_mismatch_is_decode_failure() {
    let harness = harness().await;
    let (task, sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    let body = json!({ "data": { "onCreateMessage": { "id": 7 } } });
    harness.connection.emit(TransportEvent::Data(serde_json::to_vec(&body).unwrap()));

    let events = rest(sequence).await;
    assert!(matches!(events.as_slice(), [Err(ApiError::Decode { raw: Some(_), .. })]));
    assert!(task.result().await.is_err());
}

#[tokio::test]
async fn test_graphql_errors_do_not_end_subscription() {
    let harness = harness().await;
    let (task, mut sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    let partial = json!({
        "data": { "onCreateMessage": { "id": "1", "content": null } },
        "errors": [{ "message": "content redacted", "path": ["onCreateMessage", "content"] }]
    });
    harness.connection.emit(TransportEvent::Data(serde_json::to_vec(&partial).unwrap()));
    harness.connection.emit(payload("2", "ok"));

    match next(&mut sequence).await.unwrap().unwrap() {
        SubscriptionEvent::Data(Err(GraphQLResponseError::Partial { errors, .. })) => {
            assert_eq!(errors[0].message, "content redacted");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(next(&mut sequence).await.unwrap().unwrap(), message("2", "ok"));
    assert_eq!(task.state(), LifecycleState::Connected);
    task.cancel();
}

#[tokio::test]
async fn test_cancel_mid_stream() {
    let harness = harness().await;
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    let listeners = SubscriptionListeners::<Message>::default().on_completion(move |outcome| {
        assert!(outcome.is_ok());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (task, mut sequence) = subscribed(&harness, listeners).await;

    harness.connection.emit(TransportEvent::Connection(ConnectionState::Connected));
    harness.connection.emit(payload("1", "A"));
    assert!(next(&mut sequence).await.unwrap().is_ok());
    assert!(next(&mut sequence).await.unwrap().is_ok());

    task.cancel();
    task.cancel();
    harness.connection.emit(payload("2", "late"));

    let remaining = rest(sequence).await;
    assert_eq!(remaining.len(), 1);
    assert!(matches!(
        remaining[0],
        Ok(SubscriptionEvent::Connection(ConnectionState::Disconnected))
    ));

    assert_eq!(task.state(), LifecycleState::Terminated);
    assert!(task.result().await.is_ok());
    assert_eq!(harness.connection.subscription_count(), 0);

    harness.bus.flush().await;
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_never_leaves_consumer_suspended() {
    let harness = harness().await;
    let (task, mut sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(item) = sequence.next().await {
            seen.push(item);
        }
        seen
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    task.cancel();

    let seen = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
    assert!(matches!(
        seen.as_slice(),
        [Ok(SubscriptionEvent::Connection(ConnectionState::Disconnected))]
    ));
}

#[tokio::test]
async fn test_unauthorized_server_error() {
    let harness = harness().await;
    let (task, sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    harness.connection.emit(TransportEvent::Failed(TransportError::Subscription {
        id: "sub-1".to_string(),
        payload: Some(json!({
            "errors": [{ "message": "Not Authorized", "extensions": { "errorType": "Unauthorized" } }]
        })),
    }));
    harness.connection.emit(payload("1", "ignored"));

    let events = rest(sequence).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        Err(error @ ApiError::Server { errors, .. }) => {
            assert!(error.is_unauthorized());
            assert_eq!(errors.len(), 1);
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
    assert!(task.result().await.unwrap_err().is_unauthorized());
}

#[tokio::test]
async fn test_connection_loss_is_connection_error() {
    let harness = harness().await;
    let (task, sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    harness.connection.emit(TransportEvent::Failed(TransportError::Connection {
        message: "socket closed".to_string(),
    }));

    let events = rest(sequence).await;
    assert!(matches!(events.as_slice(), [Err(ApiError::Connection { .. })]));
    assert_eq!(task.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_server_disconnect_finishes_normally() {
    let harness = harness().await;
    let (task, sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;

    harness.connection.emit(TransportEvent::Connection(ConnectionState::Connected));
    harness.connection.emit(TransportEvent::Connection(ConnectionState::Disconnected));
    harness.connection.emit(payload("1", "late"));

    let events: Vec<_> = rest(sequence).await.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        events,
        vec![
            SubscriptionEvent::Connection(ConnectionState::Connected),
            SubscriptionEvent::Connection(ConnectionState::Disconnected),
        ]
    );
    assert!(task.result().await.is_ok());

    // Cancelling after termination publishes nothing more.
    task.cancel();
    assert_eq!(task.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_value_listener_stops_at_result() {
    let harness = harness().await;
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    let listeners = SubscriptionListeners::<Message>::default()
        .on_value(move |event| sink.lock().unwrap().push(event.clone()))
        .on_completion(|_| {});
    let (task, _sequence) = subscribed(&harness, listeners).await;

    harness.connection.emit(payload("1", "A"));
    harness.connection.emit(TransportEvent::Connection(ConnectionState::Disconnected));
    harness.bus.flush().await;

    assert_eq!(
        *values.lock().unwrap(),
        vec![message("1", "A"), SubscriptionEvent::Connection(ConnectionState::Disconnected)]
    );
    assert_eq!(harness.bus.listener_count(Category::Api), 0);
    assert!(task.result().await.is_ok());
}

#[tokio::test]
async fn test_client_shutdown_cancels_subscriptions() {
    let harness = harness().await;
    let (first, first_sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;
    let (second, second_sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;
    assert_eq!(harness.connection.subscription_count(), 2);

    harness.client.shutdown();

    for sequence in [first_sequence, second_sequence] {
        let events = rest(sequence).await;
        assert!(matches!(
            events.as_slice(),
            [Ok(SubscriptionEvent::Connection(ConnectionState::Disconnected))]
        ));
    }
    assert!(first.result().await.is_ok());
    assert!(second.result().await.is_ok());
    assert_eq!(harness.connection.subscription_count(), 0);
}

#[tokio::test]
async fn test_independent_subscriptions_share_connection() {
    let harness = harness().await;
    let (first, mut first_sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;
    let (second, mut second_sequence) = subscribed(&harness, SubscriptionListeners::<Message>::default()).await;
    assert_eq!(harness.factory.connection_count().await, 1);

    harness.connection.emit(payload("1", "both"));
    assert_eq!(next(&mut first_sequence).await.unwrap().unwrap(), message("1", "both"));
    assert_eq!(next(&mut second_sequence).await.unwrap().unwrap(), message("1", "both"));

    first.cancel();
    harness.connection.emit(payload("2", "second only"));
    assert_eq!(next(&mut second_sequence).await.unwrap().unwrap(), message("2", "second only"));
    assert_eq!(second.state(), LifecycleState::Connected);
    second.cancel();
}

#[tokio::test]
async fn test_refused_connection_fails_once() {
    let harness = harness().await;
    harness.factory.refuse_connections("service unavailable");

    let task = harness.client.subscribe(request());
    let sequence = task.sequence().unwrap();

    let events = rest(sequence).await;
    assert!(matches!(events.as_slice(), [Err(ApiError::Connection { .. })]));
    assert!(matches!(task.result().await, Err(ApiError::Connection { .. })));
}

#[tokio::test]
async fn test_rest_endpoint_is_not_a_subscription_target() {
    let settings = Settings::default().with_endpoint(EndpointConfig {
        endpoint_type: EndpointType::Rest,
        ..EndpointConfig::graphql("files", "https://files.example.com")
    });
    let client = ApiClient::new(EventBus::new(), settings, Arc::new(LoopbackConnectionFactory::new()));

    let task = client.subscribe(request().with_api_name("files"));
    assert!(matches!(task.result().await, Err(ApiError::Configuration { .. })));
}

/// Holds every connection request until the test opens the gate.
struct GatedFactory {
    inner: Arc<LoopbackConnectionFactory>,
    gate: Semaphore,
    entered: Notify,
    acquired: Notify,
}

#[async_trait]
impl ConnectionFactory for GatedFactory {
    async fn get_or_create_connection(
        &self,
        endpoint: &EndpointConfig,
        auth: &AuthContext,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.entered.notify_one();
        let _permit = self.gate.acquire().await.map_err(|e| ConnectionError::new(&endpoint.name, e.to_string()))?;
        let connection = self.inner.get_or_create_connection(endpoint, auth).await;
        self.acquired.notify_one();
        connection
    }
}

#[tokio::test]
async fn test_cancel_while_acquiring_connection() {
    let harness = harness().await;
    let gated = Arc::new(GatedFactory {
        inner: harness.factory.clone(),
        gate: Semaphore::new(0),
        entered: Notify::new(),
        acquired: Notify::new(),
    });
    let settings = Settings::default().with_endpoint(EndpointConfig::graphql(
        "chat",
        "wss://chat.example.com/graphql/realtime",
    ));
    let client = ApiClient::new(harness.bus.clone(), settings, gated.clone());

    let task = client.subscribe(request());
    let sequence = task.sequence().unwrap();
    timeout(Duration::from_secs(1), gated.entered.notified())
        .await
        .expect("connection was never requested");
    assert_eq!(task.state(), LifecycleState::AcquiringConnection);

    task.cancel();
    assert_eq!(task.state(), LifecycleState::Terminated);

    gated.gate.add_permits(1);
    timeout(Duration::from_secs(1), gated.acquired.notified())
        .await
        .expect("connection was never handed out");
    tokio::task::yield_now().await;

    assert!(rest(sequence).await.is_empty());
    assert!(task.result().await.is_ok());
    assert_eq!(harness.connection.subscription_count(), 0);

    harness.bus.flush().await;
    assert_eq!(harness.bus.listener_count(Category::Api), 0);
}
