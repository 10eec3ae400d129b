//! Shared data definitions for taskhub tasks, subscriptions and transports.
//!
//! Everything here is plain serde data with no runtime and no I/O. Transports and the
//! `taskhub` runtime both depend on these types so that connection events and
//! GraphQL payloads mean the same thing on either side of the
//! `Connection` boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Event Name Constants
// ============================================================================

/// Event names published on the event bus, following `<Category>.<action>`.
pub struct EventName;

impl EventName {
    // API category
    pub const API_QUERY: &str = "API.query";
    pub const API_MUTATE: &str = "API.mutate";
    pub const API_SUBSCRIBE: &str = "API.subscribe";
}

// ============================================================================
// Endpoint & Auth
// ============================================================================

/// Kind of endpoint a named API resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    #[default]
    GraphQL,
    Rest,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::GraphQL => "graphql",
            EndpointType::Rest => "rest",
        }
    }
}

/// Authorization mode used when opening a connection to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    None,
    #[default]
    ApiKey,
    AwsIam,
    OpenidConnect,
    AmazonCognitoUserPools,
    AwsLambda,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "NONE",
            AuthMode::ApiKey => "API_KEY",
            AuthMode::AwsIam => "AWS_IAM",
            AuthMode::OpenidConnect => "OPENID_CONNECT",
            AuthMode::AmazonCognitoUserPools => "AMAZON_COGNITO_USER_POOLS",
            AuthMode::AwsLambda => "AWS_LAMBDA",
        }
    }
}

// ============================================================================
// Subscription Events
// ============================================================================

/// Transport-level state of a subscription, independent of data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// Outcome of decoding one GraphQL payload: the typed data, or the errors the
/// service reported alongside (or instead of) it.
pub type GraphQLResponse<T> = Result<T, GraphQLResponseError>;

/// Element type of a GraphQL subscription's event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SubscriptionEvent<T> {
    /// Connection state changed.
    Connection(ConnectionState),
    /// A payload arrived and was decoded.
    Data(GraphQLResponse<T>),
}

impl<T> SubscriptionEvent<T> {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, SubscriptionEvent::Connection(ConnectionState::Disconnected))
    }
}

// ============================================================================
// GraphQL Errors
// ============================================================================

/// Marker carried in `extensions.errorType` for authorization failures.
pub const UNAUTHORIZED_ERROR_TYPE: &str = "Unauthorized";

/// Source location of a GraphQL error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    pub line: u32,
    pub column: u32,
}

/// A single entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Human-readable description of the error.
    pub message: String,
    /// Locations in the document the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<GraphQLLocation>>,
    /// Path to the response field that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Service-specific extension fields (e.g. `errorType`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert("errorType".to_string(), Value::String(error_type.into()));
        self
    }

    /// Value of `extensions.errorType`, if present and a string.
    pub fn error_type(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("errorType")?.as_str()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.error_type()
            .is_some_and(|t| t.contains(UNAUTHORIZED_ERROR_TYPE))
    }
}

/// Returns true when any error carries the unauthorized marker.
pub fn has_unauthorized_error(errors: &[GraphQLError]) -> bool {
    errors.iter().any(GraphQLError::is_unauthorized)
}

/// Errors a GraphQL service reported in an otherwise well-formed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphQLResponseError {
    /// The response carried only errors.
    #[error("graphql errors: {}", join_messages(.errors))]
    Errors { errors: Vec<GraphQLError> },
    /// The response carried data and errors; `data` is left undecoded.
    #[error("partial graphql response: {}", join_messages(.errors))]
    Partial { data: Value, errors: Vec<GraphQLError> },
}

impl GraphQLResponseError {
    pub fn errors(&self) -> &[GraphQLError] {
        match self {
            GraphQLResponseError::Errors { errors } => errors,
            GraphQLResponseError::Partial { errors, .. } => errors,
        }
    }
}

fn join_messages(errors: &[GraphQLError]) -> String {
    errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; ")
}

// ============================================================================
// Transport Contract
// ============================================================================

/// Event pushed by a connection to one of its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection state change for this subscription.
    Connection(ConnectionState),
    /// Raw, undecoded GraphQL payload.
    Data(Vec<u8>),
    /// Transport-level failure; the subscription is over.
    Failed(TransportError),
}

/// Failure reported by a transport for one subscription or request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// The service rejected the subscription; `payload` is its structured body.
    #[error("subscription {id} failed")]
    Subscription { id: String, payload: Option<Value> },
    /// The service refused the credentials for this connection.
    #[error("unauthorized")]
    Unauthorized,
    /// The connection could not be established or was lost.
    #[error("connection error: {message}")]
    Connection { message: String },
    /// Anything else the transport could not classify.
    #[error("transport error: {message}")]
    Other { message: String },
}

impl TransportError {
    /// GraphQL errors embedded in a subscription failure payload, if any.
    pub fn graphql_errors(&self) -> Option<Vec<GraphQLError>> {
        match self {
            TransportError::Subscription {
                payload: Some(payload),
                ..
            } => {
                let errors = payload.get("errors")?.clone();
                serde_json::from_value(errors).ok()
            }
            _ => None,
        }
    }
}
