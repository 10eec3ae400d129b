//! Error taxonomy shared by every task and subscription.
//!
//! Every terminal failure a consumer can observe is one [`ApiError`]. Causes
//! from collaborators are kept behind an `Arc` so the same error can be
//! delivered to the result channel, the event sequence and bus listeners.

use std::sync::Arc;

use taskhub_protocol::{GraphQLError, TransportError};
use thiserror::Error;

/// Shareable underlying cause of a failure.
pub type SharedCause = Arc<dyn std::error::Error + Send + Sync>;

/// Suffix appended to server error messages when the service rejected the
/// caller's authorization.
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized";

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// The request was malformed; nothing was sent.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The named endpoint is unknown or misconfigured; nothing was sent.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The connection could not be acquired or was lost.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        cause: Option<SharedCause>,
    },

    /// A payload did not match the expected shape.
    #[error("failed to decode response: {message}")]
    Decode {
        message: String,
        /// The raw payload, when it was valid UTF-8.
        raw: Option<String>,
    },

    /// The remote service returned structured errors.
    #[error("server error: {message}")]
    Server {
        message: String,
        errors: Vec<GraphQLError>,
        unauthorized: bool,
    },

    /// The caller cancelled the task.
    #[error("operation cancelled")]
    Cancelled,

    /// A collaborator failed in a way none of the other kinds describe.
    #[error("unknown error: {message}")]
    Unknown {
        message: String,
        #[source]
        cause: Option<SharedCause>,
    },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ApiError::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ApiError::Connection {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn unknown(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ApiError::Unknown {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Builds a server error from GraphQL errors, flagging unauthorized ones.
    pub fn server(message: impl Into<String>, errors: Vec<GraphQLError>) -> Self {
        let unauthorized = taskhub_protocol::has_unauthorized_error(&errors);
        let mut message = message.into();
        if unauthorized {
            message = format!("{message}: {UNAUTHORIZED_MESSAGE}");
        }
        ApiError::Server {
            message,
            errors,
            unauthorized,
        }
    }

    /// Server error for a connection whose credentials were refused.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Server {
            message: format!("{}: {UNAUTHORIZED_MESSAGE}", message.into()),
            errors: Vec::new(),
            unauthorized: true,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation_error",
            ApiError::Configuration { .. } => "configuration_error",
            ApiError::Connection { .. } => "connection_error",
            ApiError::Decode { .. } => "decode_error",
            ApiError::Server { .. } => "server_error",
            ApiError::Cancelled => "cancelled",
            ApiError::Unknown { .. } => "unknown_error",
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Server { unauthorized: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

impl ApiError {
    /// Classifies a transport failure, using `description` as the message of
    /// server and unknown errors.
    pub fn from_transport(description: &str, error: TransportError) -> Self {
        if let Some(errors) = error.graphql_errors() {
            return ApiError::server(description, errors);
        }
        match error {
            TransportError::Unauthorized => ApiError::unauthorized(description),
            TransportError::Connection { ref message } => {
                let message = message.clone();
                ApiError::connection(message, error)
            }
            other => ApiError::unknown(description, other),
        }
    }
}

/// Classifies a failure reported for a subscription.
impl From<TransportError> for ApiError {
    fn from(error: TransportError) -> Self {
        ApiError::from_transport("subscription item event failed with error", error)
    }
}

/// Marker for cancellation, convertible into a task's failure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for ApiError {
    fn from(_: Cancelled) -> Self {
        ApiError::Cancelled
    }
}

/// Marker for a task whose work panicked, convertible into its failure type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task panicked: {message}")]
pub struct Panicked {
    pub message: String,
}

impl Panicked {
    /// Extract the panic message from a caught payload.
    pub fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }
}

impl From<Panicked> for ApiError {
    fn from(panicked: Panicked) -> Self {
        ApiError::Unknown {
            message: panicked.message.clone(),
            cause: Some(Arc::new(panicked)),
        }
    }
}
