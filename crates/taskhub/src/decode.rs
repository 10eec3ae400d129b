use serde::de::DeserializeOwned;
use serde_json::Value;
use taskhub_protocol::{GraphQLError, GraphQLResponse, GraphQLResponseError};

use crate::error::ApiError;
use crate::request::GraphQLRequest;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
    /// The raw payload, when it was valid UTF-8
    pub raw: Option<String>,
}

impl DecodeError {
    fn new(message: impl Into<String>, raw: &[u8]) -> Self {
        Self {
            message: message.into(),
            raw: std::str::from_utf8(raw).ok().map(str::to_owned),
        }
    }
}

impl From<DecodeError> for ApiError {
    fn from(error: DecodeError) -> Self {
        ApiError::Decode {
            message: error.message,
            raw: error.raw,
        }
    }
}

/// Turns a raw GraphQL payload into the request's typed response.
pub trait ResponseDecoder<T>: Send + Sync {
    fn decode(&self, raw: &[u8], request: &GraphQLRequest<T>) -> Result<GraphQLResponse<T>, DecodeError>;
}

/// Decodes the standard `{"data": ..., "errors": [...]}` JSON envelope.
///
/// A payload with errors decodes to `Ok(Err(..))`: `Partial` when data came
/// along, `Errors` otherwise. Data is narrowed by the request's decode path
/// before being deserialized into `T`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseDecoder;

impl<T: DeserializeOwned> ResponseDecoder<T> for JsonResponseDecoder {
    fn decode(&self, raw: &[u8], request: &GraphQLRequest<T>) -> Result<GraphQLResponse<T>, DecodeError> {
        let envelope: Value = serde_json::from_slice(raw)
            .map_err(|e| DecodeError::new(format!("payload is not valid JSON: {e}"), raw))?;
        let Value::Object(mut envelope) = envelope else {
            return Err(DecodeError::new("payload is not a JSON object", raw));
        };

        let data = envelope.remove("data").unwrap_or(Value::Null);

        if let Some(errors) = envelope.remove("errors") {
            let errors: Vec<GraphQLError> = serde_json::from_value(errors)
                .map_err(|e| DecodeError::new(format!("malformed errors array: {e}"), raw))?;
            if !errors.is_empty() {
                let response = if data.is_null() {
                    GraphQLResponseError::Errors { errors }
                } else {
                    GraphQLResponseError::Partial { data, errors }
                };
                return Ok(Err(response));
            }
        }

        if data.is_null() {
            return Err(DecodeError::new("payload has no data", raw));
        }

        let value = match &request.decode_path {
            Some(path) => select(data, path).ok_or_else(|| {
                DecodeError::new(format!("decode path '{path}' not found in data"), raw)
            })?,
            None => data,
        };

        serde_json::from_value(value)
            .map(Ok)
            .map_err(|e| DecodeError::new(format!("data does not match the expected type: {e}"), raw))
    }
}

fn select(mut value: Value, path: &str) -> Option<Value> {
    for segment in path.split('.') {
        value = match value {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(value)
}
