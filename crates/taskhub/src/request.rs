use std::fmt;
use std::marker::PhantomData;

use serde_json::Value;
use taskhub_protocol::AuthMode;

use crate::error::ApiError;

/// Per-request plugin options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Overrides the endpoint's default auth mode
    pub auth_mode: Option<AuthMode>,
}

/// A GraphQL query, mutation or subscription whose data decodes to `T`.
pub struct GraphQLRequest<T> {
    /// Named endpoint; `None` uses the only configured GraphQL endpoint
    pub api_name: Option<String>,
    pub document: String,
    pub variables: Option<Value>,
    /// Dot-separated path into `data` holding the value to decode
    pub decode_path: Option<String>,
    pub options: RequestOptions,
    response: PhantomData<fn() -> T>,
}

impl<T> GraphQLRequest<T> {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            api_name: None,
            document: document.into(),
            variables: None,
            decode_path: None,
            options: RequestOptions::default(),
            response: PhantomData,
        }
    }

    pub fn with_api_name(mut self, api_name: impl Into<String>) -> Self {
        self.api_name = Some(api_name.into());
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_decode_path(mut self, path: impl Into<String>) -> Self {
        self.decode_path = Some(path.into());
        self
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.options.auth_mode = Some(auth_mode);
        self
    }

    /// Structural validation, run before anything is sent.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.document.trim().is_empty() {
            return Err(ApiError::validation("document is empty"));
        }
        match &self.variables {
            None | Some(Value::Object(_)) => {}
            Some(other) => {
                return Err(ApiError::validation(format!(
                    "variables must be a JSON object, got {}",
                    json_kind(other)
                )))
            }
        }
        if let Some(path) = &self.decode_path {
            if path.split('.').any(str::is_empty) {
                return Err(ApiError::validation(format!("invalid decode path '{path}'")));
            }
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl<T> Clone for GraphQLRequest<T> {
    fn clone(&self) -> Self {
        Self {
            api_name: self.api_name.clone(),
            document: self.document.clone(),
            variables: self.variables.clone(),
            decode_path: self.decode_path.clone(),
            options: self.options.clone(),
            response: PhantomData,
        }
    }
}

impl<T> fmt::Debug for GraphQLRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphQLRequest")
            .field("api_name", &self.api_name)
            .field("document", &self.document)
            .field("variables", &self.variables)
            .field("decode_path", &self.decode_path)
            .field("options", &self.options)
            .finish()
    }
}
