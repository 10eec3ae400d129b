use std::collections::HashMap;
use std::env;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use taskhub_protocol::{AuthMode, EndpointType};
use url::Url;

use crate::connection::AuthContext;
use crate::error::ApiError;

/// Configuration of one named API endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Endpoint name; filled from the settings key when loaded.
    #[serde(default)]
    pub name: String,
    /// GraphQL or REST
    #[serde(default)]
    pub endpoint_type: EndpointType,
    /// Service URL (http(s) or ws(s))
    pub url: String,
    /// Optional service region
    #[serde(default)]
    pub region: Option<String>,
    /// Default auth mode when the request does not override it
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// API key, required for `API_KEY` auth
    #[serde(default)]
    pub api_key: Option<String>,
}

impl EndpointConfig {
    pub fn graphql(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint_type: EndpointType::GraphQL,
            url: url.into(),
            region: None,
            auth_mode: AuthMode::None,
            api_key: None,
        }
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Resolve the effective auth context for a request.
    ///
    /// A request-scoped mode overrides the endpoint default.
    pub fn auth_context(&self, requested: Option<AuthMode>) -> Result<AuthContext, ApiError> {
        let mode = requested.unwrap_or(self.auth_mode);
        let api_key = match mode {
            AuthMode::ApiKey => match &self.api_key {
                Some(key) if !key.is_empty() => Some(key.clone()),
                _ => {
                    return Err(ApiError::configuration(format!(
                        "endpoint '{}' uses API_KEY auth but has no api_key configured",
                        self.name
                    )))
                }
            },
            _ => None,
        };
        Ok(AuthContext { mode, api_key })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| {
            ConfigError::Message(format!("endpoint '{}' has invalid url '{}': {}", self.name, self.url, e))
        })?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(()),
            scheme => Err(ConfigError::Message(format!(
                "endpoint '{}' has unsupported url scheme '{}'",
                self.name, scheme
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Named endpoints, keyed by API name
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables (with prefix TASKHUB)
            .add_source(Environment::with_prefix("TASKHUB").separator("__"))
            .build()?;

        s.try_deserialize::<Self>()?.normalized()
    }

    /// Load settings from a single file (format inferred from the extension).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        s.try_deserialize::<Self>()?.normalized()
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(endpoint.name.clone(), endpoint);
        self
    }

    /// Resolve the endpoint for a request.
    ///
    /// With a name, the endpoint must exist and be of `endpoint_type`. Without
    /// one, exactly one endpoint of that type must be configured.
    pub fn endpoint(
        &self,
        api_name: Option<&str>,
        endpoint_type: EndpointType,
    ) -> Result<&EndpointConfig, ApiError> {
        if let Some(name) = api_name {
            let config = self.endpoints.get(name).ok_or_else(|| {
                ApiError::configuration(format!("unable to get an endpoint configuration for '{name}'"))
            })?;
            if config.endpoint_type != endpoint_type {
                return Err(ApiError::configuration(format!(
                    "endpoint '{name}' is {} but a {} endpoint was requested",
                    config.endpoint_type.as_str(),
                    endpoint_type.as_str()
                )));
            }
            return Ok(config);
        }

        let mut candidates = self
            .endpoints
            .values()
            .filter(|c| c.endpoint_type == endpoint_type);
        match (candidates.next(), candidates.next()) {
            (Some(config), None) => Ok(config),
            (None, _) => Err(ApiError::configuration(format!(
                "no {} endpoints are configured",
                endpoint_type.as_str()
            ))),
            (Some(_), Some(_)) => Err(ApiError::configuration(format!(
                "multiple {} endpoints are configured; the request must name one",
                endpoint_type.as_str()
            ))),
        }
    }

    fn normalized(mut self) -> Result<Self, ConfigError> {
        for (name, endpoint) in self.endpoints.iter_mut() {
            endpoint.name = name.clone();
            endpoint.validate()?;
        }
        Ok(self)
    }
}
