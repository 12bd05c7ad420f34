use serde::Deserialize;

use super::error::{HttpDaoError, HttpResult};

/// Runtime configuration describing how to reach one CRUD API deployment.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HttpGatewayConfig {
    /// Destination name used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// API root, e.g. `https://api.example.org/v1`.
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_name() -> String {
    "primary".into()
}

impl HttpGatewayConfig {
    /// Construct a configuration from an explicit API root.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            token: None,
        }
    }

    /// Attach a bearer token to the configuration.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build the primary API configuration from the environment.
    pub fn from_env() -> HttpResult<Self> {
        let base_url = std::env::var("ROOMKEEPER_API_URL").map_err(|_| {
            HttpDaoError::MissingEnvVar {
                var: "ROOMKEEPER_API_URL",
            }
        })?;

        let mut config = Self::new(default_name(), base_url);
        if let Ok(token) = std::env::var("ROOMKEEPER_API_TOKEN") {
            config = config.with_token(token);
        }

        Ok(config)
    }
}
