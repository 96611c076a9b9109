use crate::config::StolonConfig;
use crate::core::sanitize::Sanitizer;
use crate::core::tunnel::TunnelManager;
use crate::domain::model::Environment;
use crate::domain::ports::SecretStore;
use crate::utils::error::{Result, StolonError};
use crate::utils::validation::validate_api_path;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default = "default_true")]
    pub sanitize: bool,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            sanitize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Calls internal HTTP services through their port-forwards.
pub struct ApiGateway {
    config: Arc<StolonConfig>,
    tunnels: Arc<TunnelManager>,
    secrets: Arc<dyn SecretStore>,
    sanitizer: Arc<Sanitizer>,
    client: Client,
}

impl ApiGateway {
    pub fn new(
        config: Arc<StolonConfig>,
        tunnels: Arc<TunnelManager>,
        secrets: Arc<dyn SecretStore>,
        sanitizer: Arc<Sanitizer>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            config,
            tunnels,
            secrets,
            sanitizer,
            client,
        })
    }

    pub async fn request(
        &self,
        environment: Environment,
        service: &str,
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        validate_api_path("path", &request.path)?;
        let svc = self.config.service(environment, service)?;
        let tunnel = self
            .tunnels
            .ensure_port_forward(environment, service, None)
            .await?;

        let token = match &svc.token {
            Some(secret) => Some(self.secrets.read(secret).await?),
            None => None,
        };

        let base = Url::parse(&format!("http://127.0.0.1:{}", tunnel.local_port)).map_err(|e| {
            StolonError::ValidationError {
                message: format!("bad tunnel address: {}", e),
            }
        })?;

        let sanitize = request.sanitize || environment.is_production();
        self.send(&base, request, token.as_deref(), sanitize).await
    }

    /// Sends `request` relative to `base` and decodes the response.
    pub async fn send(
        &self,
        base: &Url,
        request: &ApiRequest,
        token: Option<&str>,
        sanitize: bool,
    ) -> Result<ApiResponse> {
        validate_api_path("path", &request.path)?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes()).map_err(
            |_| StolonError::ValidationError {
                message: format!("unsupported HTTP method '{}'", request.method),
            },
        )?;
        let url = base
            .join(&request.path)
            .map_err(|e| StolonError::ValidationError {
                message: format!("invalid path '{}': {}", request.path, e),
            })?;

        tracing::debug!(%method, %url, "forwarding internal API request");
        let mut builder = self.client.request(method, url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        let body = match serde_json::from_str::<Value>(&text) {
            Ok(json) if sanitize => self.sanitizer.sanitize_json(&json),
            Ok(json) => json,
            Err(_) if text.is_empty() => Value::Null,
            Err(_) => Value::String(text),
        };

        Ok(ApiResponse { status, body })
    }
}
