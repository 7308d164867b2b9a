//! HTTP transport for callback handlers.
//!
//! Requests are POSTed as JSON to a single endpoint; the handler reference
//! travels in the `x-stackwire-handler` header so one gateway can front
//! several handlers.

use async_trait::async_trait;
use tracing::debug;

use super::handler::{CallbackHandler, HandlerError};
use super::protocol::{HandlerRequest, HandlerResponse};

pub const HANDLER_HEADER: &str = "x-stackwire-handler";

/// HTTP handler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HttpHandlerConfig {
    pub endpoint: String,
    /// Bearer token (optional)
    pub token: Option<String>,
}

impl Default for HttpHandlerConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("STACKWIRE_HANDLER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080/handler".to_string()),
            token: std::env::var("STACKWIRE_HANDLER_TOKEN").ok(),
        }
    }
}

impl HttpHandlerConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }
}

/// Callback handler reached over HTTP.
pub struct HttpCallbackHandler {
    config: HttpHandlerConfig,
    http_client: reqwest::Client,
}

impl HttpCallbackHandler {
    pub fn new(config: HttpHandlerConfig) -> Result<Self, HandlerError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("stackwire/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HandlerError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl CallbackHandler for HttpCallbackHandler {
    async fn invoke(
        &self,
        handler_ref: &str,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, HandlerError> {
        debug!(
            endpoint = %self.config.endpoint,
            handler = %handler_ref,
            request_type = %request.request_type,
            "posting handler request"
        );
        let mut builder = self
            .http_client
            .post(&self.config.endpoint)
            .header(HANDLER_HEADER, handler_ref)
            .json(request);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| HandlerError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HandlerError::Transport(format!(
                "handler endpoint returned {status}"
            )));
        }
        response
            .json::<HandlerResponse>()
            .await
            .map_err(|e| HandlerError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::custom_resource::protocol::RequestType;

    #[test]
    fn config_builder() {
        let config = HttpHandlerConfig::new("http://handler.local/invoke").with_token("secret");
        assert_eq!(config.endpoint, "http://handler.local/invoke");
        assert_eq!(config.token.as_deref(), Some("secret"));
        let handler = HttpCallbackHandler::new(config).unwrap();
        assert_eq!(handler.endpoint(), "http://handler.local/invoke");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let handler =
            HttpCallbackHandler::new(HttpHandlerConfig::new("http://127.0.0.1:1/handler")).unwrap();
        let request = HandlerRequest {
            request_type: RequestType::Create,
            logical_id: "x".into(),
            physical_id: None,
            properties: BTreeMap::new(),
            old_properties: None,
        };
        let err = handler.invoke("fn-arn", &request).await.unwrap_err();
        assert!(matches!(err, HandlerError::Transport(_)));
    }
}
