use async_trait::async_trait;
use thiserror::Error;

use super::protocol::{HandlerRequest, HandlerResponse};

/// Transport-level failure talking to a handler. A `FAILED` response is not
/// a `HandlerError`; it is a well-formed answer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Executes custom-resource lifecycle requests.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// Deliver `request` to the handler identified by `handler_ref`.
    async fn invoke(
        &self,
        handler_ref: &str,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, HandlerError>;
}
