use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use super::handler::{CallbackHandler, HandlerError};
use super::protocol::{HandlerRequest, HandlerResponse, RequestType};

/// In-process handler that acknowledges every request.
///
/// CREATE mints `<logical-id>-<n>`; UPDATE and DELETE keep the current
/// physical id. Used by the CLI when no handler endpoint is configured.
#[derive(Debug, Default)]
pub struct LocalHandler {
    minted: AtomicU64,
}

impl LocalHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallbackHandler for LocalHandler {
    async fn invoke(
        &self,
        handler_ref: &str,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, HandlerError> {
        info!(
            handler = %handler_ref,
            request_type = %request.request_type,
            logical_id = %request.logical_id,
            "local handler acknowledged request"
        );
        let physical_id = match (&request.request_type, &request.physical_id) {
            (RequestType::Create, _) | (_, None) => {
                let n = self.minted.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{}-{n}", request.logical_id)
            }
            (_, Some(current)) => current.clone(),
        };
        Ok(HandlerResponse::success(physical_id)
            .with_data("RequestType", request.request_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(request_type: RequestType, physical_id: Option<&str>) -> HandlerRequest {
        HandlerRequest {
            request_type,
            logical_id: "customizer".into(),
            physical_id: physical_id.map(str::to_string),
            properties: BTreeMap::new(),
            old_properties: None,
        }
    }

    #[tokio::test]
    async fn create_mints_and_update_keeps_id() {
        let handler = LocalHandler::new();
        let created = handler
            .invoke("fn", &request(RequestType::Create, None))
            .await
            .unwrap();
        assert_eq!(created.physical_id.as_deref(), Some("customizer-1"));

        let updated = handler
            .invoke("fn", &request(RequestType::Update, Some("customizer-1")))
            .await
            .unwrap();
        assert_eq!(updated.physical_id.as_deref(), Some("customizer-1"));
        assert_eq!(updated.data["RequestType"], "UPDATE");
    }
}
