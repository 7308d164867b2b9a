//! Request/response envelope exchanged with callback handlers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestType::Create => "CREATE",
            RequestType::Update => "UPDATE",
            RequestType::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRequest {
    pub request_type: RequestType,
    pub logical_id: String,
    /// Absent on CREATE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    pub properties: BTreeMap<String, Scalar>,
    /// Last-applied properties, sent with UPDATE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_properties: Option<BTreeMap<String, Scalar>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status: ResponseStatus,
    /// Required on a successful CREATE. On UPDATE, a different id than the
    /// current one means the handler replaced the resource.
    #[serde(default)]
    pub physical_id: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl HandlerResponse {
    pub fn success(physical_id: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            physical_id: Some(physical_id.into()),
            data: BTreeMap::new(),
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            physical_id: None,
            data: BTreeMap::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}
