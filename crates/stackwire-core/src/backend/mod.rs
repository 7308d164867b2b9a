//! Provisioning backend abstraction.
//!
//! Every non-custom resource is materialized through a
//! [`ProvisioningBackend`]. The backend returns an identifier and the
//! runtime attributes other resources may reference (endpoints, ARNs).

mod simulated;

pub use simulated::{BackendCall, SimulatedBackend};

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::graph::{ResolvedProperties, ResourceKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Worth retrying (throttling, temporary unavailability)
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend rejected request: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// A resource the backend created.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedResource {
    /// Backend-assigned identifier, used for later update and delete
    pub id: String,
    pub attributes: BTreeMap<String, String>,
}

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create_resource(
        &self,
        kind: &ResourceKind,
        properties: &ResolvedProperties,
    ) -> Result<ProvisionedResource, BackendError>;

    /// Apply new properties in place; returns the refreshed attributes.
    async fn update_resource(
        &self,
        id: &str,
        kind: &ResourceKind,
        properties: &ResolvedProperties,
    ) -> Result<BTreeMap<String, String>, BackendError>;

    async fn delete_resource(&self, id: &str, kind: &ResourceKind) -> Result<(), BackendError>;
}
