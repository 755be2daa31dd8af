//! Cloud provider trait definition

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outputs returned by a provider, keyed by output name
pub type ResourceOutputs = BTreeMap<String, serde_json::Value>;

/// Cloud provider abstraction trait
///
/// The engine hands every call fully resolved inputs. Calls are atomic from
/// the engine's point of view: a call either returns outputs or an error, and
/// the engine never retries.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g., "local")
    fn name(&self) -> &str;

    /// Returns the provider display name for UI
    fn display_name(&self) -> &str;

    /// Check if the provider is properly configured and authenticated
    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Create a resource and return its outputs
    async fn create(&self, resource: &ResourceConfig) -> Result<ResourceOutputs>;

    /// Update an existing resource whose inputs changed
    async fn update(
        &self,
        resource: &ResourceConfig,
        current: &ResourceOutputs,
    ) -> Result<ResourceOutputs>;

    /// Delete a resource
    async fn delete(&self, resource: &ResourceConfig, current: &ResourceOutputs) -> Result<()>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// A resource as seen by a provider: kind, identity, placement and resolved inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource type (e.g., "vpc", "certificate")
    pub resource_type: String,

    /// Resource identifier (`stack/name`)
    pub id: String,

    /// Region the owning stack deploys into
    pub region: String,

    /// Target account, if the stack pins one
    pub account: Option<String>,

    /// Resolved inputs
    pub inputs: BTreeMap<String, serde_json::Value>,
}

impl ResourceConfig {
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            region: region.into(),
            account: None,
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_account(mut self, account: Option<String>) -> Self {
        self.account = account;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Get the full resource key (type:id)
    pub fn key(&self) -> String {
        format!("{}:{}", self.resource_type, self.id)
    }

    /// Get an input value as a specific type
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inputs
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
