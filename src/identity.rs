// Copyright 2025 Cowboy AI, LLC.

//! Service identities and deterministic client ids

use crate::config::ServiceConfig;
use crate::errors::{LifecycleError, LifecycleResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator between tenant and service in composite keys
pub const KEY_SEPARATOR: &str = "::";

/// Namespace for client id derivation
const CLIENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_6665_6379_636c_655f_636c_6965_6e74);

/// A (tenant, service) pair
///
/// Services added under one tenant are invisible to every other tenant, so
/// all state, metadata and cache entries are keyed by the full pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ServiceIdentity {
    /// Isolation boundary
    pub tenant_id: String,
    /// Service name, unique within the tenant
    pub service_name: String,
}

impl ServiceIdentity {
    /// Build an identity, rejecting empty or separator-bearing names
    pub fn new(tenant_id: impl Into<String>, service_name: impl Into<String>) -> LifecycleResult<Self> {
        let tenant_id = tenant_id.into();
        let service_name = service_name.into();

        for (what, value) in [("tenant id", &tenant_id), ("service name", &service_name)] {
            if value.trim().is_empty() {
                return Err(LifecycleError::validation(format!("{what} must not be empty")));
            }
            if value.contains(KEY_SEPARATOR) {
                return Err(LifecycleError::validation(format!(
                    "{what} '{value}' must not contain '{KEY_SEPARATOR}'"
                )));
            }
        }

        Ok(Self {
            tenant_id,
            service_name,
        })
    }

    /// Composite store key
    pub fn key(&self) -> String {
        format!("{}{}{}", self.tenant_id, KEY_SEPARATOR, self.service_name)
    }

    /// Parse a composite store key
    pub fn from_key(key: &str) -> LifecycleResult<Self> {
        let (tenant, service) = key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| LifecycleError::validation(format!("'{key}' is not an identity key")))?;
        Self::new(tenant, service)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.tenant_id, KEY_SEPARATOR, self.service_name)
    }
}

/// Deterministic id of the client serving one identity with one config
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Derive the id from (tenant, service, config)
    ///
    /// Pure: identical inputs always give the same id, so repeating an add
    /// with an unchanged config is idempotent.
    pub fn derive(identity: &ServiceIdentity, config: &ServiceConfig) -> LifecycleResult<Self> {
        let canonical = serde_json::to_vec(&serde_json::json!({
            "tenant": identity.tenant_id,
            "service": identity.service_name,
            "config": config,
        }))?;
        let uuid = Uuid::new_v5(&CLIENT_ID_NAMESPACE, &canonical);
        Ok(Self(format!("client_{}", uuid.simple())))
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
