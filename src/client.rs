// Copyright 2025 Cowboy AI, LLC.

//! Wire-protocol client seam
//!
//! The engine never speaks the tool protocol itself. It drives a
//! [`ServiceClient`] supplied by the embedding application.

use crate::config::ServiceConfig;
use crate::identity::ServiceIdentity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a wire client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// No answer within the bound, in milliseconds
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Service refused or dropped the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Service answered with something unusable
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One tool advertised by a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolInfo {
    /// Tool name, unique within the service
    pub name: String,
    /// Human readable description
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the tool input
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolInfo {
    /// Tool with only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::Value::Null,
        }
    }
}

/// A live session returned by `connect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectedSession {
    /// Session handle assigned by the client
    pub session_id: String,
    /// Tools advertised at connect time
    pub tools: Vec<ToolInfo>,
    /// When the session was established
    pub connected_at: DateTime<Utc>,
}

/// Operations the engine needs from the wire client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Establish a session with the service
    async fn connect(
        &self,
        identity: &ServiceIdentity,
        config: &ServiceConfig,
    ) -> Result<ConnectedSession, ClientError>;

    /// Liveness probe, returning the observed latency
    async fn ping(&self, identity: &ServiceIdentity) -> Result<Duration, ClientError>;

    /// Tear the session down; the default does nothing
    async fn disconnect(&self, _identity: &ServiceIdentity) -> Result<(), ClientError> {
        Ok(())
    }
}
