//! Adapter trait definition
//!
//! Defines the interface every dialect adapter implements. Adapters are
//! stateful: one is created per instance per pipeline run, connected once
//! and always disconnected after a successful connect.

use async_trait::async_trait;
use serde_json::Value;

use crate::models::SyncCategory;

/// Adapter-level failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The target could not be reached or refused the session
    #[error("connection error: {details}")]
    Connection { details: String },
    /// A query against a connected target failed
    #[error("query error: {details}")]
    Query { details: String },
    /// The instance is misconfigured for this dialect
    #[error("configuration error: {details}")]
    Configuration { details: String },
    /// A step did not finish within the configured timeout
    #[error("{step} timed out after {seconds}s")]
    Timeout { step: &'static str, seconds: u64 },
}

impl AdapterError {
    pub fn connection<S: Into<String>>(details: S) -> Self {
        Self::Connection {
            details: details.into(),
        }
    }

    pub fn query<S: Into<String>>(details: S) -> Self {
        Self::Query {
            details: details.into(),
        }
    }

    pub fn configuration<S: Into<String>>(details: S) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }
}

/// Payload gathered for one active inventory item
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedItem {
    pub item_name: String,
    pub payload: Value,
}

/// Dialect adapter driving one external instance
#[async_trait]
pub trait DatabaseAdapter: Send {
    /// Dialect name this adapter speaks
    fn dialect(&self) -> &str;

    /// Opens a session to the target.
    ///
    /// `Ok(false)` means the instance is unreachable. It is an expected
    /// outcome, not an error.
    async fn connect(&mut self) -> Result<bool, AdapterError>;

    /// Lists the sub-resources currently present on the target
    async fn list_inventory(&mut self, category: SyncCategory)
    -> Result<Vec<String>, AdapterError>;

    /// Collects payloads for the given active items only
    async fn collect(
        &mut self,
        category: SyncCategory,
        active_items: &[String],
    ) -> Result<Vec<CollectedItem>, AdapterError>;

    /// Closes the session. Must be safe after any failed step.
    async fn disconnect(&mut self);
}
