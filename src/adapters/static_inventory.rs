//! Static inventory adapter
//!
//! Dialect `static`: reachability, inventory and payloads are read from the
//! instance's `connection_options` JSON instead of a live server. Used for
//! demos, smoke runs and tests.
//!
//! ```json
//! {
//!   "reachable": true,
//!   "inventory": { "capacity": ["orders", "billing"], "account": ["app"] },
//!   "payloads": { "orders": { "size_mb": 120 } },
//!   "step_delay_ms": 0
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::adapters::{AdapterError, AdapterFactory, CollectedItem, DatabaseAdapter};
use crate::models::SyncCategory;
use crate::models::instance::Model as Instance;

pub const STATIC_DIALECT: &str = "static";

/// Options understood by the static adapter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaticOptions {
    pub reachable: bool,
    /// Fail `connect` with an error instead of reporting unreachable
    pub connect_error: Option<String>,
    pub inventory_error: Option<String>,
    pub collect_error: Option<String>,
    /// Item names per sync category
    pub inventory: HashMap<String, Vec<String>>,
    /// Payload per item name; items without one get a minimal payload
    pub payloads: HashMap<String, Value>,
    /// Artificial latency applied to every step
    pub step_delay_ms: u64,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            reachable: true,
            connect_error: None,
            inventory_error: None,
            collect_error: None,
            inventory: HashMap::new(),
            payloads: HashMap::new(),
            step_delay_ms: 0,
        }
    }
}

/// Adapter serving inventory from static options
#[derive(Debug)]
pub struct StaticInventoryAdapter {
    options: StaticOptions,
    connected: bool,
}

impl StaticInventoryAdapter {
    pub fn new(options: StaticOptions) -> Self {
        Self {
            options,
            connected: false,
        }
    }

    pub fn from_instance(instance: &Instance) -> Result<Self, AdapterError> {
        let options = match &instance.connection_options {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                AdapterError::configuration(format!(
                    "invalid static connection options for instance {}: {e}",
                    instance.id
                ))
            })?,
            None => StaticOptions::default(),
        };
        Ok(Self::new(options))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    async fn delay(&self) {
        if self.options.step_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.options.step_delay_ms)).await;
        }
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.connected {
            Ok(())
        } else {
            Err(AdapterError::connection("adapter is not connected"))
        }
    }
}

#[async_trait]
impl DatabaseAdapter for StaticInventoryAdapter {
    fn dialect(&self) -> &str {
        STATIC_DIALECT
    }

    async fn connect(&mut self) -> Result<bool, AdapterError> {
        self.delay().await;
        if let Some(details) = &self.options.connect_error {
            return Err(AdapterError::connection(details.clone()));
        }
        self.connected = self.options.reachable;
        Ok(self.connected)
    }

    async fn list_inventory(
        &mut self,
        category: SyncCategory,
    ) -> Result<Vec<String>, AdapterError> {
        self.ensure_connected()?;
        self.delay().await;
        if let Some(details) = &self.options.inventory_error {
            return Err(AdapterError::query(details.clone()));
        }
        let mut items = self
            .options
            .inventory
            .get(category.as_str())
            .cloned()
            .unwrap_or_default();
        items.sort();
        items.dedup();
        Ok(items)
    }

    async fn collect(
        &mut self,
        category: SyncCategory,
        active_items: &[String],
    ) -> Result<Vec<CollectedItem>, AdapterError> {
        self.ensure_connected()?;
        self.delay().await;
        if let Some(details) = &self.options.collect_error {
            return Err(AdapterError::query(details.clone()));
        }
        Ok(active_items
            .iter()
            .map(|name| CollectedItem {
                item_name: name.clone(),
                payload: self
                    .options
                    .payloads
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| json!({ "category": category.as_str(), "item": name })),
            })
            .collect())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Factory registered under [`STATIC_DIALECT`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticInventoryFactory;

impl AdapterFactory for StaticInventoryFactory {
    fn create(&self, instance: &Instance) -> Result<Box<dyn DatabaseAdapter>, AdapterError> {
        Ok(Box::new(StaticInventoryAdapter::from_instance(instance)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(value: Value) -> StaticOptions {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn serves_inventory_for_category() {
        let mut adapter = StaticInventoryAdapter::new(options(json!({
            "inventory": {"capacity": ["orders", "billing", "orders"]},
            "payloads": {"orders": {"size_mb": 12}}
        })));

        assert!(adapter.connect().await.unwrap());
        let items = adapter.list_inventory(SyncCategory::Capacity).await.unwrap();
        assert_eq!(items, vec!["billing".to_string(), "orders".to_string()]);
        assert!(
            adapter
                .list_inventory(SyncCategory::Account)
                .await
                .unwrap()
                .is_empty()
        );

        let collected = adapter
            .collect(SyncCategory::Capacity, &["orders".to_string()])
            .await
            .unwrap();
        assert_eq!(collected[0].payload, json!({"size_mb": 12}));

        adapter.disconnect().await;
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn unreachable_instance_reports_false() {
        let mut adapter = StaticInventoryAdapter::new(options(json!({"reachable": false})));
        assert!(!adapter.connect().await.unwrap());
        assert!(adapter.list_inventory(SyncCategory::Account).await.is_err());
    }

    #[test]
    fn malformed_options_are_a_configuration_error() {
        let now = chrono::Utc::now().fixed_offset();
        let instance = Instance {
            id: uuid::Uuid::new_v4(),
            name: "broken".into(),
            db_type: STATIC_DIALECT.into(),
            host: None,
            port: None,
            is_active: true,
            connection_options: Some(json!({"reachable": "maybe"})),
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            StaticInventoryAdapter::from_instance(&instance),
            Err(AdapterError::Configuration { .. })
        ));
    }
}
