//! Adapter registry
//!
//! Maps a dialect (`instances.db_type`) to the factory building adapters for it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::static_inventory::{STATIC_DIALECT, StaticInventoryFactory};
use crate::adapters::{AdapterError, DatabaseAdapter};
use crate::models::instance::Model as Instance;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no adapter registered for dialect '{dialect}'")]
    DialectNotFound { dialect: String },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Builds a fresh adapter bound to one instance
pub trait AdapterFactory: Send + Sync {
    fn create(&self, instance: &Instance) -> Result<Box<dyn DatabaseAdapter>, AdapterError>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&Instance) -> Result<Box<dyn DatabaseAdapter>, AdapterError> + Send + Sync,
{
    fn create(&self, instance: &Instance) -> Result<Box<dyn DatabaseAdapter>, AdapterError> {
        self(instance)
    }
}

/// Registry of dialect factories
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `static` dialect
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(STATIC_DIALECT, Arc::new(StaticInventoryFactory));
        registry
    }

    /// Register (or replace) the factory for `dialect`
    pub fn register(&mut self, dialect: &str, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(dialect.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, dialect: &str) -> bool {
        self.factories.contains_key(&dialect.to_ascii_lowercase())
    }

    /// Dialects with a registered factory, sorted for stable output
    pub fn dialects(&self) -> Vec<String> {
        let mut dialects: Vec<_> = self.factories.keys().cloned().collect();
        dialects.sort();
        dialects
    }

    /// Build an adapter for `instance` using its `db_type`
    pub fn adapter_for(&self, instance: &Instance) -> Result<Box<dyn DatabaseAdapter>, RegistryError> {
        let factory = self
            .factories
            .get(&instance.db_type.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::DialectNotFound {
                dialect: instance.db_type.clone(),
            })?;
        Ok(factory.create(instance)?)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("dialects", &self.dialects())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn instance(db_type: &str) -> Instance {
        let now = Utc::now().fixed_offset();
        Instance {
            id: Uuid::new_v4(),
            name: "db-1".into(),
            db_type: db_type.into(),
            host: None,
            port: None,
            is_active: true,
            connection_options: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn builtin_registry_resolves_static_case_insensitively() {
        let registry = AdapterRegistry::with_builtin();
        assert!(registry.contains("STATIC"));
        let adapter = registry.adapter_for(&instance("Static")).unwrap();
        assert_eq!(adapter.dialect(), STATIC_DIALECT);
    }

    #[test]
    fn unknown_dialect_is_reported() {
        let registry = AdapterRegistry::with_builtin();
        let err = registry.adapter_for(&instance("oracle")).err().unwrap();
        assert!(matches!(err, RegistryError::DialectNotFound { ref dialect } if dialect == "oracle"));
        assert_eq!(err.to_string(), "no adapter registered for dialect 'oracle'");
    }

    #[test]
    fn closures_can_act_as_factories() {
        let mut registry = AdapterRegistry::new();
        registry.register(
            "mysql",
            Arc::new(|_: &Instance| -> Result<Box<dyn DatabaseAdapter>, AdapterError> {
                Err(AdapterError::configuration("driver not compiled in"))
            }),
        );
        let err = registry.adapter_for(&instance("mysql")).err().unwrap();
        assert!(matches!(err, RegistryError::Adapter(AdapterError::Configuration { .. })));
        assert_eq!(registry.dialects(), vec!["mysql".to_string()]);
    }
}
