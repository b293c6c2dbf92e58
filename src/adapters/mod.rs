//! Connection adapters
//!
//! One [`DatabaseAdapter`] per database dialect implements the collection
//! pipeline verbs against a single instance. [`AdapterRegistry`] maps a
//! dialect name to the factory that builds adapters for it.

pub mod registry;
pub mod static_inventory;
pub mod trait_;

pub use registry::{AdapterFactory, AdapterRegistry, RegistryError};
pub use static_inventory::{STATIC_DIALECT, StaticInventoryAdapter, StaticInventoryFactory};
pub use trait_::{AdapterError, CollectedItem, DatabaseAdapter};
