//! # Repository Layer
//!
//! SeaORM-backed collaborators of the sync core: the instance registry the
//! orchestrator fans out over, and the inventory/snapshot/aggregate store the
//! collection pipeline writes to.

pub mod instance;
pub mod inventory;

pub use instance::{DbInstanceRegistry, InstanceFilter, InstanceRegistry};
pub use inventory::{AggregateSummary, CollectionStore, DbCollectionStore, InventorySummary};
