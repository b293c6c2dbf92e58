//! # Data Models
//!
//! SeaORM entities for the job store, sync sessions, task runs and the
//! per-instance inventory written by the collection pipeline.

pub mod audit_event;
pub mod instance;
pub mod instance_aggregate;
pub mod instance_inventory;
pub mod instance_snapshot;
pub mod scheduler_job;
pub mod sync_instance_record;
pub mod sync_session;
pub mod task_run;
pub mod task_run_item;

pub use audit_event::Entity as AuditEvent;
pub use instance::Entity as Instance;
pub use instance_aggregate::Entity as InstanceAggregate;
pub use instance_inventory::Entity as InstanceInventory;
pub use instance_snapshot::Entity as InstanceSnapshot;
pub use scheduler_job::Entity as SchedulerJob;
pub use sync_instance_record::Entity as SyncInstanceRecord;
pub use sync_session::Entity as SyncSession;
pub use task_run::Entity as TaskRun;
pub use task_run_item::Entity as TaskRunItem;

pub use sync_instance_record::RecordStatus;
pub use sync_session::{SessionStatus, SyncCategory, SyncType, UnknownVariant};
pub use task_run::{RunStatus, TriggerSource};
pub use task_run_item::ItemStatus;
