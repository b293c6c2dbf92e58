//! Database migrations for the fleetsync core.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_instances;
mod m2026_01_05_090100_create_scheduler_jobs;
mod m2026_01_05_090200_create_sync_sessions;
mod m2026_01_05_090300_create_sync_instance_records;
mod m2026_01_05_090400_create_task_runs;
mod m2026_01_05_090500_create_instance_inventory;
mod m2026_01_05_090600_create_audit_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_instances::Migration),
            Box::new(m2026_01_05_090100_create_scheduler_jobs::Migration),
            Box::new(m2026_01_05_090200_create_sync_sessions::Migration),
            Box::new(m2026_01_05_090300_create_sync_instance_records::Migration),
            Box::new(m2026_01_05_090400_create_task_runs::Migration),
            Box::new(m2026_01_05_090500_create_instance_inventory::Migration),
            Box::new(m2026_01_05_090600_create_audit_events::Migration),
        ]
    }
}
