//! Test utilities for database testing.
//!
//! In-memory SQLite with every migration applied, plus fixtures for
//! instances served by the static adapter and a fully wired sync core.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use fleetsync::adapters::{AdapterRegistry, STATIC_DIALECT};
use fleetsync::audit::{AuditEvent, AuditSink};
use fleetsync::bridge::BackgroundBridge;
use fleetsync::models::instance;
use fleetsync::pipeline::CollectionPipeline;
use fleetsync::repositories::{DbCollectionStore, DbInstanceRegistry};
use fleetsync::runs::RunTracker;
use fleetsync::sessions::SyncSessionService;
use fleetsync::tasks::TaskRunner;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection, Set, Statement};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    // Fixtures insert records for instances that may be removed afterwards.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Inserts an active instance with the given dialect and connection options.
pub async fn insert_instance(
    db: &DatabaseConnection,
    name: &str,
    db_type: &str,
    options: Option<Value>,
) -> Result<instance::Model> {
    let now = Utc::now().fixed_offset();
    let model = instance::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        db_type: Set(db_type.to_string()),
        host: Set(Some("db.internal".to_string())),
        port: Set(Some(5432)),
        is_active: Set(true),
        connection_options: Set(options),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Static instance that reports `items` in every sync category.
pub async fn insert_static_instance(
    db: &DatabaseConnection,
    name: &str,
    items: &[&str],
) -> Result<instance::Model> {
    insert_instance(
        db,
        name,
        STATIC_DIALECT,
        Some(json!({
            "inventory": {
                "account": items,
                "capacity": items,
                "aggregation": items,
            }
        })),
    )
    .await
}

/// Static instance whose `connect` reports unreachable.
pub async fn insert_unreachable_instance(
    db: &DatabaseConnection,
    name: &str,
) -> Result<instance::Model> {
    insert_instance(db, name, STATIC_DIALECT, Some(json!({ "reachable": false }))).await
}

/// Audit sink that keeps events in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions(&self, module: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.module == module)
            .map(|e| e.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Session service over the real pipeline, static adapter and DB stores.
pub fn session_service(
    db: Arc<DatabaseConnection>,
    audit: Arc<MemoryAuditSink>,
) -> SyncSessionService {
    let store = Arc::new(DbCollectionStore::new(db.clone()));
    let pipeline = CollectionPipeline::new(AdapterRegistry::with_builtin(), store)
        .with_step_timeout_seconds(5);
    SyncSessionService::new(
        db.clone(),
        Arc::new(DbInstanceRegistry::new(db)),
        Arc::new(pipeline),
        audit,
    )
}

pub fn run_tracker(db: Arc<DatabaseConnection>, audit: Arc<MemoryAuditSink>) -> RunTracker {
    RunTracker::new(db, audit)
}

/// Built-in job handlers over the same database and audit sink.
pub fn task_runner(db: Arc<DatabaseConnection>, audit: Arc<MemoryAuditSink>) -> TaskRunner {
    TaskRunner::new(
        session_service(db.clone(), audit.clone()),
        run_tracker(db.clone(), audit.clone()),
        BackgroundBridge::new(audit),
        Arc::new(DbInstanceRegistry::new(db.clone())),
        Arc::new(DbCollectionStore::new(db)),
    )
}
