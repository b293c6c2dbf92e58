//! Audit/log sink for structured sync-core events.
//!
//! Every failure caught at a detached execution boundary is written here
//! with its full error text, keyed by the owning job/session/run, so the
//! client-facing error can stay generic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::audit_event::{ActiveModel, Column, Entity, Model};
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// One structured audit event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub module: String,
    pub action: String,
    pub severity: Severity,
    pub message: String,
    pub context: Value,
}

impl AuditEvent {
    pub fn new(module: &str, action: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            action: action.to_string(),
            severity,
            message: message.into(),
            context: Value::Object(Default::default()),
        }
    }

    /// Merges `context` into the event context. Non-object values are stored under `value`.
    pub fn with_context(mut self, context: Value) -> Self {
        let Value::Object(target) = &mut self.context else {
            return self;
        };
        match context {
            Value::Object(map) => target.extend(map),
            other => {
                target.insert("value".to_string(), other);
            }
        }
        self
    }

    /// Attaches the active execution context, if any, under `execution`.
    fn with_execution_context(mut self) -> Self {
        if let Some(ctx) = telemetry::current_execution_context()
            && let Value::Object(target) = &mut self.context
            && !target.contains_key("execution")
        {
            target.insert("execution".to_string(), ctx.to_json());
        }
        self
    }
}

/// Accepts structured events. Recording never fails the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

fn emit_tracing(event: &AuditEvent) {
    match event.severity {
        Severity::Info => tracing::info!(
            module = %event.module,
            action = %event.action,
            context = %event.context,
            "{}",
            event.message
        ),
        Severity::Warning => tracing::warn!(
            module = %event.module,
            action = %event.action,
            context = %event.context,
            "{}",
            event.message
        ),
        Severity::Error => tracing::error!(
            module = %event.module,
            action = %event.action,
            context = %event.context,
            "{}",
            event.message
        ),
    }
}

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        emit_tracing(&event.with_execution_context());
    }
}

/// Sink persisting to `audit_events` and mirroring to tracing
#[derive(Debug, Clone)]
pub struct DbAuditSink {
    db: Arc<DatabaseConnection>,
}

impl DbAuditSink {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Most recent events for `module`, newest first
    pub async fn recent(&self, module: &str, limit: u64) -> CoreResult<Vec<Model>> {
        Ok(Entity::find()
            .filter(Column::Module.eq(module))
            .order_by_desc(Column::OccurredAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?)
    }
}

#[async_trait]
impl AuditSink for DbAuditSink {
    async fn record(&self, event: AuditEvent) {
        let event = event.with_execution_context();
        emit_tracing(&event);

        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            module: Set(event.module.clone()),
            action: Set(event.action.clone()),
            severity: Set(event.severity.as_str().to_string()),
            message: Set(event.message.clone()),
            context: Set(Some(event.context)),
            occurred_at: Set(Utc::now().fixed_offset()),
        };
        if let Err(err) = row.insert(self.db.as_ref()).await {
            tracing::error!(error = %err, module = %event.module, action = %event.action, "failed to persist audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ExecutionContext, with_execution_context};
    use serde_json::json;

    #[test]
    fn context_merges_objects_and_wraps_scalars() {
        let event = AuditEvent::new("scheduler", "fire", Severity::Info, "fired")
            .with_context(json!({"job_id": "sync_accounts"}))
            .with_context(json!(3));
        assert_eq!(event.context, json!({"job_id": "sync_accounts", "value": 3}));
    }

    #[tokio::test]
    async fn execution_context_is_attached_inside_scope() {
        let ctx = ExecutionContext::for_job("collect_capacity");
        let event = with_execution_context(ctx, async {
            AuditEvent::new("bridge", "failed", Severity::Error, "boom").with_execution_context()
        })
        .await;
        assert_eq!(event.context["execution"]["job_id"], "collect_capacity");
    }

    #[tokio::test]
    async fn db_sink_persists_newest_first() {
        use migration::{Migrator, MigratorTrait};

        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let sink = DbAuditSink::new(Arc::new(db));

        sink.record(AuditEvent::new("sync_session", "opened", Severity::Info, "opened"))
            .await;
        sink.record(AuditEvent::new("sync_session", "failed", Severity::Error, "boom"))
            .await;
        TracingAuditSink
            .record(AuditEvent::new("sync_session", "ignored", Severity::Warning, "log only"))
            .await;

        let events = sink.recent("sync_session", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "failed");
        assert_eq!(events[0].severity, "error");
        assert!(sink.recent("task_run", 10).await.unwrap().is_empty());
    }
}
