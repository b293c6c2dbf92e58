//! # Run Tracker
//!
//! Bookkeeping for jobs that do not fan out into a sync session. A run uses
//! the session vocabulary (`running/completed/failed/cancelled`) and the same
//! cancellation contract; optional run items give per-unit progress.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, Severity};
use crate::bridge::{FailureFinalizer, FailureReport};
use crate::error::{CoreError, CoreResult};
use crate::models::task_run::{
    ActiveModel as RunActiveModel, Column as RunColumn, Entity as TaskRun, Model as RunModel,
};
use crate::models::task_run_item::{
    ActiveModel as ItemActiveModel, Column as ItemColumn, Entity as TaskRunItem,
    Model as ItemModel,
};
use crate::models::{ItemStatus, RunStatus, TriggerSource};
use crate::pagination::{Page, PageRequest};
use crate::payload;

const AUDIT_MODULE: &str = "task_run";

#[derive(Debug, Clone)]
pub struct NewRun {
    pub task_key: String,
    pub task_name: String,
    pub task_category: String,
    pub trigger_source: TriggerSource,
    pub created_by: Option<String>,
    pub summary: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewRunItem {
    pub item_type: String,
    pub item_key: String,
    pub item_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    pub task_key: Option<String>,
    pub task_category: Option<String>,
    pub status: Option<RunStatus>,
    pub trigger_source: Option<TriggerSource>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: RunModel,
    pub items: Vec<ItemModel>,
}

#[derive(Clone)]
pub struct RunTracker {
    db: Arc<DatabaseConnection>,
    audit: Arc<dyn AuditSink>,
}

impl RunTracker {
    pub fn new(db: Arc<DatabaseConnection>, audit: Arc<dyn AuditSink>) -> Self {
        Self { db, audit }
    }

    /// Opens a run in `running` and returns its id.
    pub async fn start_run(&self, request: NewRun) -> CoreResult<Uuid> {
        if request.task_key.trim().is_empty() {
            return Err(CoreError::Validation("task_key must not be empty".into()));
        }
        let summary = payload::normalize(request.summary, "task_run")?;
        let now = Utc::now().fixed_offset();
        let run_id = Uuid::new_v4();

        RunActiveModel {
            id: Set(run_id),
            task_key: Set(request.task_key.clone()),
            task_name: Set(request.task_name.clone()),
            task_category: Set(request.task_category.clone()),
            trigger_source: Set(request.trigger_source.as_str().to_string()),
            status: Set(RunStatus::Running.as_str().to_string()),
            created_by: Set(request.created_by.clone()),
            summary_json: Set(summary),
            result_url: Set(None),
            error_message: Set(None),
            progress_total: Set(0),
            progress_completed: Set(0),
            progress_failed: Set(0),
            started_at: Set(now),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        info!(
            run_id = %run_id,
            task_key = %request.task_key,
            trigger_source = request.trigger_source.as_str(),
            created_by = request.created_by.as_deref().unwrap_or(""),
            "task run started"
        );
        self.audit
            .record(
                AuditEvent::new(AUDIT_MODULE, "started", Severity::Info, "task run started")
                    .with_context(json!({
                        "run_id": run_id,
                        "task_key": request.task_key,
                        "trigger_source": request.trigger_source,
                        "created_by": request.created_by,
                    })),
            )
            .await;
        Ok(run_id)
    }

    /// Adds `pending` items to a running run.
    pub async fn add_items(&self, run_id: Uuid, items: Vec<NewRunItem>) -> CoreResult<Vec<ItemModel>> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Running.as_str() {
            return Err(CoreError::Conflict(format!(
                "run {run_id} is {} and cannot accept items",
                run.status
            )));
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().fixed_offset();
        let models: Vec<ItemModel> = items
            .into_iter()
            .map(|item| ItemModel {
                id: Uuid::new_v4(),
                run_id,
                item_type: item.item_type,
                item_key: item.item_key,
                item_name: item.item_name,
                status: ItemStatus::Pending.as_str().to_string(),
                started_at: None,
                completed_at: None,
                metrics_json: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let rows = models.iter().cloned().map(|m| ItemActiveModel {
            id: Set(m.id),
            run_id: Set(m.run_id),
            item_type: Set(m.item_type),
            item_key: Set(m.item_key),
            item_name: Set(m.item_name),
            status: Set(m.status),
            started_at: Set(None),
            completed_at: Set(None),
            metrics_json: Set(None),
            error_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        });
        TaskRunItem::insert_many(rows).exec(self.db.as_ref()).await?;
        self.refresh_progress(run_id).await?;
        Ok(models)
    }

    /// `pending → running`; false if the item was not pending.
    pub async fn start_item(&self, item_id: Uuid) -> CoreResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = TaskRunItem::update_many()
            .set(ItemActiveModel {
                status: Set(ItemStatus::Running.as_str().to_string()),
                started_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(ItemColumn::Id.eq(item_id))
            .filter(ItemColumn::Status.eq(ItemStatus::Pending.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `running → completed`; false if the item was not running.
    pub async fn complete_item(&self, item_id: Uuid, metrics: Option<Value>) -> CoreResult<bool> {
        let metrics = payload::normalize(metrics, "task_run_item")?;
        let now = Utc::now().fixed_offset();
        let result = TaskRunItem::update_many()
            .set(ItemActiveModel {
                status: Set(ItemStatus::Completed.as_str().to_string()),
                completed_at: Set(Some(now)),
                metrics_json: Set(metrics),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(ItemColumn::Id.eq(item_id))
            .filter(ItemColumn::Status.eq(ItemStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;
        self.after_item_transition(item_id, result.rows_affected).await
    }

    /// `running → failed`; false if the item was not running.
    pub async fn fail_item(&self, item_id: Uuid, error: &str, metrics: Option<Value>) -> CoreResult<bool> {
        let metrics = payload::normalize(metrics, "task_run_item")?;
        let now = Utc::now().fixed_offset();
        let result = TaskRunItem::update_many()
            .set(ItemActiveModel {
                status: Set(ItemStatus::Failed.as_str().to_string()),
                completed_at: Set(Some(now)),
                metrics_json: Set(metrics),
                error_message: Set(Some(error.to_string())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(ItemColumn::Id.eq(item_id))
            .filter(ItemColumn::Status.eq(ItemStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;
        self.after_item_transition(item_id, result.rows_affected).await
    }

    async fn after_item_transition(&self, item_id: Uuid, rows_affected: u64) -> CoreResult<bool> {
        if rows_affected != 1 {
            return Ok(false);
        }
        let item = TaskRunItem::find_by_id(item_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| CoreError::not_found("task run item", item_id))?;
        self.refresh_progress(item.run_id).await?;
        Ok(true)
    }

    async fn refresh_progress(&self, run_id: Uuid) -> CoreResult<()> {
        let total = self.count_items(run_id, None).await?;
        let completed = self.count_items(run_id, Some(ItemStatus::Completed)).await?;
        let failed = self.count_items(run_id, Some(ItemStatus::Failed)).await?;
        TaskRun::update_many()
            .col_expr(RunColumn::ProgressTotal, Expr::value(total as i32))
            .col_expr(RunColumn::ProgressCompleted, Expr::value(completed as i32))
            .col_expr(RunColumn::ProgressFailed, Expr::value(failed as i32))
            .col_expr(RunColumn::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(RunColumn::Id.eq(run_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn count_items(&self, run_id: Uuid, status: Option<ItemStatus>) -> CoreResult<u64> {
        let mut query = TaskRunItem::find().filter(ItemColumn::RunId.eq(run_id));
        if let Some(status) = status {
            query = query.filter(ItemColumn::Status.eq(status.as_str()));
        }
        Ok(query.count(self.db.as_ref()).await?)
    }

    /// Current status, for cooperative cancellation checks between items.
    pub async fn run_status(&self, run_id: Uuid) -> CoreResult<RunStatus> {
        let run = self.get_run(run_id).await?;
        run.status
            .parse()
            .map_err(|e: crate::models::UnknownVariant| CoreError::Unexpected(e.to_string()))
    }

    /// `running → completed`, merging `summary` into the stored summary.
    ///
    /// A run that was cancelled meanwhile stays cancelled.
    pub async fn complete_run(&self, run_id: Uuid, summary: Option<Value>) -> CoreResult<RunModel> {
        let run = self.get_run(run_id).await?;
        let summary = match (run.summary_json.clone(), summary) {
            (Some(Value::Object(mut base)), Some(Value::Object(extra))) => {
                base.extend(extra);
                Some(Value::Object(base))
            }
            (base, None) => base,
            (_, extra) => extra,
        };
        let summary = payload::normalize(summary, "task_run")?;
        self.refresh_progress(run_id).await?;

        let now = Utc::now().fixed_offset();
        let result = TaskRun::update_many()
            .set(RunActiveModel {
                status: Set(RunStatus::Completed.as_str().to_string()),
                summary_json: Set(summary),
                completed_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RunColumn::Id.eq(run_id))
            .filter(RunColumn::Status.eq(RunStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        let run = self.get_run(run_id).await?;
        if result.rows_affected == 1 {
            info!(
                run_id = %run_id,
                task_key = %run.task_key,
                completed = run.progress_completed,
                failed = run.progress_failed,
                "task run completed"
            );
            self.audit
                .record(
                    AuditEvent::new(AUDIT_MODULE, "completed", Severity::Info, "task run completed")
                        .with_context(json!({
                            "run_id": run_id,
                            "task_key": run.task_key,
                            "progress_completed": run.progress_completed,
                            "progress_failed": run.progress_failed,
                        })),
                )
                .await;
        }
        Ok(run)
    }

    /// Fails a running run and every item that has not finished.
    ///
    /// Idempotent; terminal runs are left as they are.
    pub async fn fail_run(&self, run_id: Uuid, reason: &str) -> CoreResult<RunModel> {
        self.get_run(run_id).await?;
        let now = Utc::now().fixed_offset();
        let result = TaskRun::update_many()
            .set(RunActiveModel {
                status: Set(RunStatus::Failed.as_str().to_string()),
                error_message: Set(Some(reason.to_string())),
                completed_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RunColumn::Id.eq(run_id))
            .filter(RunColumn::Status.eq(RunStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 1 {
            TaskRunItem::update_many()
                .set(ItemActiveModel {
                    status: Set(ItemStatus::Failed.as_str().to_string()),
                    completed_at: Set(Some(now)),
                    error_message: Set(Some(format!("result missing: {reason}"))),
                    updated_at: Set(now),
                    ..Default::default()
                })
                .filter(ItemColumn::RunId.eq(run_id))
                .filter(
                    Condition::any()
                        .add(ItemColumn::Status.eq(ItemStatus::Pending.as_str()))
                        .add(ItemColumn::Status.eq(ItemStatus::Running.as_str())),
                )
                .exec(self.db.as_ref())
                .await?;
            self.refresh_progress(run_id).await?;

            warn!(run_id = %run_id, error = reason, "task run failed");
            self.audit
                .record(
                    AuditEvent::new(AUDIT_MODULE, "failed", Severity::Error, reason)
                        .with_context(json!({ "run_id": run_id })),
                )
                .await;
        }
        self.get_run(run_id).await
    }

    /// Cancels a running run. Returns false if it was already terminal.
    pub async fn cancel_run(&self, run_id: Uuid) -> CoreResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = TaskRun::update_many()
            .set(RunActiveModel {
                status: Set(RunStatus::Cancelled.as_str().to_string()),
                completed_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RunColumn::Id.eq(run_id))
            .filter(RunColumn::Status.eq(RunStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            self.get_run(run_id).await?;
            return Ok(false);
        }

        let skipped = TaskRunItem::update_many()
            .set(ItemActiveModel {
                status: Set(ItemStatus::Cancelled.as_str().to_string()),
                completed_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(ItemColumn::RunId.eq(run_id))
            .filter(ItemColumn::Status.eq(ItemStatus::Pending.as_str()))
            .exec(self.db.as_ref())
            .await?;
        self.refresh_progress(run_id).await?;

        info!(run_id = %run_id, skipped_items = skipped.rows_affected, "task run cancelled");
        self.audit
            .record(
                AuditEvent::new(AUDIT_MODULE, "cancelled", Severity::Warning, "task run cancelled")
                    .with_context(json!({
                        "run_id": run_id,
                        "skipped_items": skipped.rows_affected,
                    })),
            )
            .await;
        Ok(true)
    }

    pub async fn get_run(&self, run_id: Uuid) -> CoreResult<RunModel> {
        TaskRun::find_by_id(run_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| CoreError::not_found("task run", run_id))
    }

    pub async fn get_run_detail(&self, run_id: Uuid) -> CoreResult<RunDetail> {
        let run = self.get_run(run_id).await?;
        let items = TaskRunItem::find()
            .filter(ItemColumn::RunId.eq(run_id))
            .order_by_asc(ItemColumn::CreatedAt)
            .order_by_asc(ItemColumn::ItemKey)
            .all(self.db.as_ref())
            .await?;
        Ok(RunDetail { run, items })
    }

    /// Runs newest first
    pub async fn list_runs(&self, filters: &RunFilters, page: PageRequest) -> CoreResult<Page<RunModel>> {
        let page = page.clamped();
        let mut condition = Condition::all();
        if let Some(task_key) = &filters.task_key {
            condition = condition.add(RunColumn::TaskKey.eq(task_key.clone()));
        }
        if let Some(category) = &filters.task_category {
            condition = condition.add(RunColumn::TaskCategory.eq(category.clone()));
        }
        if let Some(status) = filters.status {
            condition = condition.add(RunColumn::Status.eq(status.as_str()));
        }
        if let Some(source) = filters.trigger_source {
            condition = condition.add(RunColumn::TriggerSource.eq(source.as_str()));
        }
        if let Some(created_by) = &filters.created_by {
            condition = condition.add(RunColumn::CreatedBy.eq(created_by.clone()));
        }

        let paginator = TaskRun::find()
            .filter(condition)
            .order_by_desc(RunColumn::CreatedAt)
            .order_by_desc(RunColumn::Id)
            .paginate(self.db.as_ref(), page.per_page);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page.index()).await?;

        Ok(Page {
            items,
            total,
            page: page.page,
            per_page: page.per_page,
        })
    }

    /// Finalizer that fails `run_id` when its detached execution dies.
    pub fn finalizer(&self, run_id: Uuid) -> Arc<dyn FailureFinalizer> {
        Arc::new(RunFinalizer {
            tracker: self.clone(),
            run_id,
        })
    }
}

struct RunFinalizer {
    tracker: RunTracker,
    run_id: Uuid,
}

#[async_trait]
impl FailureFinalizer for RunFinalizer {
    async fn finalize(&self, report: &FailureReport) {
        let reason = format!("{}: {}", report.kind.as_str(), report.message);
        if let Err(err) = self.tracker.fail_run(self.run_id, &reason).await {
            error!(
                run_id = %self.run_id,
                error = %err,
                "failed to finalize task run after background failure"
            );
        }
    }
}
