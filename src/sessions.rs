//! # Sync Session Orchestrator
//!
//! Fans the collection pipeline out over a set of instances. A session is
//! opened with one `pending` record per target; [`SyncSessionService::execute`]
//! then walks the records, moving each `pending → running → completed|failed`
//! exactly once. Per-instance failures are absorbed into their record. A
//! failure of the loop itself force-fails every still-open record and fails
//! the session.
//!
//! Cancellation is cooperative: [`SyncSessionService::cancel_session`] flips
//! the session to `cancelled`; the loop checks the stored status before each
//! instance and stops, letting in-flight work finish.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, Severity};
use crate::bridge::{FailureFinalizer, FailureReport};
use crate::error::{CoreError, CoreResult};
use crate::models::instance::Model as Instance;
use crate::models::sync_instance_record::{
    ActiveModel as RecordActiveModel, Column as RecordColumn, Entity as SyncInstanceRecord,
    Model as RecordModel,
};
use crate::models::sync_session::{
    ActiveModel as SessionActiveModel, Column as SessionColumn, Entity as SyncSession,
    Model as SessionModel,
};
use crate::models::{RecordStatus, SessionStatus, SyncCategory, SyncType};
use crate::pagination::{Page, PageRequest};
use crate::payload;
use crate::pipeline::{CollectionPipeline, FailureStage, ItemCounts, PipelineFailure, PipelineOutcome};
use crate::repositories::{InstanceFilter, InstanceRegistry};

const AUDIT_MODULE: &str = "sync_session";

/// Executes the pipeline for one instance.
///
/// `Err` means the orchestration itself broke (not that the instance
/// failed) and escalates to failing the whole session.
#[async_trait]
pub trait InstanceRunner: Send + Sync {
    async fn run_instance(
        &self,
        instance: &Instance,
        category: SyncCategory,
    ) -> CoreResult<PipelineOutcome>;
}

#[async_trait]
impl InstanceRunner for CollectionPipeline {
    async fn run_instance(
        &self,
        instance: &Instance,
        category: SyncCategory,
    ) -> CoreResult<PipelineOutcome> {
        Ok(self.run(instance, category).await)
    }
}

/// Parameters for opening a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub sync_type: SyncType,
    pub sync_category: SyncCategory,
    pub created_by: Option<String>,
    pub filter: InstanceFilter,
}

/// Listing filters; `None` matches everything
#[derive(Debug, Clone, Default)]
pub struct SessionFilters {
    pub sync_type: Option<SyncType>,
    pub sync_category: Option<SyncCategory>,
    pub status: Option<SessionStatus>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub session: SessionModel,
    pub records: Vec<RecordModel>,
}

/// Owns the lifecycle of sync sessions and their instance records
#[derive(Clone)]
pub struct SyncSessionService {
    db: Arc<DatabaseConnection>,
    instances: Arc<dyn InstanceRegistry>,
    runner: Arc<dyn InstanceRunner>,
    audit: Arc<dyn AuditSink>,
}

impl SyncSessionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        instances: Arc<dyn InstanceRegistry>,
        runner: Arc<dyn InstanceRunner>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            db,
            instances,
            runner,
            audit,
        }
    }

    /// Opens a session over every active instance matching `request.filter`.
    ///
    /// A session with no targets is completed immediately.
    pub async fn create_session(&self, request: NewSession) -> CoreResult<SessionModel> {
        let targets = self.instances.list_active(&request.filter).await?;
        let now = Utc::now().fixed_offset();
        let session_id = Uuid::new_v4();
        let total = targets.len() as i32;

        let txn = self.db.begin().await?;
        SessionActiveModel {
            id: Set(session_id),
            sync_type: Set(request.sync_type.as_str().to_string()),
            sync_category: Set(request.sync_category.as_str().to_string()),
            status: Set(SessionStatus::Running.as_str().to_string()),
            total_instances: Set(total),
            successful_instances: Set(0),
            failed_instances: Set(0),
            created_by: Set(request.created_by.clone()),
            error_message: Set(None),
            started_at: Set(now),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        if !targets.is_empty() {
            let records = targets.iter().map(|instance| RecordActiveModel {
                id: Set(Uuid::new_v4()),
                session_id: Set(session_id),
                instance_id: Set(instance.id),
                instance_name: Set(instance.name.clone()),
                status: Set(RecordStatus::Pending.as_str().to_string()),
                started_at: Set(None),
                completed_at: Set(None),
                items_synced: Set(0),
                items_created: Set(0),
                items_updated: Set(0),
                items_deleted: Set(0),
                error_message: Set(None),
                sync_details: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            });
            SyncInstanceRecord::insert_many(records).exec(&txn).await?;
        }
        txn.commit().await?;

        info!(
            session_id = %session_id,
            sync_type = request.sync_type.as_str(),
            category = %request.sync_category,
            total_instances = total,
            created_by = request.created_by.as_deref().unwrap_or(""),
            "sync session opened"
        );
        self.audit
            .record(
                AuditEvent::new(AUDIT_MODULE, "opened", Severity::Info, "sync session opened")
                    .with_context(json!({
                        "session_id": session_id,
                        "sync_type": request.sync_type,
                        "sync_category": request.sync_category,
                        "total_instances": total,
                        "created_by": request.created_by,
                    })),
            )
            .await;

        if total == 0 {
            return self.finalize(session_id).await;
        }
        self.get_session(session_id).await
    }

    /// Drives every pending record of the session through the pipeline.
    ///
    /// Instances run one at a time. Returns the final session row, or the
    /// loop error after the session has been failed.
    pub async fn execute(&self, session_id: Uuid) -> CoreResult<SessionModel> {
        let session = self.get_session(session_id).await?;
        if session.session_status().is_terminal() {
            info!(session_id = %session_id, status = %session.status, "session already terminal");
            return Ok(session);
        }
        let category: SyncCategory = session
            .sync_category
            .parse()
            .map_err(|e: crate::models::UnknownVariant| CoreError::Validation(e.to_string()))?;

        match self.drive(session_id, category).await {
            Ok(()) => self.finalize(session_id).await,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "sync session loop failed");
                self.fail_session(session_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn drive(&self, session_id: Uuid, category: SyncCategory) -> CoreResult<()> {
        let pending = SyncInstanceRecord::find()
            .filter(RecordColumn::SessionId.eq(session_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Pending.as_str()))
            .order_by_asc(RecordColumn::InstanceName)
            .order_by_asc(RecordColumn::Id)
            .all(self.db.as_ref())
            .await?;

        for record in pending {
            let status = self.current_status(session_id).await?;
            if status != SessionStatus::Running {
                info!(
                    session_id = %session_id,
                    status = status.as_str(),
                    "session no longer running; stopping before next instance"
                );
                break;
            }

            if !self.mark_record_running(record.id).await? {
                continue;
            }

            let outcome = match self.instances.get_by_id(record.instance_id).await? {
                Some(instance) => self.runner.run_instance(&instance, category).await?,
                None => missing_instance_outcome(&record, category),
            };

            self.record_outcome(record.id, &outcome).await?;
            self.refresh_counters(session_id).await?;
        }

        Ok(())
    }

    /// Moves a record `pending → running`. False if it was not pending.
    async fn mark_record_running(&self, record_id: Uuid) -> CoreResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = SyncInstanceRecord::update_many()
            .set(RecordActiveModel {
                status: Set(RecordStatus::Running.as_str().to_string()),
                started_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RecordColumn::Id.eq(record_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Pending.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Moves a record `running → completed|failed`. False if it was not running.
    async fn record_outcome(&self, record_id: Uuid, outcome: &PipelineOutcome) -> CoreResult<bool> {
        let now = Utc::now().fixed_offset();
        let details = payload::normalize(Some(outcome.details.clone()), "sync_instance_record")?;
        let status = if outcome.is_success() {
            RecordStatus::Completed
        } else {
            RecordStatus::Failed
        };

        let result = SyncInstanceRecord::update_many()
            .set(RecordActiveModel {
                status: Set(status.as_str().to_string()),
                completed_at: Set(Some(now)),
                items_synced: Set(outcome.counts.synced.max(0)),
                items_created: Set(outcome.counts.created.max(0)),
                items_updated: Set(outcome.counts.updated.max(0)),
                items_deleted: Set(outcome.counts.deleted.max(0)),
                error_message: Set(outcome.error_message()),
                sync_details: Set(details),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RecordColumn::Id.eq(record_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected != 1 {
            warn!(record_id = %record_id, "record left running state before its outcome was written");
        }
        Ok(result.rows_affected == 1)
    }

    /// Force-fails every open record with a synthetic error.
    async fn force_fail_open_records(&self, session_id: Uuid, reason: &str) -> CoreResult<u64> {
        let now = Utc::now().fixed_offset();
        let details = payload::normalize(
            Some(json!({ "outcome": "failed", "synthetic": true, "reason": reason })),
            "sync_instance_record",
        )?;

        let pending = SyncInstanceRecord::update_many()
            .set(RecordActiveModel {
                status: Set(RecordStatus::Failed.as_str().to_string()),
                started_at: Set(Some(now)),
                completed_at: Set(Some(now)),
                error_message: Set(Some(reason.to_string())),
                sync_details: Set(details.clone()),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RecordColumn::SessionId.eq(session_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Pending.as_str()))
            .exec(self.db.as_ref())
            .await?;

        let running = SyncInstanceRecord::update_many()
            .set(RecordActiveModel {
                status: Set(RecordStatus::Failed.as_str().to_string()),
                completed_at: Set(Some(now)),
                error_message: Set(Some(reason.to_string())),
                sync_details: Set(details),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RecordColumn::SessionId.eq(session_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        Ok(pending.rows_affected + running.rows_affected)
    }

    /// Rewrites the session counters from the record tallies.
    async fn refresh_counters(&self, session_id: Uuid) -> CoreResult<()> {
        let successful = self.count_records(session_id, RecordStatus::Completed).await?;
        let failed = self.count_records(session_id, RecordStatus::Failed).await?;
        SyncSession::update_many()
            .col_expr(SessionColumn::SuccessfulInstances, Expr::value(successful as i32))
            .col_expr(SessionColumn::FailedInstances, Expr::value(failed as i32))
            .col_expr(SessionColumn::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(SessionColumn::Id.eq(session_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn count_records(&self, session_id: Uuid, status: RecordStatus) -> CoreResult<u64> {
        Ok(SyncInstanceRecord::find()
            .filter(RecordColumn::SessionId.eq(session_id))
            .filter(RecordColumn::Status.eq(status.as_str()))
            .count(self.db.as_ref())
            .await?)
    }

    async fn current_status(&self, session_id: Uuid) -> CoreResult<SessionStatus> {
        Ok(self.get_session(session_id).await?.session_status())
    }

    /// Tallies counters and completes the session if it is still running.
    async fn finalize(&self, session_id: Uuid) -> CoreResult<SessionModel> {
        self.refresh_counters(session_id).await?;

        let now = Utc::now().fixed_offset();
        let completed = SyncSession::update_many()
            .col_expr(
                SessionColumn::Status,
                Expr::value(SessionStatus::Completed.as_str()),
            )
            .col_expr(SessionColumn::CompletedAt, Expr::value(now))
            .col_expr(SessionColumn::UpdatedAt, Expr::value(now))
            .filter(SessionColumn::Id.eq(session_id))
            .filter(SessionColumn::Status.eq(SessionStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        let session = self.get_session(session_id).await?;
        if completed.rows_affected == 1 {
            info!(
                session_id = %session_id,
                total = session.total_instances,
                successful = session.successful_instances,
                failed = session.failed_instances,
                "sync session completed"
            );
            self.audit
                .record(
                    AuditEvent::new(
                        AUDIT_MODULE,
                        "completed",
                        Severity::Info,
                        "sync session completed",
                    )
                    .with_context(json!({
                        "session_id": session_id,
                        "total_instances": session.total_instances,
                        "successful_instances": session.successful_instances,
                        "failed_instances": session.failed_instances,
                    })),
                )
                .await;
        }
        Ok(session)
    }

    /// Fails the session after an orchestration-level error.
    ///
    /// Open records are force-failed with a synthetic "result missing"
    /// error. Idempotent; a session that is already terminal keeps its
    /// status.
    pub async fn fail_session(&self, session_id: Uuid, reason: &str) -> CoreResult<SessionModel> {
        let message = format!("result missing: {reason}");
        let forced = self.force_fail_open_records(session_id, &message).await?;
        self.refresh_counters(session_id).await?;

        let now = Utc::now().fixed_offset();
        let failed = SyncSession::update_many()
            .col_expr(SessionColumn::Status, Expr::value(SessionStatus::Failed.as_str()))
            .col_expr(SessionColumn::ErrorMessage, Expr::value(reason.to_string()))
            .col_expr(SessionColumn::CompletedAt, Expr::value(now))
            .col_expr(SessionColumn::UpdatedAt, Expr::value(now))
            .filter(SessionColumn::Id.eq(session_id))
            .filter(SessionColumn::Status.eq(SessionStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        if failed.rows_affected == 1 || forced > 0 {
            warn!(
                session_id = %session_id,
                forced_records = forced,
                error = reason,
                "sync session failed"
            );
            self.audit
                .record(
                    AuditEvent::new(AUDIT_MODULE, "failed", Severity::Error, reason)
                        .with_context(json!({
                            "session_id": session_id,
                            "forced_records": forced,
                        })),
                )
                .await;
        }

        self.get_session(session_id).await
    }

    /// Cancels a running session. Returns false if it was already terminal.
    ///
    /// Records that have not started are failed as cancelled; a record in
    /// flight is left to finish.
    pub async fn cancel_session(&self, session_id: Uuid) -> CoreResult<bool> {
        let now = Utc::now().fixed_offset();
        let result = SyncSession::update_many()
            .col_expr(
                SessionColumn::Status,
                Expr::value(SessionStatus::Cancelled.as_str()),
            )
            .col_expr(SessionColumn::CompletedAt, Expr::value(now))
            .col_expr(SessionColumn::UpdatedAt, Expr::value(now))
            .filter(SessionColumn::Id.eq(session_id))
            .filter(SessionColumn::Status.eq(SessionStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            // Distinguish unknown ids from terminal sessions.
            self.get_session(session_id).await?;
            return Ok(false);
        }

        let pending = SyncInstanceRecord::update_many()
            .set(RecordActiveModel {
                status: Set(RecordStatus::Failed.as_str().to_string()),
                started_at: Set(Some(now)),
                completed_at: Set(Some(now)),
                error_message: Set(Some("session cancelled before this instance started".into())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(RecordColumn::SessionId.eq(session_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Pending.as_str()))
            .exec(self.db.as_ref())
            .await?;
        self.refresh_counters(session_id).await?;

        info!(
            session_id = %session_id,
            skipped_records = pending.rows_affected,
            "sync session cancelled"
        );
        self.audit
            .record(
                AuditEvent::new(AUDIT_MODULE, "cancelled", Severity::Warning, "sync session cancelled")
                    .with_context(json!({
                        "session_id": session_id,
                        "skipped_records": pending.rows_affected,
                    })),
            )
            .await;
        Ok(true)
    }

    pub async fn get_session(&self, session_id: Uuid) -> CoreResult<SessionModel> {
        SyncSession::find_by_id(session_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| CoreError::not_found("sync session", session_id))
    }

    pub async fn get_session_detail(&self, session_id: Uuid) -> CoreResult<SessionDetail> {
        let session = self.get_session(session_id).await?;
        let records = SyncInstanceRecord::find()
            .filter(RecordColumn::SessionId.eq(session_id))
            .order_by_asc(RecordColumn::InstanceName)
            .order_by_asc(RecordColumn::Id)
            .all(self.db.as_ref())
            .await?;
        Ok(SessionDetail { session, records })
    }

    /// Failed records of a session, in instance-name order
    pub async fn get_session_error_logs(&self, session_id: Uuid) -> CoreResult<Vec<RecordModel>> {
        self.get_session(session_id).await?;
        Ok(SyncInstanceRecord::find()
            .filter(RecordColumn::SessionId.eq(session_id))
            .filter(RecordColumn::Status.eq(RecordStatus::Failed.as_str()))
            .order_by_asc(RecordColumn::InstanceName)
            .all(self.db.as_ref())
            .await?)
    }

    /// Sessions newest first
    pub async fn list_sessions(
        &self,
        filters: &SessionFilters,
        page: PageRequest,
    ) -> CoreResult<Page<SessionModel>> {
        let page = page.clamped();
        let mut condition = Condition::all();
        if let Some(sync_type) = filters.sync_type {
            condition = condition.add(SessionColumn::SyncType.eq(sync_type.as_str()));
        }
        if let Some(category) = filters.sync_category {
            condition = condition.add(SessionColumn::SyncCategory.eq(category.as_str()));
        }
        if let Some(status) = filters.status {
            condition = condition.add(SessionColumn::Status.eq(status.as_str()));
        }
        if let Some(created_by) = &filters.created_by {
            condition = condition.add(SessionColumn::CreatedBy.eq(created_by.clone()));
        }

        let paginator = SyncSession::find()
            .filter(condition)
            .order_by_desc(SessionColumn::CreatedAt)
            .order_by_desc(SessionColumn::Id)
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

    /// Finalizer that fails `session_id` when its detached execution dies.
    pub fn finalizer(&self, session_id: Uuid) -> Arc<dyn FailureFinalizer> {
        Arc::new(SessionFinalizer {
            service: self.clone(),
            session_id,
        })
    }
}

struct SessionFinalizer {
    service: SyncSessionService,
    session_id: Uuid,
}

#[async_trait]
impl FailureFinalizer for SessionFinalizer {
    async fn finalize(&self, report: &FailureReport) {
        let reason = format!("{}: {}", report.kind.as_str(), report.message);
        if let Err(err) = self.service.fail_session(self.session_id, &reason).await {
            error!(
                session_id = %self.session_id,
                error = %err,
                "failed to finalize sync session after background failure"
            );
        }
    }
}

fn missing_instance_outcome(record: &RecordModel, category: SyncCategory) -> PipelineOutcome {
    let message = format!("instance {} is no longer registered", record.instance_id);
    PipelineOutcome {
        failure: Some(PipelineFailure {
            stage: FailureStage::Connect,
            message: message.clone(),
        }),
        counts: ItemCounts::default(),
        details: json!({
            "version": payload::CURRENT_VERSION,
            "category": category.as_str(),
            "instance_name": record.instance_name,
            "outcome": "failed",
            "failure": { "stage": "connect", "message": message },
        }),
    }
}
