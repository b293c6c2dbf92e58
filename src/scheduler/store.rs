//! Durable job store over `scheduler_jobs`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::debug;

use super::job::{JobSpec, check_column_range};
use crate::error::{CoreError, CoreResult};
use crate::models::scheduler_job::{ActiveModel, Column, Entity as SchedulerJob, Model};

/// Where a job definition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Default,
    Config,
    Api,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Default => "default",
            JobSource::Config => "config",
            JobSource::Api => "api",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    db: Arc<DatabaseConnection>,
}

impl JobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> CoreResult<Vec<Model>> {
        Ok(SchedulerJob::find()
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn list_unpaused(&self) -> CoreResult<Vec<Model>> {
        Ok(SchedulerJob::find()
            .filter(Column::Paused.eq(false))
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<Model>> {
        Ok(SchedulerJob::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn require(&self, id: &str) -> CoreResult<Model> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::not_found("scheduler job", id))
    }

    pub async fn count(&self) -> CoreResult<u64> {
        Ok(SchedulerJob::find().count(self.db.as_ref()).await?)
    }

    /// Inserts or updates the definition for `spec.id`.
    ///
    /// An existing row keeps its paused flag, history and creation time.
    pub async fn upsert(
        &self,
        spec: &JobSpec,
        source: JobSource,
        default_grace_seconds: u64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> CoreResult<Model> {
        spec.validate()?;
        let now = Utc::now().fixed_offset();
        let grace = check_column_range(
            &spec.id,
            "misfire_grace_seconds",
            spec.misfire_grace_seconds.unwrap_or(default_grace_seconds),
        )?;
        let max_instances = check_column_range(&spec.id, "max_instances", spec.max_instances.into())?;
        let jitter = spec
            .jitter_seconds
            .map(|j| check_column_range(&spec.id, "jitter_seconds", j.into()))
            .transpose()?;

        match self.get(&spec.id).await? {
            Some(existing) => {
                let paused = existing.paused;
                let mut active: ActiveModel = existing.into();
                active.name = Set(spec.display_name());
                active.function_name = Set(spec.function.as_str().to_string());
                active.trigger_spec = Set(spec.trigger.to_json());
                active.kwargs = Set(spec.kwargs.clone());
                active.misfire_grace_seconds = Set(grace);
                active.max_instances = Set(max_instances);
                active.coalesce_missed = Set(spec.coalesce);
                active.jitter_seconds = Set(jitter);
                active.source = Set(source.as_str().to_string());
                active.next_run_at = Set(if paused {
                    None
                } else {
                    next_run_at.map(|t| t.fixed_offset())
                });
                active.updated_at = Set(now);
                debug!(job_id = %spec.id, "updating scheduler job");
                Ok(active.update(self.db.as_ref()).await?)
            }
            None => {
                debug!(job_id = %spec.id, "inserting scheduler job");
                Ok(ActiveModel {
                    id: Set(spec.id.clone()),
                    name: Set(spec.display_name()),
                    function_name: Set(spec.function.as_str().to_string()),
                    trigger_spec: Set(spec.trigger.to_json()),
                    kwargs: Set(spec.kwargs.clone()),
                    misfire_grace_seconds: Set(grace),
                    max_instances: Set(max_instances),
                    coalesce_missed: Set(spec.coalesce),
                    jitter_seconds: Set(jitter),
                    paused: Set(spec.paused),
                    source: Set(source.as_str().to_string()),
                    next_run_at: Set(if spec.paused {
                        None
                    } else {
                        next_run_at.map(|t| t.fixed_offset())
                    }),
                    last_run_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?)
            }
        }
    }

    pub async fn set_paused(
        &self,
        id: &str,
        paused: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> CoreResult<Model> {
        let existing = self.require(id).await?;
        let mut active: ActiveModel = existing.into();
        active.paused = Set(paused);
        active.next_run_at = Set(next_run_at.map(|t| t.fixed_offset()));
        active.updated_at = Set(Utc::now().fixed_offset());
        Ok(active.update(self.db.as_ref()).await?)
    }

    /// Stores the next fire time and, when a firing was dispatched, the dispatch time.
    pub async fn record_tick(
        &self,
        id: &str,
        next_run_at: Option<DateTime<Utc>>,
        dispatched_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        let mut active = ActiveModel {
            id: Set(id.to_string()),
            next_run_at: Set(next_run_at.map(|t| t.fixed_offset())),
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };
        if let Some(at) = dispatched_at {
            active.last_run_at = Set(Some(at.fixed_offset()));
        }
        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> CoreResult<bool> {
        let result = SchedulerJob::delete_by_id(id.to_string())
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }
}
