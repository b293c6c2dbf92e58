//! # Built-in Job Handlers
//!
//! Maps each [`JobKind`] to its work. Fan-out kinds open a sync session;
//! the others are wrapped in a task run with one item per instance. The
//! owning session or run is created before the work is launched, so a
//! failure inside the detached context always has a row to finalize.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::{BackgroundBridge, TaskHandle};
use crate::error::{CoreError, CoreResult};
use crate::models::instance::Model as Instance;
use crate::models::{RunStatus, SyncCategory, SyncType, TriggerSource};
use crate::repositories::{CollectionStore, InstanceFilter, InstanceRegistry};
use crate::runs::{NewRun, NewRunItem, RunTracker};
use crate::scheduler::{JobArgs, JobDispatcher, JobKind};
use crate::sessions::{NewSession, SyncSessionService};
use crate::telemetry::ExecutionContext;

/// Result of classifying one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Classification {
    pub labels: Vec<String>,
    pub details: Option<Value>,
}

/// Classification rules, invoked once per instance by `auto_classify`.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, instance: &Instance) -> CoreResult<Classification>;
}

/// Labels instances by dialect and location only
#[derive(Debug, Clone, Copy, Default)]
pub struct DialectClassifier;

#[async_trait]
impl Classifier for DialectClassifier {
    async fn classify(&self, instance: &Instance) -> CoreResult<Classification> {
        let mut labels = vec![format!("dialect:{}", instance.db_type.to_ascii_lowercase())];
        match instance.host.as_deref() {
            Some("localhost") | Some("127.0.0.1") | Some("::1") => labels.push("local".into()),
            Some(_) => labels.push("remote".into()),
            None => {}
        }
        Ok(Classification {
            labels,
            details: None,
        })
    }
}

/// Dispatches built-in jobs onto the background bridge
#[derive(Clone)]
pub struct TaskRunner {
    sessions: SyncSessionService,
    runs: RunTracker,
    bridge: BackgroundBridge,
    instances: Arc<dyn InstanceRegistry>,
    store: Arc<dyn CollectionStore>,
    classifier: Arc<dyn Classifier>,
}

impl TaskRunner {
    pub fn new(
        sessions: SyncSessionService,
        runs: RunTracker,
        bridge: BackgroundBridge,
        instances: Arc<dyn InstanceRegistry>,
        store: Arc<dyn CollectionStore>,
    ) -> Self {
        Self {
            sessions,
            runs,
            bridge,
            instances,
            store,
            classifier: Arc::new(DialectClassifier),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    async fn launch_session(
        &self,
        job_id: &str,
        category: SyncCategory,
        args: JobArgs,
    ) -> CoreResult<TaskHandle> {
        let session = self
            .sessions
            .create_session(NewSession {
                sync_type: if args.manual_run {
                    SyncType::Manual
                } else {
                    SyncType::Scheduled
                },
                sync_category: category,
                created_by: args.created_by.clone(),
                filter: filter_for(&args),
            })
            .await?;

        let ctx = ExecutionContext::for_job(job_id)
            .with_session(session.id)
            .with_actor(args.created_by);
        let sessions = self.sessions.clone();
        let session_id = session.id;
        Ok(self.bridge.launch(
            "sync_session",
            ctx,
            async move { sessions.execute(session_id).await.map(|_| ()) },
            self.sessions.finalizer(session_id),
        ))
    }

    async fn launch_run(&self, job_id: &str, kind: JobKind, args: JobArgs) -> CoreResult<TaskHandle> {
        let run_id = self
            .runs
            .start_run(NewRun {
                task_key: job_id.to_string(),
                task_name: kind.display_name().to_string(),
                task_category: run_category(kind).to_string(),
                trigger_source: if args.manual_run {
                    TriggerSource::Manual
                } else {
                    TriggerSource::Scheduled
                },
                created_by: args.created_by.clone(),
                summary: Some(json!({ "function": kind.as_str() })),
            })
            .await?;

        let ctx = ExecutionContext::for_job(job_id)
            .with_run(run_id)
            .with_actor(args.created_by.clone());
        let this = self.clone();
        let filter = filter_for(&args);
        Ok(self.bridge.launch(
            "task_run",
            ctx,
            async move { this.execute_run(kind, run_id, filter).await },
            self.runs.finalizer(run_id),
        ))
    }

    /// One run item per active instance; item failures do not fail the run.
    async fn execute_run(&self, kind: JobKind, run_id: Uuid, filter: InstanceFilter) -> CoreResult<()> {
        let targets = self.instances.list_active(&filter).await?;
        let items = self
            .runs
            .add_items(
                run_id,
                targets
                    .iter()
                    .map(|instance| NewRunItem {
                        item_type: "instance".into(),
                        item_key: instance.id.to_string(),
                        item_name: Some(instance.name.clone()),
                    })
                    .collect(),
            )
            .await?;

        let mut processed = 0usize;
        for (instance, item) in targets.iter().zip(items.iter()) {
            if self.runs.run_status(run_id).await? != RunStatus::Running {
                info!(run_id = %run_id, "run no longer running; stopping before next item");
                break;
            }
            if !self.runs.start_item(item.id).await? {
                continue;
            }
            match self.process_instance(kind, instance).await {
                Ok(metrics) => {
                    self.runs.complete_item(item.id, Some(metrics)).await?;
                }
                Err(err) => {
                    warn!(
                        run_id = %run_id,
                        instance_id = %instance.id,
                        error = %err,
                        "run item failed"
                    );
                    self.runs.fail_item(item.id, &err.to_string(), None).await?;
                }
            }
            processed += 1;
        }

        self.runs
            .complete_run(
                run_id,
                Some(json!({ "instances": targets.len(), "processed": processed })),
            )
            .await?;
        Ok(())
    }

    async fn process_instance(&self, kind: JobKind, instance: &Instance) -> CoreResult<Value> {
        match kind {
            JobKind::AggregateCapacity => {
                let summary = self
                    .store
                    .recompute_aggregate(instance.id, SyncCategory::Capacity)
                    .await?;
                Ok(json!({
                    "active_items": summary.active_items,
                    "collected_items": summary.collected_items,
                }))
            }
            JobKind::AutoClassify => {
                let classification = self.classifier.classify(instance).await?;
                Ok(json!({
                    "labels": classification.labels,
                    "details": classification.details,
                }))
            }
            JobKind::SyncAccounts | JobKind::CollectCapacity => Err(
                CoreError::Unexpected(format!("{kind} is not a run-tracked job")),
            ),
        }
    }
}

#[async_trait]
impl JobDispatcher for TaskRunner {
    async fn dispatch(&self, job_id: &str, kind: JobKind, args: JobArgs) -> CoreResult<TaskHandle> {
        match kind {
            JobKind::SyncAccounts => self.launch_session(job_id, SyncCategory::Account, args).await,
            JobKind::CollectCapacity => {
                self.launch_session(job_id, SyncCategory::Capacity, args).await
            }
            JobKind::AggregateCapacity | JobKind::AutoClassify => {
                self.launch_run(job_id, kind, args).await
            }
        }
    }
}

fn filter_for(args: &JobArgs) -> InstanceFilter {
    InstanceFilter {
        db_type: None,
        instance_ids: args.instance_ids.clone(),
    }
}

fn run_category(kind: JobKind) -> &'static str {
    match kind {
        JobKind::AggregateCapacity => "aggregation",
        JobKind::AutoClassify => "classification",
        JobKind::SyncAccounts => "account",
        JobKind::CollectCapacity => "capacity",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instance(host: Option<&str>) -> Instance {
        let now = Utc::now().fixed_offset();
        Instance {
            id: Uuid::new_v4(),
            name: "primary".into(),
            db_type: "PostgreSQL".into(),
            host: host.map(str::to_string),
            port: Some(5432),
            is_active: true,
            connection_options: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn dialect_classifier_labels_dialect_and_location() {
        let labels = DialectClassifier
            .classify(&instance(Some("127.0.0.1")))
            .await
            .unwrap()
            .labels;
        assert_eq!(labels, vec!["dialect:postgresql", "local"]);

        let labels = DialectClassifier
            .classify(&instance(None))
            .await
            .unwrap()
            .labels;
        assert_eq!(labels, vec!["dialect:postgresql"]);
    }
}
