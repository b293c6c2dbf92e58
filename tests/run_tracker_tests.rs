//! Integration tests for the generic run tracker.

use std::sync::Arc;

use anyhow::Result;
use fleetsync::bridge::{BackgroundBridge, TaskOutcome};
use fleetsync::error::CoreError;
use fleetsync::models::{ItemStatus, RunStatus, TriggerSource};
use fleetsync::pagination::PageRequest;
use fleetsync::runs::{NewRun, NewRunItem, RunFilters, RunTracker};
use fleetsync::telemetry::ExecutionContext;
use serde_json::json;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{MemoryAuditSink, run_tracker, setup_test_db_arc};

fn new_run(task_key: &str, source: TriggerSource) -> NewRun {
    NewRun {
        task_key: task_key.to_string(),
        task_name: "Capacity aggregation".to_string(),
        task_category: "aggregation".to_string(),
        trigger_source: source,
        created_by: Some("ops".to_string()),
        summary: Some(json!({ "requested": 2 })),
    }
}

fn items(keys: &[&str]) -> Vec<NewRunItem> {
    keys.iter()
        .map(|key| NewRunItem {
            item_type: "instance".into(),
            item_key: key.to_string(),
            item_name: Some(format!("instance {key}")),
        })
        .collect()
}

async fn tracker() -> Result<(RunTracker, Arc<MemoryAuditSink>)> {
    let db = setup_test_db_arc().await?;
    let audit = Arc::new(MemoryAuditSink::default());
    Ok((run_tracker(db, audit.clone()), audit))
}

#[tokio::test]
async fn items_drive_progress_and_run_completes() -> Result<()> {
    let (tracker, audit) = tracker().await?;
    let run_id = tracker
        .start_run(new_run("aggregate_capacity", TriggerSource::Manual))
        .await?;

    let run = tracker.get_run(run_id).await?;
    assert_eq!(run.status, RunStatus::Running.as_str());
    assert_eq!(run.summary_json, Some(json!({ "requested": 2, "version": 1 })));

    let added = tracker.add_items(run_id, items(&["a", "b"])).await?;
    assert_eq!(tracker.get_run(run_id).await?.progress_total, 2);

    assert!(tracker.start_item(added[0].id).await?);
    assert!(!tracker.start_item(added[0].id).await?, "start is one-shot");
    assert!(
        tracker
            .complete_item(added[0].id, Some(json!({ "active_items": 3 })))
            .await?
    );

    assert!(
        !tracker.complete_item(added[1].id, None).await?,
        "pending items must start before finishing"
    );
    assert!(tracker.start_item(added[1].id).await?);
    assert!(tracker.fail_item(added[1].id, "timeout", None).await?);

    let run = tracker
        .complete_run(run_id, Some(json!({ "processed": 2 })))
        .await?;
    assert_eq!(run.status, RunStatus::Completed.as_str());
    assert_eq!(run.progress_completed, 1);
    assert_eq!(run.progress_failed, 1);
    assert_eq!(
        run.summary_json,
        Some(json!({ "requested": 2, "processed": 2, "version": 1 }))
    );

    let detail = tracker.get_run_detail(run_id).await?;
    assert_eq!(detail.items.len(), 2);
    let first = detail.items.iter().find(|i| i.item_key == "a").unwrap();
    assert_eq!(first.metrics_json, Some(json!({ "active_items": 3, "version": 1 })));

    assert_eq!(audit.actions("task_run"), vec!["started", "completed"]);
    Ok(())
}

#[tokio::test]
async fn cancel_cancels_pending_items_and_is_idempotent() -> Result<()> {
    let (tracker, _audit) = tracker().await?;
    let run_id = tracker
        .start_run(new_run("auto_classify", TriggerSource::Api))
        .await?;
    let added = tracker.add_items(run_id, items(&["a", "b", "c"])).await?;
    assert!(tracker.start_item(added[0].id).await?);

    assert!(tracker.cancel_run(run_id).await?);
    let snapshot = tracker.get_run(run_id).await?;
    assert!(!tracker.cancel_run(run_id).await?);
    assert_eq!(tracker.get_run(run_id).await?, snapshot);

    let detail = tracker.get_run_detail(run_id).await?;
    let cancelled = detail
        .items
        .iter()
        .filter(|i| i.status == ItemStatus::Cancelled.as_str())
        .count();
    assert_eq!(cancelled, 2);

    // In-flight work may still finish, but the run stays cancelled.
    assert!(tracker.complete_item(added[0].id, None).await?);
    let run = tracker.complete_run(run_id, None).await?;
    assert_eq!(run.status, RunStatus::Cancelled.as_str());
    assert_eq!(tracker.run_status(run_id).await?, RunStatus::Cancelled);

    assert!(matches!(
        tracker.add_items(run_id, items(&["d"])).await,
        Err(CoreError::Conflict(_))
    ));
    assert!(matches!(
        tracker.cancel_run(Uuid::new_v4()).await,
        Err(CoreError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn detached_failure_fails_run_and_open_items() -> Result<()> {
    let (tracker, audit) = tracker().await?;
    let run_id = tracker
        .start_run(new_run("aggregate_capacity", TriggerSource::Scheduled))
        .await?;
    let added = tracker.add_items(run_id, items(&["a", "b"])).await?;
    assert!(tracker.start_item(added[0].id).await?);

    let bridge = BackgroundBridge::new(audit.clone());
    let handle = bridge.launch(
        "task_run",
        ExecutionContext::for_job("aggregate_capacity").with_run(run_id),
        async { Err(CoreError::Unexpected("aggregate query exploded".into())) },
        tracker.finalizer(run_id),
    );
    assert!(matches!(handle.wait().await, TaskOutcome::Failed(_)));

    let detail = tracker.get_run_detail(run_id).await?;
    assert_eq!(detail.run.status, RunStatus::Failed.as_str());
    assert!(
        detail
            .run
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("aggregate query exploded")
    );
    assert!(
        detail
            .items
            .iter()
            .all(|i| i.status == ItemStatus::Failed.as_str())
    );
    assert_eq!(detail.run.progress_failed, 2);

    // A second failure report changes nothing.
    let again = tracker.fail_run(run_id, "late duplicate").await?;
    assert_eq!(again.error_message, detail.run.error_message);
    Ok(())
}

#[tokio::test]
async fn list_runs_filters_by_source_and_key() -> Result<()> {
    let (tracker, _audit) = tracker().await?;
    tracker
        .start_run(new_run("aggregate_capacity", TriggerSource::Scheduled))
        .await?;
    tracker
        .start_run(new_run("aggregate_capacity", TriggerSource::Manual))
        .await?;
    tracker
        .start_run(new_run("auto_classify", TriggerSource::Manual))
        .await?;

    let manual = tracker
        .list_runs(
            &RunFilters {
                trigger_source: Some(TriggerSource::Manual),
                ..RunFilters::default()
            },
            PageRequest::default(),
        )
        .await?;
    assert_eq!(manual.total, 2);

    let aggregate = tracker
        .list_runs(
            &RunFilters {
                task_key: Some("aggregate_capacity".into()),
                status: Some(RunStatus::Running),
                ..RunFilters::default()
            },
            PageRequest::new(2, 1),
        )
        .await?;
    assert_eq!(aggregate.total, 2);
    assert_eq!(aggregate.items.len(), 1);
    assert_eq!(aggregate.page, 2);
    Ok(())
}

#[tokio::test]
async fn rejects_malformed_summary_versions() -> Result<()> {
    let (tracker, _audit) = tracker().await?;
    let mut request = new_run("aggregate_capacity", TriggerSource::Manual);
    request.summary = Some(json!({ "version": 2 }));
    assert!(matches!(
        tracker.start_run(request).await,
        Err(CoreError::Validation(_))
    ));
    Ok(())
}
