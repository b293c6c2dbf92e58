//! Integration tests for the sync session orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use fleetsync::bridge::{BackgroundBridge, TaskOutcome};
use fleetsync::error::{CoreError, CoreResult};
use fleetsync::models::instance::Model as Instance;
use fleetsync::models::{RecordStatus, SessionStatus, SyncCategory, SyncType};
use fleetsync::pagination::PageRequest;
use fleetsync::pipeline::{ItemCounts, PipelineOutcome};
use fleetsync::repositories::{DbInstanceRegistry, InstanceFilter};
use fleetsync::sessions::{InstanceRunner, NewSession, SessionFilters, SyncSessionService};
use fleetsync::telemetry::ExecutionContext;
use sea_orm::DatabaseConnection;
use serde_json::json;
use tokio::sync::Notify;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    MemoryAuditSink, insert_static_instance, insert_unreachable_instance, session_service,
    setup_test_db_arc,
};

fn manual(category: SyncCategory, created_by: &str) -> NewSession {
    NewSession {
        sync_type: SyncType::Manual,
        sync_category: category,
        created_by: Some(created_by.to_string()),
        filter: InstanceFilter::default(),
    }
}

fn success() -> PipelineOutcome {
    PipelineOutcome {
        failure: None,
        counts: ItemCounts {
            synced: 1,
            ..ItemCounts::default()
        },
        details: json!({ "version": 1, "outcome": "completed" }),
    }
}

fn service_with_runner(
    db: Arc<DatabaseConnection>,
    runner: Arc<dyn InstanceRunner>,
) -> (SyncSessionService, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::default());
    let service = SyncSessionService::new(
        db.clone(),
        Arc::new(DbInstanceRegistry::new(db)),
        runner,
        audit.clone(),
    );
    (service, audit)
}

#[tokio::test]
async fn unreachable_instance_fails_only_its_record() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_static_instance(&db, "alpha", &["orders", "billing"]).await?;
    insert_unreachable_instance(&db, "bravo").await?;
    insert_static_instance(&db, "charlie", &["app"]).await?;

    let audit = Arc::new(MemoryAuditSink::default());
    let service = session_service(db.clone(), audit.clone());

    let session = service
        .create_session(manual(SyncCategory::Account, "alice"))
        .await?;
    assert_eq!(session.total_instances, 3);
    assert_eq!(session.session_status(), SessionStatus::Running);

    let finished = service.execute(session.id).await?;
    assert_eq!(finished.session_status(), SessionStatus::Completed);
    assert_eq!(finished.successful_instances, 2);
    assert_eq!(finished.failed_instances, 1);
    assert!(finished.completed_at.is_some());

    let detail = service.get_session_detail(session.id).await?;
    let names: Vec<_> = detail
        .records
        .iter()
        .map(|r| (r.instance_name.as_str(), r.status.as_str()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("alpha", "completed"),
            ("bravo", "failed"),
            ("charlie", "completed")
        ]
    );

    let alpha = &detail.records[0];
    assert_eq!(alpha.items_created, 2);
    assert_eq!(alpha.items_synced, 2);
    assert!(alpha.started_at.is_some() && alpha.completed_at.is_some());

    let bravo = &detail.records[1];
    assert!(
        bravo
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with("connect failed")
    );
    let details = bravo.sync_details.as_ref().expect("diagnostics survive failure");
    assert_eq!(details["version"], 1);
    assert_eq!(details["steps"]["connect"]["status"], "unreachable");

    let errors = service.get_session_error_logs(session.id).await?;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].instance_name, "bravo");

    assert_eq!(audit.actions("sync_session"), vec!["opened", "completed"]);
    Ok(())
}

/// Fails the orchestration itself on the `fail_on`-th instance.
struct BreakingRunner {
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl InstanceRunner for BreakingRunner {
    async fn run_instance(&self, _: &Instance, _: SyncCategory) -> CoreResult<PipelineOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(CoreError::Unexpected("result store went away".into()));
        }
        Ok(success())
    }
}

#[tokio::test]
async fn loop_failure_force_fails_open_records() -> Result<()> {
    let db = setup_test_db_arc().await?;
    for name in ["a", "b", "c", "d", "e"] {
        insert_static_instance(&db, name, &["x"]).await?;
    }
    let (service, audit) = service_with_runner(
        db.clone(),
        Arc::new(BreakingRunner {
            calls: AtomicUsize::new(0),
            fail_on: 3,
        }),
    );

    let session = service
        .create_session(manual(SyncCategory::Capacity, "bob"))
        .await?;
    let err = service.execute(session.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Unexpected(_)));

    let detail = service.get_session_detail(session.id).await?;
    assert_eq!(detail.session.session_status(), SessionStatus::Failed);
    assert_eq!(detail.session.successful_instances, 2);
    assert_eq!(detail.session.failed_instances, 3);
    assert!(
        detail
            .session
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("result store went away")
    );

    for record in &detail.records[2..] {
        assert_eq!(record.status, RecordStatus::Failed.as_str());
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap_or_default()
                .starts_with("result missing")
        );
        assert!(record.started_at.is_some(), "no record skips running");
        assert_eq!(record.sync_details.as_ref().unwrap()["version"], 1);
    }

    assert!(audit.actions("sync_session").contains(&"failed".to_string()));
    Ok(())
}

/// Blocks inside the first instance until released.
struct GatedRunner {
    started: Arc<Notify>,
    proceed: Arc<Notify>,
}

#[async_trait]
impl InstanceRunner for GatedRunner {
    async fn run_instance(&self, _: &Instance, _: SyncCategory) -> CoreResult<PipelineOutcome> {
        self.started.notify_one();
        self.proceed.notified().await;
        Ok(success())
    }
}

#[tokio::test]
async fn cancel_stops_before_next_instance_and_lets_in_flight_finish() -> Result<()> {
    let db = setup_test_db_arc().await?;
    for name in ["one", "three", "two"] {
        insert_static_instance(&db, name, &["x"]).await?;
    }
    let started = Arc::new(Notify::new());
    let proceed = Arc::new(Notify::new());
    let (service, _audit) = service_with_runner(
        db.clone(),
        Arc::new(GatedRunner {
            started: started.clone(),
            proceed: proceed.clone(),
        }),
    );

    let session = service
        .create_session(manual(SyncCategory::Account, "carol"))
        .await?;
    let executing = tokio::spawn({
        let service = service.clone();
        async move { service.execute(session.id).await }
    });

    started.notified().await;
    assert!(service.cancel_session(session.id).await?);
    assert!(!service.cancel_session(session.id).await?);

    proceed.notify_one();
    let finished = executing.await??;
    assert_eq!(finished.session_status(), SessionStatus::Cancelled);

    let detail = service.get_session_detail(session.id).await?;
    let statuses: Vec<_> = detail.records.iter().map(|r| r.status.as_str()).collect();
    assert_eq!(statuses, vec!["completed", "failed", "failed"]);
    assert_eq!(detail.session.successful_instances, 1);
    assert_eq!(detail.session.failed_instances, 2);
    assert_eq!(
        detail.session.successful_instances + detail.session.failed_instances,
        detail.session.total_instances
    );
    Ok(())
}

#[tokio::test]
async fn cancel_on_terminal_session_is_a_no_op() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = session_service(db.clone(), Arc::new(MemoryAuditSink::default()));

    let session = service
        .create_session(NewSession {
            filter: InstanceFilter::ids(vec![]),
            ..manual(SyncCategory::Account, "dave")
        })
        .await?;
    let before = service.get_session(session.id).await?;

    assert!(!service.cancel_session(session.id).await?);
    assert_eq!(service.get_session(session.id).await?, before);

    let missing = service.cancel_session(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(CoreError::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn empty_session_completes_immediately() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_static_instance(&db, "ignored", &["x"]).await?;
    let service = session_service(db.clone(), Arc::new(MemoryAuditSink::default()));

    let session = service
        .create_session(NewSession {
            filter: InstanceFilter::ids(vec![]),
            ..manual(SyncCategory::Capacity, "erin")
        })
        .await?;

    assert_eq!(session.session_status(), SessionStatus::Completed);
    assert_eq!(session.total_instances, 0);
    assert_eq!(session.successful_instances, 0);
    assert_eq!(session.failed_instances, 0);
    Ok(())
}

struct PanickingRunner;

#[async_trait]
impl InstanceRunner for PanickingRunner {
    async fn run_instance(&self, _: &Instance, _: SyncCategory) -> CoreResult<PipelineOutcome> {
        panic!("adapter driver crashed");
    }
}

#[tokio::test]
async fn detached_panic_is_finalized_as_failed_session() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_static_instance(&db, "first", &["x"]).await?;
    insert_static_instance(&db, "second", &["x"]).await?;
    let (service, audit) = service_with_runner(db.clone(), Arc::new(PanickingRunner));
    let bridge = BackgroundBridge::new(audit.clone());

    let session = service
        .create_session(manual(SyncCategory::Account, "frank"))
        .await?;
    let handle = bridge.launch(
        "sync_session",
        ExecutionContext::for_job("sync_accounts").with_session(session.id),
        {
            let service = service.clone();
            async move { service.execute(session.id).await.map(|_| ()) }
        },
        service.finalizer(session.id),
    );

    assert!(matches!(handle.wait().await, TaskOutcome::Failed(_)));

    let detail = service.get_session_detail(session.id).await?;
    assert_eq!(detail.session.session_status(), SessionStatus::Failed);
    assert!(
        detail
            .records
            .iter()
            .all(|r| r.status == RecordStatus::Failed.as_str())
    );
    assert_eq!(detail.session.failed_instances, 2);
    assert!(audit.actions("background").contains(&"task_failed".to_string()));
    Ok(())
}

#[tokio::test]
async fn list_sessions_filters_and_paginates() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = session_service(db.clone(), Arc::new(MemoryAuditSink::default()));
    let none = InstanceFilter::ids(vec![]);

    for (category, actor) in [
        (SyncCategory::Account, "gina"),
        (SyncCategory::Account, "hank"),
        (SyncCategory::Capacity, "gina"),
    ] {
        service
            .create_session(NewSession {
                filter: none.clone(),
                ..manual(category, actor)
            })
            .await?;
    }

    let accounts = service
        .list_sessions(
            &SessionFilters {
                sync_category: Some(SyncCategory::Account),
                ..SessionFilters::default()
            },
            PageRequest::default(),
        )
        .await?;
    assert_eq!(accounts.total, 2);

    let gina = service
        .list_sessions(
            &SessionFilters {
                created_by: Some("gina".into()),
                status: Some(SessionStatus::Completed),
                ..SessionFilters::default()
            },
            PageRequest::new(1, 1),
        )
        .await?;
    assert_eq!(gina.total, 2);
    assert_eq!(gina.items.len(), 1);
    assert_eq!(gina.total_pages(), 2);

    let oversized = service
        .list_sessions(&SessionFilters::default(), PageRequest::new(1, 1_000))
        .await?;
    assert_eq!(oversized.per_page, 100);
    assert_eq!(oversized.items.len(), 3);
    Ok(())
}
