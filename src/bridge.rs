//! Background execution bridge.
//!
//! [`BackgroundBridge::launch`] runs a unit of work on its own tokio task,
//! scoped with an [`ExecutionContext`], and returns a [`TaskHandle`]
//! immediately. Errors and panics raised by the work never reach the
//! caller: they are logged, written to the audit sink and handed to the
//! required [`FailureFinalizer`], which moves the owning session or run to a
//! terminal failure state.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::audit::{AuditEvent, AuditSink, Severity};
use crate::error::CoreResult;
use crate::telemetry::{ExecutionContext, with_execution_context};

/// How a detached unit of work failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The work returned an error
    Error,
    /// The work panicked
    Panic,
    /// The task was aborted before finishing
    Aborted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Aborted => "aborted",
        }
    }
}

/// Everything known about a failed unit of work
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    /// Error category for `FailureKind::Error` (see `CoreError::kind`)
    pub error_type: Option<&'static str>,
    pub message: String,
    pub context: ExecutionContext,
}

/// Converts a failure into a terminal state on whatever the work was updating.
#[async_trait]
pub trait FailureFinalizer: Send + Sync {
    async fn finalize(&self, report: &FailureReport);
}

/// Finalizer for work that owns no persisted record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecord;

#[async_trait]
impl FailureFinalizer for NoRecord {
    async fn finalize(&self, _report: &FailureReport) {}
}

/// Terminal outcome of a launched unit of work
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed,
    Failed(FailureReport),
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

/// Handle to a detached unit of work
#[derive(Debug)]
pub struct TaskHandle {
    trace_id: String,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Waits for the work and its failure handling to finish.
    pub async fn wait(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(join_err) => TaskOutcome::Failed(FailureReport {
                kind: FailureKind::Aborted,
                error_type: None,
                message: format!("bridge supervisor task failed: {join_err}"),
                context: ExecutionContext::default(),
            }),
        }
    }
}

/// Spawns detached execution contexts with failure containment
#[derive(Clone)]
pub struct BackgroundBridge {
    audit: Arc<dyn AuditSink>,
}

impl BackgroundBridge {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self { audit }
    }

    /// Launches `work` in a detached context and returns without awaiting it.
    ///
    /// `label` names the kind of work for logs and the
    /// `background_task_failures_total{kind}` metric.
    pub fn launch<F>(
        &self,
        label: &'static str,
        context: ExecutionContext,
        work: F,
        finalizer: Arc<dyn FailureFinalizer>,
    ) -> TaskHandle
    where
        F: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let trace_id = context.trace_id.clone();
        let audit = Arc::clone(&self.audit);
        let inner = tokio::spawn(with_execution_context(context.clone(), work));

        let join = tokio::spawn(async move {
            let started = Instant::now();
            let result = inner.await;
            histogram!("background_task_duration_ms", "kind" => label)
                .record(started.elapsed().as_secs_f64() * 1_000.0);

            let report = match result {
                Ok(Ok(())) => {
                    debug!(kind = label, trace_id = %context.trace_id, "background task completed");
                    return TaskOutcome::Completed;
                }
                Ok(Err(err)) => FailureReport {
                    kind: FailureKind::Error,
                    error_type: Some(err.kind()),
                    message: err.to_string(),
                    context,
                },
                Err(join_err) if join_err.is_panic() => FailureReport {
                    kind: FailureKind::Panic,
                    error_type: None,
                    message: panic_message(join_err.into_panic()),
                    context,
                },
                Err(join_err) => FailureReport {
                    kind: FailureKind::Aborted,
                    error_type: None,
                    message: join_err.to_string(),
                    context,
                },
            };

            let scope = report.context.clone();
            with_execution_context(scope, async {
                error!(
                    kind = label,
                    failure = report.kind.as_str(),
                    error_type = report.error_type.unwrap_or("none"),
                    job_id = report.context.job_id.as_deref().unwrap_or(""),
                    session_id = ?report.context.session_id,
                    run_id = ?report.context.run_id,
                    actor = report.context.actor.as_deref().unwrap_or(""),
                    error = %report.message,
                    "background task failed"
                );
                counter!("background_task_failures_total", "kind" => label).increment(1);

                audit
                    .record(
                        AuditEvent::new(
                            "background",
                            "task_failed",
                            Severity::Error,
                            report.message.clone(),
                        )
                        .with_context(json!({
                            "kind": label,
                            "failure": report.kind,
                            "error_type": report.error_type,
                        })),
                    )
                    .await;

                finalizer.finalize(&report).await;
            })
            .await;

            TaskOutcome::Failed(report)
        });

        TaskHandle { trace_id, join }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::telemetry::current_execution_context;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<AuditEvent>>);

    #[async_trait]
    impl AuditSink for CollectingSink {
        async fn record(&self, event: AuditEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct RecordingFinalizer(Mutex<Vec<FailureReport>>);

    #[async_trait]
    impl FailureFinalizer for RecordingFinalizer {
        async fn finalize(&self, report: &FailureReport) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    fn bridge() -> (BackgroundBridge, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (BackgroundBridge::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn successful_work_skips_finalizer() {
        let (bridge, sink) = bridge();
        let finalizer = Arc::new(RecordingFinalizer::default());

        let handle = bridge.launch(
            "test",
            ExecutionContext::for_job("ok"),
            async {
                let ctx = current_execution_context().expect("context scoped");
                assert_eq!(ctx.job_id.as_deref(), Some("ok"));
                Ok(())
            },
            finalizer.clone(),
        );

        assert!(handle.wait().await.is_completed());
        assert!(finalizer.0.lock().unwrap().is_empty());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn errors_are_finalized_and_audited() {
        let (bridge, sink) = bridge();
        let finalizer = Arc::new(RecordingFinalizer::default());
        let run_id = uuid::Uuid::new_v4();

        let handle = bridge.launch(
            "test",
            ExecutionContext::for_job("broken").with_run(run_id),
            async { Err(CoreError::Validation("bad input".into())) },
            finalizer.clone(),
        );

        let TaskOutcome::Failed(report) = handle.wait().await else {
            panic!("expected failure");
        };
        assert_eq!(report.kind, FailureKind::Error);
        assert_eq!(report.error_type, Some("validation"));
        assert_eq!(report.context.run_id, Some(run_id));

        assert_eq!(finalizer.0.lock().unwrap().len(), 1);
        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Error);
        assert!(events[0].message.contains("bad input"));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let (bridge, _sink) = bridge();
        let finalizer = Arc::new(RecordingFinalizer::default());

        let handle = bridge.launch(
            "test",
            ExecutionContext::new(),
            async {
                if true {
                    panic!("worker exploded");
                }
                Ok(())
            },
            finalizer.clone(),
        );

        let TaskOutcome::Failed(report) = handle.wait().await else {
            panic!("expected failure");
        };
        assert_eq!(report.kind, FailureKind::Panic);
        assert!(report.message.contains("worker exploded"));
        assert_eq!(finalizer.0.lock().unwrap().len(), 1);
    }
}
