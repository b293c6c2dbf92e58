//! Telemetry utilities: global subscriber management and the task-scoped
//! execution context carried by every detached unit of work.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use serde::Serialize;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

/// Identifiers describing the unit of work a task is executing.
///
/// Scoped as a task-local over every detached execution context so logs,
/// audit events and error translation can correlate with the owning
/// job/session/run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Correlation id, generated per context
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            ..Self::default()
        }
    }

    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::new()
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    /// Structured form used as audit event context
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

task_local! {
    static ACTIVE_EXECUTION_CONTEXT: ExecutionContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // sqlx and other dependencies still log through `log::`.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. legacy `log::` macros will not emit structured tracing events.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    Ok(())
}

/// Execute `future` within the provided execution context, making it available
/// through task-local storage until the future completes.
pub async fn with_execution_context<Fut, R>(context: ExecutionContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_EXECUTION_CONTEXT.scope(context, future).await
}

/// The execution context of the running task, if one was scoped.
pub fn current_execution_context() -> Option<ExecutionContext> {
    ACTIVE_EXECUTION_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Get the currently active trace ID, if one has been set for the running task.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_EXECUTION_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_is_visible_inside_scope_only() {
        assert!(current_execution_context().is_none());

        let ctx = ExecutionContext::for_job("sync_accounts").with_actor(Some("ops".into()));
        let trace_id = ctx.trace_id.clone();
        let seen = with_execution_context(ctx, async { current_execution_context() }).await;

        let seen = seen.expect("context in scope");
        assert_eq!(seen.job_id.as_deref(), Some("sync_accounts"));
        assert_eq!(seen.actor.as_deref(), Some("ops"));
        assert_eq!(seen.trace_id, trace_id);
        assert!(current_trace_id().is_none());
    }

    #[test]
    fn json_omits_unset_identifiers() {
        let json = ExecutionContext::for_job("collect_capacity").to_json();
        assert_eq!(json["job_id"], "collect_capacity");
        assert!(json.get("session_id").is_none());
        assert!(json.get("run_id").is_none());
    }
}
