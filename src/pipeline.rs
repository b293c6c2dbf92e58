//! Per-target collection pipeline.
//!
//! Applies connect → synchronize inventory → collect → persist/aggregate →
//! disconnect to exactly one instance. Every failure is folded into the
//! returned [`PipelineOutcome`]; nothing here aborts the surrounding batch.
//! Disconnect runs after every successful connect, whichever later step
//! failed.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry, DatabaseAdapter};
use crate::error::CoreResult;
use crate::models::SyncCategory;
use crate::models::instance::Model as Instance;
use crate::payload;
use crate::repositories::{CollectionStore, InventorySummary};

/// Pipeline stage at which an instance failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Unreachable, refused, or no adapter for its dialect
    Connect,
    Inventory,
    Collect,
    /// Reachable but results could not be written
    Persist,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Connect => "connect",
            FailureStage::Inventory => "inventory",
            FailureStage::Collect => "collect",
            FailureStage::Persist => "persist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub stage: FailureStage,
    pub message: String,
}

/// Item counters written onto the instance record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    pub synced: i32,
    pub created: i32,
    pub updated: i32,
    pub deleted: i32,
}

/// Result of running the pipeline against one instance
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub failure: Option<PipelineFailure>,
    pub counts: ItemCounts,
    /// Versioned diagnostic payload; present on success and failure
    pub details: Value,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Error text for a failed record
    pub fn error_message(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(|f| format!("{} failed: {}", f.stage.as_str(), f.message))
    }
}

/// Runs the collection protocol for a single instance
#[derive(Clone)]
pub struct CollectionPipeline {
    adapters: AdapterRegistry,
    store: Arc<dyn CollectionStore>,
    step_timeout: Option<Duration>,
}

impl CollectionPipeline {
    pub fn new(adapters: AdapterRegistry, store: Arc<dyn CollectionStore>) -> Self {
        Self {
            adapters,
            store,
            step_timeout: None,
        }
    }

    /// Bounds each adapter step. `0` disables the bound.
    pub fn with_step_timeout_seconds(mut self, seconds: u64) -> Self {
        self.step_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub async fn run(&self, instance: &Instance, category: SyncCategory) -> PipelineOutcome {
        let mut trace = StepTrace::new(instance, category);

        let mut adapter = match self.adapters.adapter_for(instance) {
            Ok(adapter) => adapter,
            Err(err) => {
                let message = err.to_string();
                trace.step("connect", json!({ "status": "failed", "error": message }));
                return self.finish(trace, Some((FailureStage::Connect, message)), ItemCounts::default());
            }
        };
        trace.set("dialect", json!(adapter.dialect()));

        let started = Instant::now();
        let connected = self.bounded("connect", adapter.connect()).await;
        let elapsed = started.elapsed();
        match connected {
            Ok(true) => {
                trace.step("connect", json!({ "status": "ok", "elapsed_ms": ms(elapsed) }));
            }
            Ok(false) => {
                let message = "instance unreachable".to_string();
                trace.step(
                    "connect",
                    json!({ "status": "unreachable", "elapsed_ms": ms(elapsed) }),
                );
                return self.finish(trace, Some((FailureStage::Connect, message)), ItemCounts::default());
            }
            Err(err) => {
                let message = err.to_string();
                trace.step(
                    "connect",
                    json!({ "status": "failed", "error": message, "elapsed_ms": ms(elapsed) }),
                );
                return self.finish(trace, Some((FailureStage::Connect, message)), ItemCounts::default());
            }
        }

        let result = self
            .collect_connected(adapter.as_mut(), instance, category, &mut trace)
            .await;

        match self.bounded("disconnect", async {
            adapter.disconnect().await;
            Ok(())
        })
        .await
        {
            Ok(()) => trace.step("disconnect", json!({ "status": "ok" })),
            Err(err) => {
                warn!(instance_id = %instance.id, error = %err, "adapter disconnect failed");
                trace.step("disconnect", json!({ "status": "failed", "error": err.to_string() }));
            }
        }

        match result {
            Ok(counts) => self.finish(trace, None, counts),
            Err((stage, message, counts)) => self.finish(trace, Some((stage, message)), counts),
        }
    }

    /// Steps 2 to 4. Only called after a successful connect.
    async fn collect_connected(
        &self,
        adapter: &mut dyn DatabaseAdapter,
        instance: &Instance,
        category: SyncCategory,
        trace: &mut StepTrace,
    ) -> Result<ItemCounts, (FailureStage, String, ItemCounts)> {
        let observed = match self
            .bounded("inventory", adapter.list_inventory(category))
            .await
        {
            Ok(items) => items,
            Err(err) => {
                let message = err.to_string();
                trace.step("inventory", json!({ "status": "failed", "error": message }));
                return Err((FailureStage::Inventory, message, ItemCounts::default()));
            }
        };

        let summary = match self
            .store
            .reconcile_inventory(instance.id, category, &observed)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                let message = err.to_string();
                trace.step(
                    "inventory",
                    json!({ "status": "failed", "observed": observed.len(), "error": message }),
                );
                return Err((FailureStage::Persist, message, ItemCounts::default()));
            }
        };
        trace.step("inventory", inventory_json(&summary));

        let mut counts = ItemCounts {
            synced: 0,
            created: summary.created as i32,
            updated: (summary.reactivated + summary.refreshed) as i32,
            deleted: summary.deactivated as i32,
        };

        if summary.active_items.is_empty() {
            trace.step(
                "collect",
                json!({ "status": "skipped", "reason": "no active items" }),
            );
            debug!(instance_id = %instance.id, "no active items to collect");
            return Ok(counts);
        }

        let collected = match self
            .bounded("collect", adapter.collect(category, &summary.active_items))
            .await
        {
            Ok(collected) => collected,
            Err(err) => {
                let message = err.to_string();
                trace.step("collect", json!({ "status": "failed", "error": message }));
                return Err((FailureStage::Collect, message, counts));
            }
        };
        trace.step(
            "collect",
            json!({ "status": "ok", "collected": collected.len() }),
        );

        let saved = match self
            .store
            .save_snapshots(instance.id, category, &collected)
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                let message = err.to_string();
                trace.step(
                    "persist",
                    json!({ "status": "failed", "collected": collected.len(), "error": message }),
                );
                return Err((FailureStage::Persist, message, counts));
            }
        };
        counts.synced = saved as i32;
        trace.step("persist", json!({ "status": "ok", "saved": saved }));

        // The rollup is derived data; a failure here is recorded but does not fail the instance.
        match self
            .store
            .update_aggregate(instance.id, category, summary.active_items.len(), saved)
            .await
        {
            Ok(()) => trace.step("aggregate", json!({ "status": "ok" })),
            Err(err) => {
                warn!(instance_id = %instance.id, error = %err, "aggregate refresh failed");
                trace.step(
                    "aggregate",
                    json!({ "status": "failed", "error": err.to_string() }),
                );
            }
        }

        Ok(counts)
    }

    async fn bounded<T, F>(&self, step: &'static str, fut: F) -> Result<T, AdapterError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        match self.step_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| AdapterError::Timeout {
                    step,
                    seconds: limit.as_secs(),
                })?,
            None => fut.await,
        }
    }

    fn finish(
        &self,
        trace: StepTrace,
        failure: Option<(FailureStage, String)>,
        counts: ItemCounts,
    ) -> PipelineOutcome {
        let failure = failure.map(|(stage, message)| PipelineFailure { stage, message });
        let outcome = if failure.is_some() { "failed" } else { "completed" };

        counter!(
            "sync_instance_outcomes_total",
            "category" => trace.category.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        match &failure {
            None => info!(
                instance_id = %trace.instance_id,
                category = %trace.category,
                synced = counts.synced,
                created = counts.created,
                updated = counts.updated,
                deleted = counts.deleted,
                "instance collection completed"
            ),
            Some(f) => warn!(
                instance_id = %trace.instance_id,
                category = %trace.category,
                stage = f.stage.as_str(),
                error = %f.message,
                "instance collection failed"
            ),
        }

        let details = trace.into_payload(outcome, failure.as_ref(), counts);
        PipelineOutcome {
            failure,
            counts,
            details,
        }
    }
}

/// Accumulates per-step diagnostics for `sync_details`
struct StepTrace {
    instance_id: uuid::Uuid,
    category: SyncCategory,
    root: Map<String, Value>,
    steps: Map<String, Value>,
}

impl StepTrace {
    fn new(instance: &Instance, category: SyncCategory) -> Self {
        let mut root = Map::new();
        root.insert("version".into(), json!(payload::CURRENT_VERSION));
        root.insert("category".into(), json!(category.as_str()));
        root.insert("instance_name".into(), json!(instance.name));
        root.insert("dialect".into(), json!(instance.db_type));
        Self {
            instance_id: instance.id,
            category,
            root,
            steps: Map::new(),
        }
    }

    fn set(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_string(), value);
    }

    fn step(&mut self, name: &str, value: Value) {
        self.steps.insert(name.to_string(), value);
    }

    fn into_payload(
        mut self,
        outcome: &str,
        failure: Option<&PipelineFailure>,
        counts: ItemCounts,
    ) -> Value {
        self.root.insert("steps".into(), Value::Object(self.steps));
        self.root.insert("outcome".into(), json!(outcome));
        self.root.insert("counts".into(), json!(counts));
        if let Some(f) = failure {
            self.root.insert(
                "failure".into(),
                json!({ "stage": f.stage, "message": f.message }),
            );
        }
        let raw = Value::Object(self.root);
        match normalize_details(raw.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "sync details failed normalization");
                raw
            }
        }
    }
}

fn normalize_details(raw: Value) -> CoreResult<Value> {
    Ok(payload::normalize(Some(raw), "sync_details")?.unwrap_or(Value::Null))
}

fn inventory_json(summary: &InventorySummary) -> Value {
    json!({
        "status": "ok",
        "created": summary.created,
        "reactivated": summary.reactivated,
        "deactivated": summary.deactivated,
        "refreshed": summary.refreshed,
        "active_items": summary.active_items.len(),
    })
}

fn ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
