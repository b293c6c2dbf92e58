//! Scheduler service: durable job registry plus the clock loop that fires
//! due jobs on a bounded worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::job::{JobArgs, JobKind, JobSpec, check_column_range, default_jobs, load_jobs_file};
use super::store::{JobSource, JobStore};
use super::trigger::{JobTrigger, apply_jitter, plan_firings};
use crate::bridge::{TaskHandle, TaskOutcome};
use crate::config::SchedulerConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::scheduler_job::Model as JobModel;

/// Starts the work behind a job kind in a detached execution context.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job_id: &str, kind: JobKind, args: JobArgs) -> CoreResult<TaskHandle>;
}

/// Read view of a registered job
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub function: String,
    pub trigger: Value,
    pub kwargs: Option<Value>,
    pub paused: bool,
    pub source: String,
    pub max_instances: i32,
    pub misfire_grace_seconds: i32,
    pub coalesce: bool,
    pub jitter_seconds: Option<i32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Firings currently executing
    pub running: usize,
}

/// What one clock tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<String>,
    pub misfired: usize,
    pub coalesced: usize,
    /// Firings dropped because the job was at `max_instances`
    pub skipped_busy: usize,
    pub errors: usize,
}

struct ClockHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

struct Inner {
    config: SchedulerConfig,
    tz: Tz,
    store: JobStore,
    dispatcher: Arc<dyn JobDispatcher>,
    pool: Arc<Semaphore>,
    running: Mutex<HashMap<String, usize>>,
    clock: Mutex<Option<ClockHandle>>,
}

/// Explicitly constructed scheduler with a start/shutdown lifecycle
#[derive(Clone)]
pub struct SchedulerService {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SchedulerService {
    pub fn new(
        config: SchedulerConfig,
        store: JobStore,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> CoreResult<Self> {
        config
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let tz = config.tz();
        let pool = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tz,
                store,
                dispatcher,
                pool,
                running: Mutex::new(HashMap::new()),
                clock: Mutex::new(None),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.clock)
            .as_ref()
            .is_some_and(|clock| !clock.join.is_finished())
    }

    /// Registers the declarative jobs and starts the clock loop.
    pub async fn start(&self) -> CoreResult<()> {
        if self.is_running() {
            warn!("scheduler already running");
            return Ok(());
        }

        self.register_declarative_jobs().await?;
        self.prime_next_runs(Utc::now()).await?;

        let shutdown = CancellationToken::new();
        let this = self.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { this.run_clock(token).await });
        *lock(&self.inner.clock) = Some(ClockHandle { shutdown, join });

        info!(
            timezone = %self.inner.tz,
            tick_interval_seconds = self.inner.config.tick_interval_seconds,
            worker_pool_size = self.inner.config.worker_pool_size,
            "scheduler started"
        );
        Ok(())
    }

    /// Stops the clock loop. Firings already dispatched run to completion.
    pub async fn shutdown(&self) {
        let clock = lock(&self.inner.clock).take();
        if let Some(clock) = clock {
            clock.shutdown.cancel();
            if let Err(err) = clock.join.await {
                error!(error = %err, "scheduler clock task ended abnormally");
            }
            info!("scheduler stopped");
        }
    }

    #[instrument(skip_all)]
    async fn run_clock(self, shutdown: CancellationToken) {
        let tick = std::time::Duration::from_secs(self.inner.config.tick_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick) => {
                    let started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "scheduler tick failed");
                    }
                    histogram!("scheduler_tick_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }
    }

    /// Evaluates every unpaused job against `now` and dispatches due firings.
    ///
    /// A job whose definition cannot be evaluated is logged and skipped; it
    /// does not stop the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> CoreResult<TickReport> {
        let mut report = TickReport::default();
        for job in self.inner.store.list_unpaused().await? {
            if let Err(err) = self.evaluate_job(&job, now, &mut report).await {
                report.errors += 1;
                error!(job_id = %job.id, error = %err, "failed to evaluate scheduler job");
            }
        }
        if !report.dispatched.is_empty() || report.misfired > 0 {
            debug!(
                dispatched = report.dispatched.len(),
                misfired = report.misfired,
                coalesced = report.coalesced,
                skipped_busy = report.skipped_busy,
                "scheduler tick completed"
            );
        }
        Ok(report)
    }

    async fn evaluate_job(
        &self,
        job: &JobModel,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> CoreResult<()> {
        let trigger = JobTrigger::from_json(&job.trigger_spec)?;
        let Some(scheduled) = job.next_run_at.map(|t| t.with_timezone(&Utc)) else {
            let next = self.next_fire(&trigger, now, job.jitter_seconds)?;
            self.inner.store.record_tick(&job.id, next, None).await?;
            return Ok(());
        };
        if scheduled > now {
            return Ok(());
        }

        let kind: JobKind = job.function_name.parse()?;
        let plan = plan_firings(
            &trigger,
            scheduled,
            now,
            Duration::seconds(job.misfire_grace_seconds.max(0) as i64),
            job.coalesce_missed,
            self.inner.tz,
        )?;

        if plan.misfired > 0 {
            warn!(
                job_id = %job.id,
                misfired = plan.misfired,
                scheduled_at = %scheduled,
                "skipping firings beyond misfire grace"
            );
            counter!("scheduler_job_misfires_total", "job_id" => job.id.clone())
                .increment(plan.misfired as u64);
        }
        report.misfired += plan.misfired;
        report.coalesced += plan.coalesced;

        let next = plan
            .next_run_at
            .map(|at| apply_jitter(at, job.jitter_seconds, &mut rand::thread_rng()));
        let dispatched_at = (plan.run > 0).then_some(now);
        self.inner.store.record_tick(&job.id, next, dispatched_at).await?;

        let args = JobArgs::resolve(job.kwargs.as_ref(), None)?;
        for _ in 0..plan.run {
            if self.fire(job, kind, args.clone()) {
                report.dispatched.push(job.id.clone());
            } else {
                report.skipped_busy += 1;
            }
        }
        Ok(())
    }

    /// Hands one firing to the worker pool. False if the job is at `max_instances`.
    fn fire(&self, job: &JobModel, kind: JobKind, args: JobArgs) -> bool {
        let Some(guard) = RunningGuard::acquire(&self.inner, &job.id, job.max_instances.max(1) as usize)
        else {
            warn!(
                job_id = %job.id,
                max_instances = job.max_instances,
                "job already at max_instances; skipping firing"
            );
            counter!("scheduler_job_firings_total", "job_id" => job.id.clone(), "outcome" => "skipped")
                .increment(1);
            return false;
        };

        let inner = Arc::clone(&self.inner);
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = Arc::clone(&inner.pool).acquire_owned().await else {
                return;
            };
            let started = Instant::now();
            info!(job_id = %job_id, function = %kind, "scheduler job firing");

            // Errors are contained to this firing; the job stays scheduled.
            let outcome = match inner.dispatcher.dispatch(&job_id, kind, args).await {
                Ok(handle) => match handle.wait().await {
                    TaskOutcome::Completed => "completed",
                    TaskOutcome::Failed(report) => {
                        error!(
                            job_id = %job_id,
                            failure = report.kind.as_str(),
                            error = %report.message,
                            "scheduler job firing failed"
                        );
                        "failed"
                    }
                },
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "scheduler job could not be dispatched");
                    "error"
                }
            };

            counter!("scheduler_job_firings_total", "job_id" => job_id.clone(), "outcome" => outcome)
                .increment(1);
            histogram!("scheduler_job_firing_duration_ms", "job_id" => job_id)
                .record(started.elapsed().as_secs_f64() * 1_000.0);
        });
        true
    }

    fn next_fire(
        &self,
        trigger: &JobTrigger,
        after: DateTime<Utc>,
        jitter_seconds: Option<i32>,
    ) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(trigger
            .next_after(after, self.inner.tz)?
            .map(|at| apply_jitter(at, jitter_seconds, &mut rand::thread_rng())))
    }

    async fn prime_next_runs(&self, now: DateTime<Utc>) -> CoreResult<()> {
        for job in self.inner.store.list_unpaused().await? {
            if job.next_run_at.is_some() {
                continue;
            }
            match JobTrigger::from_json(&job.trigger_spec) {
                Ok(trigger) => {
                    let next = self.next_fire(&trigger, now, job.jitter_seconds)?;
                    self.inner.store.record_tick(&job.id, next, None).await?;
                }
                Err(err) => warn!(job_id = %job.id, error = %err, "job has an invalid trigger"),
            }
        }
        Ok(())
    }

    fn require_running(&self, operation: &str) -> CoreResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!(
                "scheduler is not running; cannot {operation}"
            )))
        }
    }

    /// Jobs from the configured jobs file, or the built-in defaults.
    pub fn declarative_jobs(&self) -> CoreResult<(Vec<JobSpec>, JobSource)> {
        match &self.inner.config.jobs_file {
            Some(path) => Ok((load_jobs_file(path)?, JobSource::Config)),
            None => Ok((default_jobs(), JobSource::Default)),
        }
    }

    /// Registers the declarative jobs unless the store already holds jobs.
    ///
    /// Returns how many were registered.
    pub async fn register_declarative_jobs(&self) -> CoreResult<usize> {
        let existing = self.inner.store.count().await?;
        if existing > 0 {
            info!(existing, "job store already populated; skipping declarative jobs");
            return Ok(0);
        }
        let (specs, source) = self.declarative_jobs()?;
        self.register_all(&specs, source).await
    }

    async fn register_all(&self, specs: &[JobSpec], source: JobSource) -> CoreResult<usize> {
        for spec in specs {
            self.register(spec, source).await?;
        }
        Ok(specs.len())
    }

    async fn register(&self, spec: &JobSpec, source: JobSource) -> CoreResult<JobModel> {
        spec.validate()?;
        let jitter = spec
            .jitter_seconds
            .map(|j| check_column_range(&spec.id, "jitter_seconds", j.into()))
            .transpose()?;
        let next = self.next_fire(&spec.trigger, Utc::now(), jitter)?;
        let model = self
            .inner
            .store
            .upsert(
                spec,
                source,
                self.inner.config.default_misfire_grace_seconds,
                next,
            )
            .await?;
        info!(
            job_id = %model.id,
            function = %model.function_name,
            source = source.as_str(),
            next_run_at = ?model.next_run_at,
            "scheduler job registered"
        );
        Ok(model)
    }

    pub async fn list_jobs(&self) -> CoreResult<Vec<ScheduledJob>> {
        let jobs = self.inner.store.list().await?;
        Ok(jobs.into_iter().map(|job| self.view(job)).collect())
    }

    pub async fn get_job(&self, id: &str) -> CoreResult<ScheduledJob> {
        let job = self.inner.store.require(id).await?;
        Ok(self.view(job))
    }

    /// Creates or replaces a job definition.
    pub async fn upsert_job(&self, spec: JobSpec) -> CoreResult<ScheduledJob> {
        self.require_running("upsert a job")?;
        let model = self.register(&spec, JobSource::Api).await?;
        Ok(self.view(model))
    }

    /// Idempotent; pausing a paused job changes nothing.
    pub async fn pause(&self, id: &str) -> CoreResult<ScheduledJob> {
        self.require_running("pause a job")?;
        let job = self.inner.store.require(id).await?;
        if job.paused {
            return Ok(self.view(job));
        }
        let job = self.inner.store.set_paused(id, true, None).await?;
        info!(job_id = %id, "scheduler job paused");
        Ok(self.view(job))
    }

    /// Idempotent; the next fire time is computed from now.
    pub async fn resume(&self, id: &str) -> CoreResult<ScheduledJob> {
        self.require_running("resume a job")?;
        let job = self.inner.store.require(id).await?;
        if !job.paused {
            return Ok(self.view(job));
        }
        let trigger = JobTrigger::from_json(&job.trigger_spec)?;
        let next = self.next_fire(&trigger, Utc::now(), job.jitter_seconds)?;
        let job = self.inner.store.set_paused(id, false, next).await?;
        info!(job_id = %id, next_run_at = ?job.next_run_at, "scheduler job resumed");
        Ok(self.view(job))
    }

    /// Invokes the job function immediately, bypassing its trigger.
    ///
    /// Only needs the job to be registered; the clock does not have to run
    /// in this process. `overrides` are layered over the stored kwargs and
    /// the firing is always marked manual.
    pub async fn run_now(&self, id: &str, overrides: Option<Value>) -> CoreResult<TaskHandle> {
        let job = self.inner.store.require(id).await?;
        let kind: JobKind = job.function_name.parse()?;
        let mut args = JobArgs::resolve(job.kwargs.as_ref(), overrides.as_ref())?;
        args.manual_run = true;

        info!(
            job_id = %id,
            function = %kind,
            created_by = args.created_by.as_deref().unwrap_or(""),
            "running scheduler job now"
        );
        let handle = self.inner.dispatcher.dispatch(id, kind, args).await?;
        counter!("scheduler_job_firings_total", "job_id" => id.to_string(), "outcome" => "manual")
            .increment(1);
        Ok(handle)
    }

    /// Deletes every job and re-registers the declarative set.
    pub async fn reload(&self) -> CoreResult<Vec<ScheduledJob>> {
        self.require_running("reload jobs")?;
        let (specs, source) = self.declarative_jobs()?;

        for job in self.inner.store.list().await? {
            self.inner.store.delete(&job.id).await?;
            warn!(job_id = %job.id, "scheduler job removed for reload");
        }
        self.register_all(&specs, source).await?;
        info!(jobs = specs.len(), source = source.as_str(), "scheduler jobs reloaded");
        self.list_jobs().await
    }

    fn running_count(&self, id: &str) -> usize {
        lock(&self.inner.running).get(id).copied().unwrap_or(0)
    }

    fn view(&self, job: JobModel) -> ScheduledJob {
        let running = self.running_count(&job.id);
        ScheduledJob {
            running,
            id: job.id,
            name: job.name,
            function: job.function_name,
            trigger: job.trigger_spec,
            kwargs: job.kwargs,
            paused: job.paused,
            source: job.source,
            max_instances: job.max_instances,
            misfire_grace_seconds: job.misfire_grace_seconds,
            coalesce: job.coalesce_missed,
            jitter_seconds: job.jitter_seconds,
            next_run_at: job.next_run_at.map(|t| t.with_timezone(&Utc)),
            last_run_at: job.last_run_at.map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Counts one executing firing of a job; released on drop.
struct RunningGuard {
    inner: Arc<Inner>,
    job_id: String,
}

impl RunningGuard {
    fn acquire(inner: &Arc<Inner>, job_id: &str, max_instances: usize) -> Option<Self> {
        let mut running = lock(&inner.running);
        let count = running.entry(job_id.to_string()).or_insert(0);
        if *count >= max_instances {
            return None;
        }
        *count += 1;
        Some(Self {
            inner: Arc::clone(inner),
            job_id: job_id.to_string(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = lock(&self.inner.running);
        if let Some(count) = running.get_mut(&self.job_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(&self.job_id);
            }
        }
    }
}
