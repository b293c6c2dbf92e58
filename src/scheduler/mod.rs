//! # Scheduler Core
//!
//! Durable job registry with cron and interval triggers. Job definitions and
//! next-fire bookkeeping live in `scheduler_jobs`, so they survive restarts.
//! Only the process holding the process lock drives the clock; listing,
//! lookup and `run_now` work from any process.

pub mod job;
pub mod service;
pub mod store;
pub mod trigger;

pub use job::{JobArgs, JobKind, JobSpec, default_jobs, load_jobs_file, parse_jobs_toml};
pub use service::{JobDispatcher, ScheduledJob, SchedulerService, TickReport};
pub use store::{JobSource, JobStore};
pub use trigger::{FiringPlan, JobTrigger, apply_jitter, plan_firings};
