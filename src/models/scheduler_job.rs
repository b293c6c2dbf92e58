//! Scheduler job entity model
//!
//! Durable job store rows: definition plus next-fire bookkeeping.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduler_jobs")]
pub struct Model {
    /// Stable job key (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Human-readable job name
    pub name: String,

    /// Built-in function the job invokes (see `scheduler::JobKind`)
    pub function_name: String,

    /// Serialized `scheduler::JobTrigger`
    #[sea_orm(column_type = "JsonBinary")]
    pub trigger_spec: JsonValue,

    /// Keyword arguments passed to the job function
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub kwargs: Option<JsonValue>,

    /// Seconds a firing may be late before it is skipped
    pub misfire_grace_seconds: i32,

    /// Maximum concurrently executing firings of this job
    pub max_instances: i32,

    /// Collapse a backlog of missed firings into one
    pub coalesce_missed: bool,

    /// Optional random delay added to each computed fire time
    pub jitter_seconds: Option<i32>,

    /// Paused jobs keep their definition but never fire
    pub paused: bool,

    /// Where the definition came from (default, config, api)
    pub source: String,

    /// Next computed fire time (null while paused or exhausted)
    pub next_run_at: Option<DateTimeWithTimeZone>,

    /// Last time a firing was dispatched
    pub last_run_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
