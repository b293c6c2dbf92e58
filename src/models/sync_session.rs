//! SyncSession entity model
//!
//! One row per fan-out synchronization batch.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sync_instance_record::Entity as SyncInstanceRecord;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_sessions")]
pub struct Model {
    /// Server-generated session identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// scheduled | manual
    pub sync_type: String,

    /// account | capacity | aggregation
    pub sync_category: String,

    /// running | completed | failed | cancelled
    pub status: String,

    pub total_instances: i32,

    pub successful_instances: i32,

    pub failed_instances: i32,

    /// Actor that opened the session (None for scheduled firings)
    pub created_by: Option<String>,

    /// Orchestration-level failure, if the loop itself aborted
    pub error_message: Option<String>,

    pub started_at: DateTimeWithTimeZone,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "SyncInstanceRecord")]
    Records,
}

impl Related<SyncInstanceRecord> for Entity {
    fn to() -> RelationDef {
        Relation::Records.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// How a session was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Scheduled,
    Manual,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Scheduled => "scheduled",
            SyncType::Manual => "manual",
        }
    }
}

/// What a session synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncCategory {
    Account,
    Capacity,
    Aggregation,
}

impl SyncCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncCategory::Account => "account",
            SyncCategory::Capacity => "capacity",
            SyncCategory::Aggregation => "aggregation",
        }
    }
}

/// Error returned when a stored enum column holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for SessionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(UnknownVariant {
                kind: "session status",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for SyncType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SyncType::Scheduled),
            "manual" => Ok(SyncType::Manual),
            other => Err(UnknownVariant {
                kind: "sync type",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for SyncCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(SyncCategory::Account),
            "capacity" => Ok(SyncCategory::Capacity),
            "aggregation" => Ok(SyncCategory::Aggregation),
            other => Err(UnknownVariant {
                kind: "sync category",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SyncCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Model {
    /// Parsed session status; unknown values are treated as failed.
    pub fn session_status(&self) -> SessionStatus {
        self.status.parse().unwrap_or(SessionStatus::Failed)
    }
}
