//! SyncInstanceRecord entity model
//!
//! Per-instance unit of work inside a sync session.

use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::sync_session::{Entity as SyncSession, UnknownVariant};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_instance_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning session
    pub session_id: Uuid,

    pub instance_id: Uuid,

    /// Instance name captured when the session opened
    pub instance_name: String,

    /// pending | running | completed | failed
    pub status: String,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub items_synced: i32,

    pub items_created: i32,

    pub items_updated: i32,

    pub items_deleted: i32,

    /// Set iff the record failed
    pub error_message: Option<String>,

    /// Versioned diagnostic payload (see `payload::normalize`)
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub sync_details: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "SyncSession",
        from = "Column::SessionId",
        to = "super::sync_session::Column::Id"
    )]
    Session,
}

impl Related<SyncSession> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle of a per-instance record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Running => "running",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }
}

impl FromStr for RecordStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "running" => Ok(RecordStatus::Running),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(UnknownVariant {
                kind: "record status",
                value: other.to_string(),
            }),
        }
    }
}
