//! Instance-level rollup refreshed after each collection

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "instance_aggregates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub instance_id: Uuid,

    pub category: String,

    /// Number of active inventory items at the time of the rollup
    pub active_items: i32,

    /// Number of snapshots written by the most recent collection
    pub collected_items: i32,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub payload: Option<JsonValue>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
