//! Instance entity model
//!
//! External database instances that sync sessions fan out over. Rows are
//! maintained by the CRUD layer; the sync core only reads them.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Instance entity representing one reachable database server
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "instances")]
pub struct Model {
    /// Unique identifier for the instance (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Operator-facing instance name
    pub name: String,

    /// Dialect used to pick a connection adapter (e.g. mysql, postgresql, static)
    pub db_type: String,

    /// Hostname of the instance
    pub host: Option<String>,

    /// Port of the instance
    pub port: Option<i32>,

    /// Whether the instance participates in scheduled syncs
    pub is_active: bool,

    /// Adapter-specific connection options
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub connection_options: Option<JsonValue>,

    /// Timestamp when the instance was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the instance was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
