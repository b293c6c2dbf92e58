//! Inventory of sub-resources (databases, accounts) discovered on an instance
//!
//! Rows are never hard-deleted: vanished items flip `is_active` off and
//! reappearing items are reactivated.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "instance_inventory")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub instance_id: Uuid,

    /// Sync category the item belongs to (account | capacity)
    pub category: String,

    pub item_name: String,

    pub is_active: bool,

    pub first_seen_at: DateTimeWithTimeZone,

    pub last_seen_at: DateTimeWithTimeZone,

    pub deactivated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
