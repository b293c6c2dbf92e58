//! Inventory, snapshot and aggregate persistence for the collection pipeline.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::adapters::CollectedItem;
use crate::error::CoreResult;
use crate::models::SyncCategory;
use crate::models::instance_aggregate::{
    ActiveModel as AggregateActiveModel, Column as AggregateColumn, Entity as InstanceAggregate,
};
use crate::models::instance_inventory::{
    ActiveModel as InventoryActiveModel, Column as InventoryColumn, Entity as InstanceInventory,
};
use crate::models::instance_snapshot::{
    ActiveModel as SnapshotActiveModel, Column as SnapshotColumn, Entity as InstanceSnapshot,
};

/// Outcome of reconciling observed inventory against what was last known
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventorySummary {
    /// Newly seen items
    pub created: usize,
    /// Previously deactivated items seen again
    pub reactivated: usize,
    /// Known active items no longer present (soft-deactivated)
    pub deactivated: usize,
    /// Known active items seen again
    pub refreshed: usize,
    /// Items active after reconciliation, sorted
    pub active_items: Vec<String>,
}

/// Rollup recomputed from stored inventory and the latest snapshot batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    pub active_items: usize,
    pub collected_items: usize,
}

/// Storage the collection pipeline writes to
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Reconciles `observed` against stored inventory. Vanished items are
    /// deactivated, never deleted.
    async fn reconcile_inventory(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
        observed: &[String],
    ) -> CoreResult<InventorySummary>;

    /// Persists collected payloads, returning how many were written
    async fn save_snapshots(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
        items: &[CollectedItem],
    ) -> CoreResult<usize>;

    /// Refreshes the instance-level rollup for `category`
    async fn update_aggregate(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
        active_items: usize,
        collected_items: usize,
    ) -> CoreResult<()>;

    /// Rebuilds the rollup for `category` from what is already stored
    async fn recompute_aggregate(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
    ) -> CoreResult<AggregateSummary>;
}

/// SeaORM implementation of [`CollectionStore`]
#[derive(Debug, Clone)]
pub struct DbCollectionStore {
    db: Arc<DatabaseConnection>,
}

impl DbCollectionStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CollectionStore for DbCollectionStore {
    async fn reconcile_inventory(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
        observed: &[String],
    ) -> CoreResult<InventorySummary> {
        let now = Utc::now().fixed_offset();
        let observed: BTreeSet<&str> = observed.iter().map(String::as_str).collect();

        let txn = self.db.begin().await?;

        let existing: HashMap<String, _> = InstanceInventory::find()
            .filter(InventoryColumn::InstanceId.eq(instance_id))
            .filter(InventoryColumn::Category.eq(category.as_str()))
            .all(&txn)
            .await?
            .into_iter()
            .map(|row| (row.item_name.clone(), row))
            .collect();

        let mut summary = InventorySummary::default();

        for name in &observed {
            match existing.get(*name) {
                None => {
                    InventoryActiveModel {
                        id: Set(Uuid::new_v4()),
                        instance_id: Set(instance_id),
                        category: Set(category.as_str().to_string()),
                        item_name: Set((*name).to_string()),
                        is_active: Set(true),
                        first_seen_at: Set(now),
                        last_seen_at: Set(now),
                        deactivated_at: Set(None),
                    }
                    .insert(&txn)
                    .await?;
                    summary.created += 1;
                }
                Some(row) => {
                    let was_active = row.is_active;
                    let mut active: InventoryActiveModel = row.clone().into();
                    active.is_active = Set(true);
                    active.last_seen_at = Set(now);
                    active.deactivated_at = Set(None);
                    active.update(&txn).await?;
                    if was_active {
                        summary.refreshed += 1;
                    } else {
                        summary.reactivated += 1;
                    }
                }
            }
        }

        for (name, row) in &existing {
            if row.is_active && !observed.contains(name.as_str()) {
                let mut active: InventoryActiveModel = row.clone().into();
                active.is_active = Set(false);
                active.deactivated_at = Set(Some(now));
                active.update(&txn).await?;
                summary.deactivated += 1;
            }
        }

        txn.commit().await?;

        summary.active_items = observed.into_iter().map(str::to_string).collect();

        tracing::debug!(
            instance_id = %instance_id,
            category = %category,
            created = summary.created,
            reactivated = summary.reactivated,
            deactivated = summary.deactivated,
            refreshed = summary.refreshed,
            "inventory reconciled"
        );

        Ok(summary)
    }

    async fn save_snapshots(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
        items: &[CollectedItem],
    ) -> CoreResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().fixed_offset();
        let rows = items.iter().map(|item| SnapshotActiveModel {
            id: Set(Uuid::new_v4()),
            instance_id: Set(instance_id),
            category: Set(category.as_str().to_string()),
            item_name: Set(item.item_name.clone()),
            payload: Set(item.payload.clone()),
            collected_at: Set(now),
        });
        InstanceSnapshot::insert_many(rows)
            .exec(self.db.as_ref())
            .await?;
        Ok(items.len())
    }

    async fn update_aggregate(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
        active_items: usize,
        collected_items: usize,
    ) -> CoreResult<()> {
        let now = Utc::now().fixed_offset();
        let payload = json!({
            "active_items": active_items,
            "collected_items": collected_items,
            "computed_at": now.to_rfc3339(),
        });

        let existing = InstanceAggregate::find()
            .filter(AggregateColumn::InstanceId.eq(instance_id))
            .filter(AggregateColumn::Category.eq(category.as_str()))
            .one(self.db.as_ref())
            .await?;

        match existing {
            Some(row) => {
                let mut active: AggregateActiveModel = row.into();
                active.active_items = Set(active_items as i32);
                active.collected_items = Set(collected_items as i32);
                active.payload = Set(Some(payload));
                active.updated_at = Set(now);
                active.update(self.db.as_ref()).await?;
            }
            None => {
                AggregateActiveModel {
                    id: Set(Uuid::new_v4()),
                    instance_id: Set(instance_id),
                    category: Set(category.as_str().to_string()),
                    active_items: Set(active_items as i32),
                    collected_items: Set(collected_items as i32),
                    payload: Set(Some(payload)),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?;
            }
        }
        Ok(())
    }

    async fn recompute_aggregate(
        &self,
        instance_id: Uuid,
        category: SyncCategory,
    ) -> CoreResult<AggregateSummary> {
        let active_items = InstanceInventory::find()
            .filter(InventoryColumn::InstanceId.eq(instance_id))
            .filter(InventoryColumn::Category.eq(category.as_str()))
            .filter(InventoryColumn::IsActive.eq(true))
            .count(self.db.as_ref())
            .await? as usize;

        let latest = InstanceSnapshot::find()
            .filter(SnapshotColumn::InstanceId.eq(instance_id))
            .filter(SnapshotColumn::Category.eq(category.as_str()))
            .order_by_desc(SnapshotColumn::CollectedAt)
            .one(self.db.as_ref())
            .await?;

        let collected_items = match latest {
            Some(row) => InstanceSnapshot::find()
                .filter(SnapshotColumn::InstanceId.eq(instance_id))
                .filter(SnapshotColumn::Category.eq(category.as_str()))
                .filter(SnapshotColumn::CollectedAt.eq(row.collected_at))
                .count(self.db.as_ref())
                .await? as usize,
            None => 0,
        };

        self.update_aggregate(instance_id, category, active_items, collected_items)
            .await?;
        Ok(AggregateSummary {
            active_items,
            collected_items,
        })
    }
}
