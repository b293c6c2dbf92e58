//! Instance registry
//!
//! Read-only view over the `instances` table. The CRUD surface that maintains
//! instances lives elsewhere; the sync core only lists and looks up.

use async_trait::async_trait;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::instance::{Column, Entity, Model};

/// Narrows which active instances a session fans out over
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Only instances of this dialect
    pub db_type: Option<String>,
    /// Only these instance ids
    pub instance_ids: Option<Vec<Uuid>>,
}

impl InstanceFilter {
    pub fn ids(ids: Vec<Uuid>) -> Self {
        Self {
            instance_ids: Some(ids),
            ..Self::default()
        }
    }
}

/// Source of target instances
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn list_active(&self, filter: &InstanceFilter) -> CoreResult<Vec<Model>>;

    async fn get_by_id(&self, id: Uuid) -> CoreResult<Option<Model>>;
}

/// Registry backed by the `instances` table
#[derive(Debug, Clone)]
pub struct DbInstanceRegistry {
    db: Arc<DatabaseConnection>,
}

impl DbInstanceRegistry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl InstanceRegistry for DbInstanceRegistry {
    async fn list_active(&self, filter: &InstanceFilter) -> CoreResult<Vec<Model>> {
        let mut query = Entity::find().filter(Column::IsActive.eq(true));

        if let Some(db_type) = &filter.db_type {
            query = query.filter(Column::DbType.eq(db_type.clone()));
        }
        if let Some(ids) = &filter.instance_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            query = query.filter(Column::Id.is_in(ids.clone()));
        }

        let instances = query
            .order_by_asc(Column::Name)
            .order_by_asc(Column::Id)
            .all(self.db.as_ref())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to list active instances");
                e
            })?;

        Ok(instances)
    }

    async fn get_by_id(&self, id: Uuid) -> CoreResult<Option<Model>> {
        Ok(Entity::find_by_id(id).one(self.db.as_ref()).await?)
    }
}
