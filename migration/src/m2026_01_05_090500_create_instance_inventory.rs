//! Migration to create the per-instance inventory, snapshot and aggregate
//! tables written by the collection pipeline.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InstanceInventory::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstanceInventory::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstanceInventory::InstanceId).uuid().not_null())
                    .col(ColumnDef::new(InstanceInventory::Category).text().not_null())
                    .col(ColumnDef::new(InstanceInventory::ItemName).text().not_null())
                    .col(
                        ColumnDef::new(InstanceInventory::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(InstanceInventory::FirstSeenAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InstanceInventory::LastSeenAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InstanceInventory::DeactivatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instance_inventory_instance_category_item")
                    .table(InstanceInventory::Table)
                    .col(InstanceInventory::InstanceId)
                    .col(InstanceInventory::Category)
                    .col(InstanceInventory::ItemName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InstanceSnapshots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstanceSnapshots::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstanceSnapshots::InstanceId).uuid().not_null())
                    .col(ColumnDef::new(InstanceSnapshots::Category).text().not_null())
                    .col(ColumnDef::new(InstanceSnapshots::ItemName).text().not_null())
                    .col(
                        ColumnDef::new(InstanceSnapshots::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InstanceSnapshots::CollectedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instance_snapshots_instance_category_collected")
                    .table(InstanceSnapshots::Table)
                    .col(InstanceSnapshots::InstanceId)
                    .col(InstanceSnapshots::Category)
                    .col(InstanceSnapshots::CollectedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InstanceAggregates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstanceAggregates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstanceAggregates::InstanceId).uuid().not_null())
                    .col(ColumnDef::new(InstanceAggregates::Category).text().not_null())
                    .col(
                        ColumnDef::new(InstanceAggregates::ActiveItems)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InstanceAggregates::CollectedItems)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(InstanceAggregates::Payload).json_binary().null())
                    .col(
                        ColumnDef::new(InstanceAggregates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_instance_aggregates_instance_category")
                    .table(InstanceAggregates::Table)
                    .col(InstanceAggregates::InstanceId)
                    .col(InstanceAggregates::Category)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for index in [
            "idx_instance_aggregates_instance_category",
            "idx_instance_snapshots_instance_category_collected",
            "idx_instance_inventory_instance_category_item",
        ] {
            manager
                .drop_index(Index::drop().name(index).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(InstanceAggregates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(InstanceSnapshots::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(InstanceInventory::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InstanceInventory {
    Table,
    Id,
    InstanceId,
    Category,
    ItemName,
    IsActive,
    FirstSeenAt,
    LastSeenAt,
    DeactivatedAt,
}

#[derive(DeriveIden)]
enum InstanceSnapshots {
    Table,
    Id,
    InstanceId,
    Category,
    ItemName,
    Payload,
    CollectedAt,
}

#[derive(DeriveIden)]
enum InstanceAggregates {
    Table,
    Id,
    InstanceId,
    Category,
    ActiveItems,
    CollectedItems,
    Payload,
    UpdatedAt,
}
