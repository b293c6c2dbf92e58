//! Migration to create the sync_sessions table.
//!
//! One row per fan-out batch; per-instance outcomes live in
//! `sync_instance_records`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncSessions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncSessions::SyncType).text().not_null())
                    .col(ColumnDef::new(SyncSessions::SyncCategory).text().not_null())
                    .col(
                        ColumnDef::new(SyncSessions::Status)
                            .text()
                            .not_null()
                            .default("running"),
                    )
                    .col(
                        ColumnDef::new(SyncSessions::TotalInstances)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncSessions::SuccessfulInstances)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncSessions::FailedInstances)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncSessions::CreatedBy).text().null())
                    .col(ColumnDef::new(SyncSessions::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncSessions::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncSessions::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncSessions::UpdatedAt)
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
                    .name("idx_sync_sessions_status_created")
                    .table(SyncSessions::Table)
                    .col(SyncSessions::Status)
                    .col(SyncSessions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_sessions_category_created")
                    .table(SyncSessions::Table)
                    .col(SyncSessions::SyncCategory)
                    .col(SyncSessions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_sessions_status_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_sessions_category_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncSessions {
    Table,
    Id,
    SyncType,
    SyncCategory,
    Status,
    TotalInstances,
    SuccessfulInstances,
    FailedInstances,
    CreatedBy,
    ErrorMessage,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}
