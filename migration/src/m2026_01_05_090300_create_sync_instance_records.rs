//! Migration to create the sync_instance_records table.
//!
//! One row per target instance inside a sync session. Rows are created in
//! bulk when the session opens and only ever move forward through
//! pending -> running -> completed|failed.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncInstanceRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncInstanceRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::SessionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::InstanceId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::InstanceName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::ItemsSynced)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::ItemsCreated)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::ItemsUpdated)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::ItemsDeleted)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::ErrorMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::SyncDetails)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncInstanceRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_instance_records_session_id")
                            .from(SyncInstanceRecords::Table, SyncInstanceRecords::SessionId)
                            .to(SyncSessions::Table, SyncSessions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_instance_records_session_instance")
                    .table(SyncInstanceRecords::Table)
                    .col(SyncInstanceRecords::SessionId)
                    .col(SyncInstanceRecords::InstanceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_instance_records_session_status")
                    .table(SyncInstanceRecords::Table)
                    .col(SyncInstanceRecords::SessionId)
                    .col(SyncInstanceRecords::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_instance_records_session_instance")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_instance_records_session_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncInstanceRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncInstanceRecords {
    Table,
    Id,
    SessionId,
    InstanceId,
    InstanceName,
    Status,
    StartedAt,
    CompletedAt,
    ItemsSynced,
    ItemsCreated,
    ItemsUpdated,
    ItemsDeleted,
    ErrorMessage,
    SyncDetails,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncSessions {
    Table,
    Id,
}
