//! Migration to create the task_runs and task_run_items tables.
//!
//! Runs are the single-unit analogue of sync sessions; items are optional
//! sub-steps for jobs that iterate internally.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TaskRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(TaskRuns::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(TaskRuns::TaskKey).text().not_null())
                    .col(ColumnDef::new(TaskRuns::TaskName).text().not_null())
                    .col(ColumnDef::new(TaskRuns::TaskCategory).text().not_null())
                    .col(ColumnDef::new(TaskRuns::TriggerSource).text().not_null())
                    .col(
                        ColumnDef::new(TaskRuns::Status)
                            .text()
                            .not_null()
                            .default("running"),
                    )
                    .col(ColumnDef::new(TaskRuns::CreatedBy).text().null())
                    .col(ColumnDef::new(TaskRuns::SummaryJson).json_binary().null())
                    .col(ColumnDef::new(TaskRuns::ResultUrl).text().null())
                    .col(ColumnDef::new(TaskRuns::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(TaskRuns::ProgressTotal)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TaskRuns::ProgressCompleted)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TaskRuns::ProgressFailed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TaskRuns::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TaskRuns::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TaskRuns::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TaskRuns::UpdatedAt)
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
                    .name("idx_task_runs_key_created")
                    .table(TaskRuns::Table)
                    .col(TaskRuns::TaskKey)
                    .col(TaskRuns::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TaskRunItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TaskRunItems::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TaskRunItems::RunId).uuid().not_null())
                    .col(ColumnDef::new(TaskRunItems::ItemType).text().not_null())
                    .col(ColumnDef::new(TaskRunItems::ItemKey).text().not_null())
                    .col(ColumnDef::new(TaskRunItems::ItemName).text().null())
                    .col(
                        ColumnDef::new(TaskRunItems::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(TaskRunItems::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TaskRunItems::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(TaskRunItems::MetricsJson).json_binary().null())
                    .col(ColumnDef::new(TaskRunItems::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(TaskRunItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TaskRunItems::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_task_run_items_run_id")
                            .from(TaskRunItems::Table, TaskRunItems::RunId)
                            .to(TaskRuns::Table, TaskRuns::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_task_run_items_run_type_key")
                    .table(TaskRunItems::Table)
                    .col(TaskRunItems::RunId)
                    .col(TaskRunItems::ItemType)
                    .col(TaskRunItems::ItemKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_task_run_items_run_type_key")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(TaskRunItems::Table).to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_task_runs_key_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TaskRuns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TaskRuns {
    Table,
    Id,
    TaskKey,
    TaskName,
    TaskCategory,
    TriggerSource,
    Status,
    CreatedBy,
    SummaryJson,
    ResultUrl,
    ErrorMessage,
    ProgressTotal,
    ProgressCompleted,
    ProgressFailed,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum TaskRunItems {
    Table,
    Id,
    RunId,
    ItemType,
    ItemKey,
    ItemName,
    Status,
    StartedAt,
    CompletedAt,
    MetricsJson,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}
