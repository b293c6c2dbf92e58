//! Migration to create the scheduler_jobs table.
//!
//! Durable job store for the scheduler: job definitions plus next-fire
//! bookkeeping, so registered jobs survive a process restart.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SchedulerJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SchedulerJobs::Id)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SchedulerJobs::Name).text().not_null())
                    .col(ColumnDef::new(SchedulerJobs::FunctionName).text().not_null())
                    .col(
                        ColumnDef::new(SchedulerJobs::TriggerSpec)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SchedulerJobs::Kwargs).json_binary().null())
                    .col(
                        ColumnDef::new(SchedulerJobs::MisfireGraceSeconds)
                            .integer()
                            .not_null()
                            .default(300),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::MaxInstances)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::CoalesceMissed)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(SchedulerJobs::JitterSeconds).integer().null())
                    .col(
                        ColumnDef::new(SchedulerJobs::Paused)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::Source)
                            .text()
                            .not_null()
                            .default("api"),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::NextRunAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::LastRunAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SchedulerJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SchedulerJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SchedulerJobs {
    Table,
    Id,
    Name,
    FunctionName,
    TriggerSpec,
    Kwargs,
    MisfireGraceSeconds,
    MaxInstances,
    CoalesceMissed,
    JitterSeconds,
    Paused,
    Source,
    NextRunAt,
    LastRunAt,
    CreatedAt,
    UpdatedAt,
}
