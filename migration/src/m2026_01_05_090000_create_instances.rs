//! Migration to create the instances table.
//!
//! Instances are the externally reachable database servers that sync sessions
//! fan out over. The CRUD surface that maintains them lives outside this core.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Instances::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Instances::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Instances::Name).text().not_null())
                    .col(ColumnDef::new(Instances::DbType).text().not_null())
                    .col(ColumnDef::new(Instances::Host).text().null())
                    .col(ColumnDef::new(Instances::Port).integer().null())
                    .col(
                        ColumnDef::new(Instances::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Instances::ConnectionOptions)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Instances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Instances::UpdatedAt)
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
                    .name("idx_instances_active_db_type")
                    .table(Instances::Table)
                    .col(Instances::IsActive)
                    .col(Instances::DbType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_instances_active_db_type").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Instances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Instances {
    Table,
    Id,
    Name,
    DbType,
    Host,
    Port,
    IsActive,
    ConnectionOptions,
    CreatedAt,
    UpdatedAt,
}
