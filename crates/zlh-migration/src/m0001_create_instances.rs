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
                    .col(
                        ColumnDef::new(Instances::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Instances::CustomerId).string().not_null())
                    .col(ColumnDef::new(Instances::Class).string().not_null())
                    .col(ColumnDef::new(Instances::Game).string().null())
                    .col(ColumnDef::new(Instances::Variant).string().null())
                    .col(ColumnDef::new(Instances::Runtime).string().null())
                    .col(ColumnDef::new(Instances::Version).string().null())
                    .col(ColumnDef::new(Instances::Address).string().null())
                    .col(ColumnDef::new(Instances::Ports).json().not_null())
                    .col(ColumnDef::new(Instances::Hostname).string().not_null())
                    .col(ColumnDef::new(Instances::AgentState).string().null())
                    .col(
                        ColumnDef::new(Instances::AgentLastSeen)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Instances::Payload).json().not_null())
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
                    .name("idx_instances_customer_id")
                    .table(Instances::Table)
                    .col(Instances::CustomerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_instances_customer_id")
                    .table(Instances::Table)
                    .to_owned(),
            )
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
    CustomerId,
    Class,
    Game,
    Variant,
    Runtime,
    Version,
    Address,
    Ports,
    Hostname,
    AgentState,
    AgentLastSeen,
    Payload,
    CreatedAt,
    UpdatedAt,
}
