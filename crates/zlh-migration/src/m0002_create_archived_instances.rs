use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ArchivedInstances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ArchivedInstances::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ArchivedInstances::InstanceId)
                            .integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(ArchivedInstances::CustomerId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ArchivedInstances::Class).string().not_null())
                    .col(ColumnDef::new(ArchivedInstances::Game).string().null())
                    .col(ColumnDef::new(ArchivedInstances::Variant).string().null())
                    .col(ColumnDef::new(ArchivedInstances::Runtime).string().null())
                    .col(ColumnDef::new(ArchivedInstances::Version).string().null())
                    .col(ColumnDef::new(ArchivedInstances::Address).string().null())
                    .col(ColumnDef::new(ArchivedInstances::Ports).json().not_null())
                    .col(ColumnDef::new(ArchivedInstances::Hostname).string().not_null())
                    .col(ColumnDef::new(ArchivedInstances::Payload).json().not_null())
                    .col(ColumnDef::new(ArchivedInstances::Reason).string().not_null())
                    .col(
                        ColumnDef::new(ArchivedInstances::ArchivedAt)
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
            .drop_table(Table::drop().table(ArchivedInstances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ArchivedInstances {
    Table,
    Id,
    InstanceId,
    CustomerId,
    Class,
    Game,
    Variant,
    Runtime,
    Version,
    Address,
    Ports,
    Hostname,
    Payload,
    Reason,
    ArchivedAt,
}
