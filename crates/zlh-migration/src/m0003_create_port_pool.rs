use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PortPool::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PortPool::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PortPool::Port)
                            .integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PortPool::Class).string().not_null())
                    .col(
                        ColumnDef::new(PortPool::Status)
                            .string()
                            .not_null()
                            .default("free"),
                    )
                    .col(ColumnDef::new(PortPool::OwnerId).integer().null())
                    .col(
                        ColumnDef::new(PortPool::UpdatedAt)
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
                    .name("idx_port_pool_status_class_port")
                    .table(PortPool::Table)
                    .col(PortPool::Status)
                    .col(PortPool::Class)
                    .col(PortPool::Port)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_port_pool_owner_id")
                    .table(PortPool::Table)
                    .col(PortPool::OwnerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_port_pool_owner_id")
                    .table(PortPool::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_port_pool_status_class_port")
                    .table(PortPool::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(PortPool::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PortPool {
    Table,
    Id,
    Port,
    Class,
    Status,
    OwnerId,
    UpdatedAt,
}
