use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Templates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Templates::Slug)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Templates::Class).string().not_null())
                    .col(ColumnDef::new(Templates::Workload).string().not_null())
                    .col(ColumnDef::new(Templates::Variant).string().null())
                    .col(ColumnDef::new(Templates::BaseImageId).integer().not_null())
                    .col(ColumnDef::new(Templates::DefaultCpu).integer().null())
                    .col(ColumnDef::new(Templates::DefaultMemoryMib).integer().null())
                    .col(ColumnDef::new(Templates::DefaultDiskGib).integer().null())
                    .col(ColumnDef::new(Templates::Bridge).string().null())
                    .col(ColumnDef::new(Templates::Storage).string().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_templates_workload_variant")
                    .table(Templates::Table)
                    .col(Templates::Workload)
                    .col(Templates::Variant)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_templates_workload_variant")
                    .table(Templates::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Templates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Templates {
    Table,
    Slug,
    Class,
    Workload,
    Variant,
    BaseImageId,
    DefaultCpu,
    DefaultMemoryMib,
    DefaultDiskGib,
    Bridge,
    Storage,
}
