use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PublishJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PublishJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PublishJobs::InstanceId).integer().not_null())
                    .col(ColumnDef::new(PublishJobs::Hostname).string().not_null())
                    .col(ColumnDef::new(PublishJobs::Workload).string().not_null())
                    .col(ColumnDef::new(PublishJobs::Class).string().not_null())
                    .col(ColumnDef::new(PublishJobs::Address).string().null())
                    .col(ColumnDef::new(PublishJobs::Ports).json().not_null())
                    .col(ColumnDef::new(PublishJobs::State).string().not_null())
                    .col(
                        ColumnDef::new(PublishJobs::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(PublishJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(PublishJobs::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PublishJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PublishJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PublishJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_publish_jobs_state_next_attempt_at")
                    .table(PublishJobs::Table)
                    .col(PublishJobs::State)
                    .col(PublishJobs::NextAttemptAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_publish_jobs_state_next_attempt_at")
                    .table(PublishJobs::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(PublishJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PublishJobs {
    Table,
    Id,
    InstanceId,
    Hostname,
    Workload,
    Class,
    Address,
    Ports,
    State,
    AttemptCount,
    LastError,
    NextAttemptAt,
    CreatedAt,
    UpdatedAt,
    FinishedAt,
}
