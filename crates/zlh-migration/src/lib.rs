use sea_orm_migration::prelude::*;

mod m0001_create_instances;
mod m0002_create_archived_instances;
mod m0003_create_port_pool;
mod m0004_create_identifier_counters;
mod m0005_create_templates;
mod m0006_create_publish_jobs;
mod m0007_add_publish_job_lease;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_instances::Migration),
            Box::new(m0002_create_archived_instances::Migration),
            Box::new(m0003_create_port_pool::Migration),
            Box::new(m0004_create_identifier_counters::Migration),
            Box::new(m0005_create_templates::Migration),
            Box::new(m0006_create_publish_jobs::Migration),
            Box::new(m0007_add_publish_job_lease::Migration),
        ]
    }
}
