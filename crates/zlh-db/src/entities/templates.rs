use sea_orm::entity::prelude::*;

/// Read-only provisioning blueprint, owned by configuration management.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "templates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub slug: String,
    pub class: String,
    pub workload: String,
    pub variant: Option<String>,
    pub base_image_id: i32,
    pub default_cpu: Option<i32>,
    pub default_memory_mib: Option<i32>,
    pub default_disk_gib: Option<i32>,
    pub bridge: Option<String>,
    pub storage: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
