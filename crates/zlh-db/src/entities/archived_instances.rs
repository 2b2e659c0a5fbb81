use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "archived_instances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub instance_id: i32,
    pub customer_id: String,
    pub class: String,
    pub game: Option<String>,
    pub variant: Option<String>,
    pub runtime: Option<String>,
    pub version: Option<String>,
    pub address: Option<String>,
    pub ports: Json,
    pub hostname: String,
    pub payload: Json,
    pub reason: String,
    pub archived_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
