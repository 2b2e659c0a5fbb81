use sea_orm::entity::prelude::*;

/// Last-issued identifier per class. Only the identifier allocator reads this.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "identifier_counters")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub class: String,
    pub current: i32,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
