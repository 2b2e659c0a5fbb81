use sea_orm::entity::prelude::*;

/// Durable record of a provisioned container. Written once the guest agent is
/// running; never created speculatively.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "instances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub customer_id: String,
    pub class: String,
    pub game: Option<String>,
    pub variant: Option<String>,
    pub runtime: Option<String>,
    pub version: Option<String>,
    pub address: Option<String>,
    /// JSON array of port numbers, ascending.
    pub ports: Json,
    pub hostname: String,
    pub agent_state: Option<String>,
    pub agent_last_seen: Option<DateTimeWithTimeZone>,
    pub payload: Json,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
