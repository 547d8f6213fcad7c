//! Principal entity: a tenant identity keyed by its bearer token

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "principal")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Identity-provider identifier, opaque to the tunneling core
    #[sea_orm(unique)]
    pub identifier: String,

    pub display_name: String,

    /// Opaque bearer token the agent authenticates with
    #[sea_orm(unique)]
    pub token: String,

    /// Stable DNS-safe subdomain label
    #[sea_orm(unique)]
    pub subdomain: String,

    /// Last TCP ingress port, preferred on reconnect
    pub last_tcp_port: i32,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
