//! HostKey entity: a persistent secure-shell host key per algorithm

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "host_key")]
pub struct Model {
    /// Key algorithm ("rsa", "ed25519", "ecdsa")
    #[sea_orm(primary_key, auto_increment = false)]
    pub algorithm: String,

    /// Private key in PEM form, written once on first boot
    #[sea_orm(column_type = "Text")]
    pub pem: String,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
