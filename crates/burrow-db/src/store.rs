//! Typed store API over the identity database

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    Set,
};
use sea_orm_migration::MigratorTrait;
use tracing::debug;

use crate::entities::{host_key, principal};
use crate::migrator::Migrator;

/// Options for [`Store::upsert_principal`]. Token and subdomain are only
/// used when the principal does not exist yet; they are immutable after
/// first sign-in.
#[derive(Debug, Clone)]
pub struct UpsertPrincipal {
    pub identifier: String,
    pub display_name: String,
    pub token: String,
    pub subdomain: String,
}

/// Handle to the identity database.
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    /// Connect to the database at the given URL
    /// (e.g. `postgres://…` or `sqlite::memory:`).
    pub async fn connect(url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<(), DbErr> {
        Migrator::up(&self.db, None).await
    }

    /// Principal owning the given bearer token.
    pub async fn principal_by_token(&self, token: &str) -> Result<Option<principal::Model>, DbErr> {
        principal::Entity::find()
            .filter(principal::Column::Token.eq(token))
            .one(&self.db)
            .await
    }

    pub async fn principal_by_id(&self, id: i64) -> Result<Option<principal::Model>, DbErr> {
        principal::Entity::find_by_id(id).one(&self.db).await
    }

    /// First-or-create by identifier, as the sign-in collaborator calls it.
    pub async fn upsert_principal(&self, opts: UpsertPrincipal) -> Result<principal::Model, DbErr> {
        if let Some(existing) = principal::Entity::find()
            .filter(principal::Column::Identifier.eq(opts.identifier.as_str()))
            .one(&self.db)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let created = principal::ActiveModel {
            identifier: Set(opts.identifier),
            display_name: Set(opts.display_name),
            token: Set(opts.token),
            subdomain: Set(opts.subdomain),
            last_tcp_port: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        debug!(id = created.id, "principal created");
        Ok(created)
    }

    /// Record the last TCP ingress port used by the principal.
    pub async fn update_last_tcp_port(&self, id: i64, port: i32) -> Result<(), DbErr> {
        principal::ActiveModel {
            id: Set(id),
            last_tcp_port: Set(port),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&self.db)
        .await?;
        Ok(())
    }

    /// Host key for the given algorithm, if one has been persisted.
    pub async fn host_key_by_algorithm(
        &self,
        algorithm: &str,
    ) -> Result<Option<host_key::Model>, DbErr> {
        host_key::Entity::find_by_id(algorithm).one(&self.db).await
    }

    /// Persist a freshly generated host key.
    pub async fn create_host_key(
        &self,
        algorithm: &str,
        pem: &str,
    ) -> Result<host_key::Model, DbErr> {
        host_key::ActiveModel {
            algorithm: Set(algorithm.to_string()),
            pem: Set(pem.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
    }
}
