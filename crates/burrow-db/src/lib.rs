//! Identity store for the burrow hub
//!
//! Holds principals (the tenant identities the sign-in collaborator creates)
//! and persistent secure-shell host keys. The tunneling core only consumes
//! the accessors on [`Store`].

pub mod entities;
pub mod migrator;
pub mod store;

pub use entities::{host_key, principal};
pub use migrator::Migrator;
pub use store::{Store, UpsertPrincipal};
