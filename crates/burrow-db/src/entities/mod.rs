//! Database entities

pub mod host_key;
pub mod principal;

pub use host_key::Entity as HostKey;
pub use principal::Entity as Principal;

pub mod prelude {
    pub use super::host_key::Entity as HostKey;
    pub use super::principal::Entity as Principal;
}
