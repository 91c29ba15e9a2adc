//! Database entities

pub mod network_log;

pub use network_log::Entity as NetworkLog;

pub mod prelude {
    pub use super::network_log::Entity as NetworkLog;
}
