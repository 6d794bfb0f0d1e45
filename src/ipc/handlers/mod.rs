pub mod attendance;
pub mod backup_exchange;
pub mod changes;
pub mod core;
pub mod events;
pub mod sessions;
pub mod setup;
pub mod stats;
