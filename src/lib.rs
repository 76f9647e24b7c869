pub mod api;
pub mod config;
pub mod crypto;
pub mod friends;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod presence;
pub mod signaling;
pub mod store;
pub mod users;

pub use api::{routes, App};
pub use config::Config;
pub use gateway::Gateway;
