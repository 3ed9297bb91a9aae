pub mod auth;
pub mod catchup;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use config::{load_config, ConfigError, ServerConfig};
pub use registry::{RegistryError, RegistryHandle};
pub use server::{start, ServerDeps, ServerHandle};
