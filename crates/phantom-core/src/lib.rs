pub mod crypto;
pub mod detector;
pub mod error;
pub mod ipc;
pub mod ipc_client;
pub mod lifecycle;
pub mod manager;
pub mod model;
pub mod paths;
pub mod platform;
pub mod profile;
pub mod secure_storage;
pub mod settings;
pub mod throttle;
pub mod vault_handler;

pub use error::{ErrorCode, VaultError, VaultResult};
