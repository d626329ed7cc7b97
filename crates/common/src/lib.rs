//! Mesh agent common library
//!
//! Control-plane protocol types, the error taxonomy shared by the agent
//! crates, and at-rest secret encryption.

pub mod crypto;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use crypto::{decrypt_secret, encrypt_secret, StoreKey};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use types::*;

/// Agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_state_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshagent")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
