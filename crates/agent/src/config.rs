//! Agent configuration

use crate::store::Store;
use meshagent_common::StoreKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the database and store key
    pub state_dir: PathBuf,

    /// Control-plane base URL used for new joins
    pub api_url: String,

    /// Tunnel listen port proposed on join
    pub listen_port: u16,

    /// Store key file; `<state_dir>/store.key` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_key_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: meshagent_common::default_state_dir(),
            api_url: "http://localhost:8080".to_string(),
            listen_port: 51820,
            store_key_path: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("agent.db")
    }

    /// Get the store key path
    pub fn store_key_path(&self) -> PathBuf {
        self.store_key_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("store.key"))
    }

    /// Open the interface store, creating the state directory and store key
    /// on first use.
    pub fn open_store(&self) -> anyhow::Result<Store> {
        std::fs::create_dir_all(&self.state_dir)?;
        let key = StoreKey::load_or_generate(self.store_key_path())?;
        let store = Store::open(self.db_path(), key)?;
        info!("Agent state in {:?}", self.state_dir);
        Ok(store)
    }
}
