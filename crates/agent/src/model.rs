//! Interface aggregate and reconciliation log types

use chrono::{DateTime, Utc};
use meshagent_common::{Device, Error, JoinDeviceResponse, Key, Network, Result};
use serde::{Deserialize, Serialize};

/// This device's membership in one mesh network.
///
/// `id` is 0 until the store assigns one on first insert.
#[derive(Clone, PartialEq, Eq)]
pub struct Interface {
    pub id: i64,
    /// Control-plane base URL
    pub api_url: String,
    pub network: Network,
    /// The local device
    pub device: Device,
    pub listen_port: u16,
    pub private_key: Key,
    pub device_token: Vec<u8>,
    /// Full peer snapshot, in the order last written
    pub peers: Vec<Device>,
}

impl Interface {
    /// Build a not-yet-stored interface from a join response.
    pub fn from_join(
        api_url: impl Into<String>,
        listen_port: u16,
        private_key: Key,
        response: JoinDeviceResponse,
    ) -> Result<Self> {
        if response.device.public_key != private_key.public_key() {
            return Err(Error::validation(
                "publicKey",
                "assigned device key does not match the local private key",
            ));
        }
        if response.token.is_empty() {
            return Err(Error::validation("token", "missing device token"));
        }
        Ok(Self {
            id: 0,
            api_url: api_url.into(),
            network: response.network,
            device: response.device,
            listen_port,
            private_key,
            device_token: response.token,
            peers: response.peers,
        })
    }

    /// Replace network, device and peers with a refreshed snapshot.
    pub fn apply_refresh(&mut self, response: JoinDeviceResponse) -> Result<()> {
        if response.device.id != self.device.id {
            return Err(Error::validation(
                "device.id",
                format!(
                    "refresh returned device {:?}, expected {:?}",
                    response.device.id, self.device.id
                ),
            ));
        }
        self.network = response.network;
        self.device = response.device;
        self.peers = response.peers;
        if !response.token.is_empty() {
            self.device_token = response.token;
        }
        Ok(())
    }

    /// `device.network` label for logs and error messages
    pub fn name(&self) -> String {
        format!("{}.{}", self.device.name, self.network.name)
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("api_url", &self.api_url)
            .field("network", &self.network)
            .field("device", &self.device)
            .field("listen_port", &self.listen_port)
            .field("private_key", &"<redacted>")
            .field("device_token", &"<redacted>")
            .field("peers", &self.peers)
            .finish()
    }
}

// ============================================================================
// Log types
// ============================================================================

/// Reconciliation step recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Join,
    Refresh,
    Apply,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Refresh => write!(f, "refresh"),
            Self::Apply => write!(f, "apply"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "join" => Ok(Self::Join),
            "refresh" => Ok(Self::Refresh),
            "apply" => Ok(Self::Apply),
            _ => Err(format!("unknown operation: {}", s)),
        }
    }
}

/// Outcome of a reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Pending,
    Joined,
    Refreshed,
    Applied,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Joined => write!(f, "joined"),
            Self::Refreshed => write!(f, "refreshed"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for State {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "joined" => Ok(Self::Joined),
            "refreshed" => Ok(Self::Refreshed),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown state: {}", s)),
        }
    }
}

/// One entry in an interface's append-only history. The entry with the
/// highest `id` is the interface's current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceLog {
    pub id: i64,
    pub iface_id: i64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub state: State,
    /// Local state not yet confirmed to match the desired state
    pub dirty: bool,
    pub message: String,
}

/// An interface and its most recent log entry, if any
#[derive(Debug, Clone)]
pub struct InterfaceWithLog {
    pub interface: Interface,
    pub log: Option<InterfaceLog>,
}
