//! Control-plane protocol types
//!
//! Request and response payloads exchanged with the control plane when a
//! device joins a network or refreshes its membership. Everything received
//! here is untrusted until `validate()` has accepted it.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Network address with prefix length, e.g. `10.42.0.2/24`
pub type Address = ipnetwork::IpNetwork;

/// Length of keys and machine identifiers on the wire
pub const KEY_LEN: usize = 32;

/// Parse an address in `ip/prefix` form. A bare IP gets a host prefix.
pub fn parse_address(s: &str) -> Result<Address> {
    s.parse::<Address>()
        .map_err(|e| Error::parse("address", s, e))
}

// ============================================================================
// Keys
// ============================================================================

/// 32-byte Curve25519 key, base64 in text form
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::validation("key", format!("invalid key length {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Generate a clamped private key
    pub fn generate_private() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Public key for this private key
    pub fn public_key(&self) -> Key {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        Key(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", STANDARD.encode(self.0))
    }
}

impl Key {
    /// Short SHA-256 fingerprint, safe to log for private and public keys alike.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl std::str::FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::parse("key", s, e))?;
        Key::from_slice(&bytes).map_err(|_| {
            Error::parse("key", s, format!("invalid key length {}", bytes.len()))
        })
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Split `host:port` or `[ipv6]:port` into its parts. The port must be a
/// decimal number in [0, 65535].
pub fn split_host_port(endpoint: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| Error::validation("endpoint", format!("{}: {:?}", reason, endpoint));

    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = after.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("too many colons"));
        }
        (host, port)
    };

    if host.contains('[') || host.contains(']') || port.contains('[') || port.contains(']') {
        return Err(invalid("unexpected bracket"));
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("invalid port"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("port out of range"))?;
    Ok((host.to_string(), port))
}

// ============================================================================
// Network and device
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(rename = "address")]
    pub cidr: Address,
}

/// The local device or a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    pub addr: Address,
    pub public_key: Key,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDoc {
    pub name: String,
    pub free: bool,
    pub device_limit: i64,
    pub expires_in_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSubscriptionResponse {
    pub id: String,
    pub created: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub plan: PlanDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSubscriptionsResponse {
    pub subscriptions: Vec<GetSubscriptionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSubscriptionTokenResponse {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
}

// ============================================================================
// Join
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDeviceRequest {
    /// Logical name given to the device on join
    pub name: String,
    /// Network to join; the subscription's default network when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// App-specific machine ID, protecting the actual machine ID
    #[serde(with = "base64_bytes")]
    pub machine_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// Public endpoint where this device can be reached, if any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// Only used when starting a new network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_addr: Option<Address>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub available_port: i64,
}

impl JoinDeviceRequest {
    pub fn validate(&self) -> Result<()> {
        if self.machine_id.len() != KEY_LEN {
            return Err(Error::validation(
                "machineId",
                format!("invalid machine ID length {}", self.machine_id.len()),
            ));
        }
        if self.key.len() != KEY_LEN {
            return Err(Error::validation(
                "key",
                format!("invalid key length {}", self.key.len()),
            ));
        }
        if !(0..=65535).contains(&self.available_port) {
            return Err(Error::validation(
                "availablePort",
                format!("invalid port {}", self.available_port),
            ));
        }
        Ok(())
    }

    /// The validated public key
    pub fn public_key(&self) -> Result<Key> {
        Key::from_slice(&self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinDeviceResponse {
    pub network: Network,
    /// Assigned device, stable for the lifetime of this membership
    pub device: Device,
    #[serde(default)]
    pub peers: Vec<Device>,
    #[serde(default)]
    pub plan: PlanDoc,
    /// Device token authenticating subsequent refresh calls
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
}

// ============================================================================
// Refresh
// ============================================================================

/// Updates to an existing membership. Empty fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshDeviceRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

impl RefreshDeviceRequest {
    pub fn validate(&self) -> Result<()> {
        if !self.key.is_empty() && self.key.len() != KEY_LEN {
            return Err(Error::validation(
                "key",
                format!("invalid key length {}", self.key.len()),
            ));
        }
        if !self.endpoint.is_empty() {
            split_host_port(&self.endpoint)?;
        }
        Ok(())
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
