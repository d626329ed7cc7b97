//! SQLite-backed interface store and reconciliation log
//!
//! Tables:
//! - iface: one row per interface, secrets sealed with the store key
//! - peer: the interface's current peer snapshot
//! - iface_log: append-only reconciliation history
//!
//! Every operation runs inside a single transaction. A transaction that is
//! not explicitly committed is rolled back when dropped.

use crate::model::{Interface, InterfaceLog, InterfaceWithLog, Operation, State};
use chrono::{DateTime, Utc};
use meshagent_common::{
    decrypt_secret, encrypt_secret, parse_address, Device, Error, Key, Network, Result,
    ResultExt, StoreKey,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS iface (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,

    api_url TEXT NOT NULL,

    net_id TEXT NOT NULL,
    net_name TEXT NOT NULL,
    net_cidr TEXT NOT NULL,

    device_id TEXT NOT NULL,
    device_name TEXT NOT NULL,
    device_endpoint TEXT NOT NULL,
    device_addr TEXT NOT NULL,
    public_key TEXT NOT NULL,

    listen_port INTEGER NOT NULL,
    key BLOB NOT NULL,
    device_token BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS iface_device_id_unique ON iface(device_id);
CREATE UNIQUE INDEX IF NOT EXISTS iface_device_net_name_unique ON iface(net_name, device_name);
CREATE UNIQUE INDEX IF NOT EXISTS iface_public_key_unique ON iface(public_key);

CREATE TABLE IF NOT EXISTS peer (
    iface_id INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    device_name TEXT NOT NULL,
    device_endpoint TEXT NOT NULL,
    device_addr TEXT NOT NULL,
    public_key TEXT NOT NULL,
    FOREIGN KEY(iface_id) REFERENCES iface(id)
);
CREATE INDEX IF NOT EXISTS idx_peer_iface ON peer(iface_id);

CREATE TABLE IF NOT EXISTS iface_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    iface_id INTEGER NOT NULL,
    operation TEXT NOT NULL,
    state TEXT NOT NULL,
    dirty INTEGER NOT NULL DEFAULT 0,
    message TEXT NOT NULL,
    FOREIGN KEY(iface_id) REFERENCES iface(id)
);
CREATE INDEX IF NOT EXISTS idx_iface_log_iface ON iface_log(iface_id, id);
"#;

/// Durable store for interfaces, their peers and their history
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    key: StoreKey,
}

impl Store {
    /// Open or create the store at path
    pub fn open(path: impl AsRef<Path>, key: StoreKey) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database {:?}", path.as_ref()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::init(conn, key)?;
        info!("Opened interface store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory(key: StoreKey) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, key)
    }

    fn init(conn: Connection, key: StoreKey) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)
            .context("failed to create database schema")?;
        debug!("Interface store schema initialized (key {})", key.fingerprint());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key,
        })
    }

    /// Run `f` in a transaction, committing only if it succeeds.
    fn with_tx<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(behavior)
            .context("failed to begin transaction")?;
        let mut stx = StoreTx { tx, key: &self.key };
        let value = f(&mut stx)?;
        stx.tx.commit().context("failed to commit transaction")?;
        Ok(value)
    }

    // ========================================================================
    // Interfaces
    // ========================================================================

    /// Insert or update `iface` together with its full peer set.
    ///
    /// An id of 0 inserts a new row. `iface.id` is set to the row id only
    /// once the transaction has committed.
    pub fn ensure_interface(&self, iface: &mut Interface) -> Result<()> {
        let id = self.with_tx(TransactionBehavior::Immediate, |tx| {
            tx.ensure_interface(iface)
        })?;
        iface.id = id;
        Ok(())
    }

    /// Read one interface with decrypted secrets and its peers.
    pub fn interface(&self, id: i64) -> Result<Interface> {
        self.with_tx(TransactionBehavior::Deferred, |tx| tx.interface(id))
    }

    /// Resolve an interface by its unique (device name, network name) pair.
    pub fn interface_by_device(&self, device_name: &str, network_name: &str) -> Result<Interface> {
        self.with_tx(TransactionBehavior::Deferred, |tx| {
            let id = tx.interface_id_by_device(device_name, network_name)?;
            tx.interface(id)
        })
        .with_context(|| {
            format!(
                "failed to query interface device name {:?} network name {:?}",
                device_name, network_name
            )
        })
    }

    /// Every interface paired with its most recent log entry.
    pub fn interfaces(&self) -> Result<Vec<InterfaceWithLog>> {
        self.with_tx(TransactionBehavior::Deferred, |tx| {
            let ids = {
                let mut stmt = tx.tx.prepare("SELECT id FROM iface ORDER BY id")?;
                let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()
                    .context("failed to query interfaces")?
            };

            let mut result = Vec::with_capacity(ids.len());
            for id in ids {
                let interface = tx.interface(id)?;
                let log = tx
                    .last_log(id)
                    .with_context(|| format!("failed to query last log for interface {}", id))?;
                result.push(InterfaceWithLog { interface, log });
            }
            Ok(result)
        })
    }

    // ========================================================================
    // Reconciliation log
    // ========================================================================

    /// Run `f` with the interface's latest log entry (`None` if it has no
    /// history) inside one write transaction. Anything `f` writes through
    /// the transaction, including appended log entries, commits only if `f`
    /// succeeds.
    ///
    /// The store stays locked while `f` runs, so `f` must go through the
    /// `StoreTx` it is given. Calling back into this `Store` deadlocks.
    pub fn with_log<T, F>(&self, iface: &Interface, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTx<'_>, Option<&InterfaceLog>) -> Result<T>,
    {
        self.with_tx(TransactionBehavior::Immediate, |tx| {
            let last = tx.last_log(iface.id).with_context(|| {
                format!("failed to query last log for interface {:?}", iface.name())
            })?;
            f(tx, last.as_ref())
        })
    }

    /// Latest log entry for the interface identified by device and network name.
    pub fn last_log_by_device(&self, device_name: &str, network_name: &str) -> Result<InterfaceLog> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT l.id, l.iface_id, l.ts, l.operation, l.state, l.dirty, l.message
                 FROM iface_log l JOIN iface i ON (i.id = l.iface_id)
                 WHERE i.device_name = ?1 AND i.net_name = ?2
                 ORDER BY l.id DESC
                 LIMIT 1",
                params![device_name, network_name],
                RawLog::from_row,
            )
            .optional()
            .context("failed to query interface last log")?;

        match raw {
            Some(raw) => raw.parse(),
            None => Err(Error::not_found(
                "interface log",
                format!("{}.{}", device_name, network_name),
            )),
        }
    }
}

/// An open store transaction. Dropping it without commit rolls back.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
    key: &'a StoreKey,
}

impl StoreTx<'_> {
    /// Upsert the interface row and replace its peer set, returning the row
    /// id. `iface` is left untouched: an id assigned here is only valid if
    /// the transaction commits.
    ///
    /// An update matches on both id and device id, so a stale id never
    /// overwrites another device's row.
    pub fn ensure_interface(&mut self, iface: &Interface) -> Result<i64> {
        let now = Utc::now().timestamp();
        let key = encrypt_secret(iface.private_key.as_bytes(), self.key)
            .context("failed to encrypt private key")?;
        let token = encrypt_secret(&iface.device_token, self.key)
            .context("failed to encrypt device token")?;

        let id = if iface.id == 0 {
            self.tx
                .execute(
                    "INSERT INTO iface (
                        created_at, updated_at, api_url,
                        net_id, net_name, net_cidr,
                        device_id, device_name, device_endpoint, device_addr, public_key,
                        listen_port, key, device_token
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        now,
                        now,
                        iface.api_url,
                        iface.network.id,
                        iface.network.name,
                        iface.network.cidr.to_string(),
                        iface.device.id,
                        iface.device.name,
                        iface.device.endpoint,
                        iface.device.addr.to_string(),
                        iface.device.public_key.to_string(),
                        iface.listen_port,
                        key,
                        token,
                    ],
                )
                .map_err(|e| Error::from_write("interface", e))
                .with_context(|| format!("failed to insert interface {:?}", iface.name()))?;
            let id = self.tx.last_insert_rowid();
            info!("Inserted interface {} with id {}", iface.name(), id);
            id
        } else {
            let updated = self
                .tx
                .execute(
                    "UPDATE iface SET
                        updated_at = ?1, api_url = ?2,
                        net_id = ?3, net_name = ?4, net_cidr = ?5,
                        device_id = ?6, device_name = ?7, device_endpoint = ?8,
                        device_addr = ?9, public_key = ?10,
                        listen_port = ?11, key = ?12, device_token = ?13
                     WHERE id = ?14 AND device_id = ?6",
                    params![
                        now,
                        iface.api_url,
                        iface.network.id,
                        iface.network.name,
                        iface.network.cidr.to_string(),
                        iface.device.id,
                        iface.device.name,
                        iface.device.endpoint,
                        iface.device.addr.to_string(),
                        iface.device.public_key.to_string(),
                        iface.listen_port,
                        key,
                        token,
                        iface.id,
                    ],
                )
                .map_err(|e| Error::from_write("interface", e))
                .with_context(|| format!("failed to update interface {}", iface.id))?;
            if updated == 0 {
                return Err(Error::not_found("interface", iface.id));
            }
            debug!("Updated interface {} ({})", iface.name(), iface.id);
            iface.id
        };

        self.tx
            .execute("DELETE FROM peer WHERE iface_id = ?1", params![id])
            .context("failed to replace existing peers")?;
        {
            let mut stmt = self.tx.prepare_cached(
                "INSERT INTO peer (iface_id, device_id, device_name, device_endpoint, device_addr, public_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for peer in &iface.peers {
                stmt.execute(params![
                    id,
                    peer.id,
                    peer.name,
                    peer.endpoint,
                    peer.addr.to_string(),
                    peer.public_key.to_string(),
                ])
                .map_err(|e| Error::from_write("peer", e))
                .with_context(|| format!("failed to insert peer {:?}", peer.id))?;
            }
        }
        debug!("Replaced peers of interface {} with {} peers", id, iface.peers.len());

        Ok(id)
    }

    /// Read one interface within this transaction.
    pub fn interface(&self, id: i64) -> Result<Interface> {
        let raw = self
            .tx
            .query_row(
                "SELECT api_url, net_id, net_name, net_cidr,
                        device_id, device_name, device_endpoint, device_addr, public_key,
                        listen_port, key, device_token
                 FROM iface WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RawInterface {
                        api_url: row.get(0)?,
                        net_id: row.get(1)?,
                        net_name: row.get(2)?,
                        net_cidr: row.get(3)?,
                        device: RawDevice {
                            id: row.get(4)?,
                            name: row.get(5)?,
                            endpoint: row.get(6)?,
                            addr: row.get(7)?,
                            public_key: row.get(8)?,
                        },
                        listen_port: row.get(9)?,
                        key: row.get(10)?,
                        device_token: row.get(11)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to query interface {}", id))?
            .ok_or_else(|| Error::not_found("interface", id))?;

        let raw_peers = {
            let mut stmt = self.tx.prepare_cached(
                "SELECT device_id, device_name, device_endpoint, device_addr, public_key
                 FROM peer WHERE iface_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok(RawDevice {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    endpoint: row.get(2)?,
                    addr: row.get(3)?,
                    public_key: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to query peers")?
        };

        raw.parse(id, raw_peers, self.key).map_err(|e| {
            warn!("Interface {} failed to load: {}", id, e);
            e.context(format!("failed to query interface {}", id))
        })
    }

    fn interface_id_by_device(&self, device_name: &str, network_name: &str) -> Result<i64> {
        self.tx
            .query_row(
                "SELECT id FROM iface WHERE device_name = ?1 AND net_name = ?2",
                params![device_name, network_name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                Error::not_found("interface", format!("{}.{}", device_name, network_name))
            })
    }

    /// Latest log entry for the interface, or `None` if it has no history.
    pub fn last_log(&self, iface_id: i64) -> Result<Option<InterfaceLog>> {
        let raw = self
            .tx
            .query_row(
                "SELECT id, iface_id, ts, operation, state, dirty, message
                 FROM iface_log
                 WHERE iface_id = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                params![iface_id],
                RawLog::from_row,
            )
            .optional()?;
        raw.map(RawLog::parse).transpose()
    }

    /// Append a log entry for the interface with id `iface_id`.
    pub fn append_log(
        &mut self,
        iface_id: i64,
        operation: Operation,
        state: State,
        dirty: bool,
        message: &str,
    ) -> Result<InterfaceLog> {
        let now = Utc::now();
        self.tx
            .execute(
                "INSERT INTO iface_log (ts, iface_id, operation, state, dirty, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    now.timestamp_millis(),
                    iface_id,
                    operation.to_string(),
                    state.to_string(),
                    dirty,
                    message,
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                // the only constraint on a log row is its interface reference
                Some(rusqlite::ErrorCode::ConstraintViolation) => {
                    Error::not_found("interface", iface_id)
                }
                _ => Error::Database(e),
            })
            .with_context(|| format!("failed to append log for interface {}", iface_id))?;
        let id = self.tx.last_insert_rowid();
        debug!(
            "Appended log {} for interface {}: {} {} dirty={}",
            id,
            iface_id,
            operation,
            state,
            dirty
        );

        Ok(InterfaceLog {
            id,
            iface_id,
            // Round-trip through storage precision so callers see what a read returns
            timestamp: DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now),
            operation,
            state,
            dirty,
            message: message.to_string(),
        })
    }
}

// ============================================================================
// Raw rows
// ============================================================================

/// Device columns as persisted
struct RawDevice {
    id: String,
    name: String,
    endpoint: String,
    addr: String,
    public_key: String,
}

impl RawDevice {
    fn parse(self, what: &str) -> Result<Device> {
        let addr = parse_address(&self.addr)
            .with_context(|| format!("invalid {} address", what))?;
        let public_key: Key = self
            .public_key
            .parse()
            .with_context(|| format!("invalid {} public key", what))?;
        Ok(Device {
            id: self.id,
            name: self.name,
            endpoint: self.endpoint,
            addr,
            public_key,
        })
    }
}

/// Interface row before parsing and decryption
struct RawInterface {
    api_url: String,
    net_id: String,
    net_name: String,
    net_cidr: String,
    device: RawDevice,
    listen_port: i64,
    key: Vec<u8>,
    device_token: Vec<u8>,
}

impl RawInterface {
    fn parse(self, id: i64, peers: Vec<RawDevice>, key: &StoreKey) -> Result<Interface> {
        let cidr = parse_address(&self.net_cidr).context("invalid network CIDR")?;
        let device = self.device.parse("device")?;
        let listen_port = u16::try_from(self.listen_port)
            .map_err(|e| Error::parse("listen port", self.listen_port.to_string(), e))?;

        let private_key = decrypt_secret(&self.key, key).context("failed to decrypt key")?;
        let private_key = Key::from_slice(&private_key).map_err(|_| {
            Error::parse(
                "private key",
                "<redacted>",
                format!("invalid key length {}", private_key.len()),
            )
        })?;
        let device_token =
            decrypt_secret(&self.device_token, key).context("failed to decrypt device token")?;

        let peers = peers
            .into_iter()
            .map(|p| p.parse("peer"))
            .collect::<Result<Vec<_>>>()?;

        Ok(Interface {
            id,
            api_url: self.api_url,
            network: Network {
                id: self.net_id,
                name: self.net_name,
                cidr,
            },
            device,
            listen_port,
            private_key,
            device_token,
            peers,
        })
    }
}

/// Log row before parsing
struct RawLog {
    id: i64,
    iface_id: i64,
    ts: i64,
    operation: String,
    state: String,
    dirty: bool,
    message: String,
}

impl RawLog {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            iface_id: row.get(1)?,
            ts: row.get(2)?,
            operation: row.get(3)?,
            state: row.get(4)?,
            dirty: row.get(5)?,
            message: row.get(6)?,
        })
    }

    fn parse(self) -> Result<InterfaceLog> {
        let timestamp = DateTime::from_timestamp_millis(self.ts)
            .ok_or_else(|| Error::parse("log timestamp", self.ts.to_string(), "out of range"))?;
        let operation = self
            .operation
            .parse::<Operation>()
            .map_err(|e: String| Error::parse("log operation", self.operation.as_str(), e))?;
        let state = self
            .state
            .parse::<State>()
            .map_err(|e: String| Error::parse("log state", self.state.as_str(), e))?;
        Ok(InterfaceLog {
            id: self.id,
            iface_id: self.iface_id,
            timestamp,
            operation,
            state,
            dirty: self.dirty,
            message: self.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshagent_common::ErrorKind;

    fn test_store() -> Store {
        Store::open_memory(StoreKey::generate()).unwrap()
    }

    fn device(id: &str, name: &str, host: u8) -> Device {
        Device {
            id: id.to_string(),
            name: name.to_string(),
            endpoint: format!("198.51.100.{}:51820", host),
            addr: parse_address(&format!("10.42.0.{}/24", host)).unwrap(),
            public_key: Key::generate_private().public_key(),
        }
    }

    fn interface(device_id: &str, device_name: &str, network: &str, peers: usize) -> Interface {
        let private_key = Key::generate_private();
        let mut local = device(device_id, device_name, 2);
        local.public_key = private_key.public_key();
        Interface {
            id: 0,
            api_url: "https://api.example.com".to_string(),
            network: Network {
                id: format!("{}-id", network),
                name: network.to_string(),
                cidr: parse_address("10.42.0.0/24").unwrap(),
            },
            device: local,
            listen_port: 51820,
            private_key,
            device_token: b"device-token".to_vec(),
            peers: (0..peers)
                .map(|i| device(&format!("peer-{}", i), &format!("peer{}", i), 10 + i as u8))
                .collect(),
        }
    }

    fn peer_rows(store: &Store, iface_id: i64) -> i64 {
        store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM peer WHERE iface_id = ?1", params![iface_id], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn test_insert_assigns_id_and_roundtrips() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 3);
        store.ensure_interface(&mut iface).unwrap();
        assert!(iface.id > 0);

        let loaded = store.interface(iface.id).unwrap();
        assert_eq!(loaded, iface);
    }

    #[test]
    fn test_secrets_are_encrypted_at_rest() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 0);
        store.ensure_interface(&mut iface).unwrap();

        let (key, token): (Vec<u8>, Vec<u8>) = store
            .conn
            .lock()
            .query_row("SELECT key, device_token FROM iface WHERE id = ?1", params![iface.id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_ne!(&key[..], &iface.private_key.as_bytes()[..]);
        assert!(!token.windows(b"device-token".len()).any(|w| w == b"device-token"));
        assert_eq!(decrypt_secret(&token, &store.key).unwrap(), b"device-token");
    }

    #[test]
    fn test_update_replaces_fields_and_peers() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 4);
        store.ensure_interface(&mut iface).unwrap();
        let id = iface.id;

        iface.device.name = "laptop-renamed".to_string();
        iface.listen_port = 51821;
        iface.peers = vec![device("peer-9", "peer9", 99)];
        store.ensure_interface(&mut iface).unwrap();
        assert_eq!(iface.id, id);

        assert_eq!(peer_rows(&store, id), 1);
        let loaded = store.interface_by_device("laptop-renamed", "home").unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.listen_port, 51821);
        assert_eq!(loaded.peers, iface.peers);
        assert_eq!(
            store.interface_by_device("laptop", "home").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 2);
        store.ensure_interface(&mut iface).unwrap();
        store.ensure_interface(&mut iface).unwrap();

        assert_eq!(peer_rows(&store, iface.id), 2);
        assert_eq!(store.interfaces().unwrap().len(), 1);
        assert_eq!(store.interface(iface.id).unwrap(), iface);
    }

    #[test]
    fn test_empty_peer_set_clears_peers() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 3);
        store.ensure_interface(&mut iface).unwrap();
        iface.peers.clear();
        store.ensure_interface(&mut iface).unwrap();
        assert_eq!(peer_rows(&store, iface.id), 0);
        assert!(store.interface(iface.id).unwrap().peers.is_empty());
    }

    #[test]
    fn test_peer_order_is_preserved() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 0);
        iface.peers = vec![device("c", "c", 30), device("a", "a", 10), device("b", "b", 20)];
        store.ensure_interface(&mut iface).unwrap();
        let ids: Vec<_> = store
            .interface(iface.id)
            .unwrap()
            .peers
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn test_uniqueness_conflicts() {
        let store = test_store();
        let mut first = interface("dev-1", "laptop", "home", 1);
        store.ensure_interface(&mut first).unwrap();

        let mut same_device_id = interface("dev-1", "desktop", "work", 0);
        let mut same_names = interface("dev-2", "laptop", "home", 0);
        let mut same_key = interface("dev-3", "phone", "home", 0);
        same_key.device.public_key = first.device.public_key;

        for candidate in [&mut same_device_id, &mut same_names, &mut same_key] {
            let err = store.ensure_interface(candidate).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Conflict, "{err}");
            assert_eq!(candidate.id, 0);
        }

        let all = store.interfaces().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].interface, first);
    }

    #[test]
    fn test_update_into_conflict_rolls_back() {
        let store = test_store();
        let mut first = interface("dev-1", "laptop", "home", 0);
        let mut second = interface("dev-2", "desktop", "home", 2);
        store.ensure_interface(&mut first).unwrap();
        store.ensure_interface(&mut second).unwrap();

        let before = store.interface(second.id).unwrap();
        let mut clash = second.clone();
        clash.device.name = "laptop".to_string();
        clash.peers.clear();
        let err = store.ensure_interface(&mut clash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.interface(second.id).unwrap(), before);
        assert_eq!(peer_rows(&store, second.id), 2);
    }

    #[test]
    fn test_update_unknown_id_is_not_found() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 1);
        iface.id = 42;
        let err = store.ensure_interface(&mut iface).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(iface.id, 42);
        assert!(store.interfaces().unwrap().is_empty());
    }

    #[test]
    fn test_missing_interface_is_not_found() {
        let store = test_store();
        assert_eq!(store.interface(1).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            store.interface_by_device("laptop", "home").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_wrong_store_key_aborts_read() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 0);
        store.ensure_interface(&mut iface).unwrap();

        let other = Store {
            conn: store.conn.clone(),
            key: StoreKey::generate(),
        };
        let err = other.interface(iface.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(err.kind().is_fatal());
        assert!(other.interfaces().is_err());
    }

    #[test]
    fn test_corrupt_peer_row_aborts_read() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 2);
        store.ensure_interface(&mut iface).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE peer SET device_addr = 'not-an-address' WHERE device_id = 'peer-1'", [])
            .unwrap();

        let err = store.interface(iface.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_with_log_without_history() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 0);
        store.ensure_interface(&mut iface).unwrap();

        let saw_none = store.with_log(&iface, |_, last| Ok(last.is_none())).unwrap();
        assert!(saw_none);
        assert_eq!(
            store.last_log_by_device("laptop", "home").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_last_log_is_highest_id() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 0);
        store.ensure_interface(&mut iface).unwrap();

        let steps = [
            (Operation::Join, State::Joined, true),
            (Operation::Apply, State::Failed, true),
            (Operation::Apply, State::Applied, false),
        ];
        let mut appended = Vec::new();
        for (op, state, dirty) in steps {
            let entry = store
                .with_log(&iface, |tx, last| {
                    assert_eq!(last.map(|l| l.id), appended.last().map(|l: &InterfaceLog| l.id));
                    tx.append_log(iface.id, op, state, dirty, "step")
                })
                .unwrap();
            appended.push(entry);
        }

        let last = store.last_log_by_device("laptop", "home").unwrap();
        assert_eq!(&last, appended.last().unwrap());
        assert_eq!(last.operation, Operation::Apply);
        assert_eq!(last.state, State::Applied);
        assert!(!last.dirty);
        assert!(appended.windows(2).all(|w| w[0].id < w[1].id));
        assert!(appended.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_with_log_failure_rolls_back() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 2);
        store.ensure_interface(&mut iface).unwrap();

        let mut changed = iface.clone();
        changed.peers.clear();
        let err = store
            .with_log(&iface, |tx, _| {
                let id = tx.ensure_interface(&changed)?;
                tx.append_log(id, Operation::Refresh, State::Refreshed, true, "refreshed")?;
                Err::<(), _>(Error::Crypto("tunnel rejected key".to_string()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);

        assert_eq!(store.interface(iface.id).unwrap().peers.len(), 2);
        assert!(store.last_log_by_device("laptop", "home").is_err());
    }

    #[test]
    fn test_with_log_callback_reads_through_tx() {
        let store = test_store();
        let mut iface = interface("dev-1", "laptop", "home", 2);
        store.ensure_interface(&mut iface).unwrap();

        let loaded = store
            .with_log(&iface, |tx, _| {
                tx.append_log(iface.id, Operation::Apply, State::Applied, false, "applied")?;
                let loaded = tx.interface(iface.id)?;
                assert_eq!(tx.last_log(iface.id)?.map(|l| l.state), Some(State::Applied));
                Ok(loaded)
            })
            .unwrap();
        assert_eq!(loaded, iface);
    }

    #[test]
    fn test_rolled_back_join_keeps_caller_id_unset() {
        let store = test_store();
        let mut a = interface("dev-a", "laptop", "home", 1);
        let snapshot = a.clone();
        let err = store
            .with_log(&snapshot, |tx, _| {
                let id = tx.ensure_interface(&a)?;
                tx.append_log(id, Operation::Join, State::Joined, true, "joined")?;
                Err::<(), _>(Error::Crypto("tunnel rejected key".to_string()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert_eq!(a.id, 0);
        assert!(store.interfaces().unwrap().is_empty());

        // the rolled back row id is handed out again
        let mut b = interface("dev-b", "desktop", "work", 2);
        store.ensure_interface(&mut b).unwrap();
        store.ensure_interface(&mut a).unwrap();
        assert_ne!(a.id, b.id);

        assert_eq!(store.interfaces().unwrap().len(), 2);
        assert_eq!(store.interface(a.id).unwrap(), a);
        assert_eq!(store.interface(b.id).unwrap(), b);
    }

    #[test]
    fn test_stale_id_never_overwrites_other_device() {
        let store = test_store();
        let mut owner = interface("dev-b", "desktop", "work", 2);
        store.ensure_interface(&mut owner).unwrap();

        let mut stale = interface("dev-a", "laptop", "home", 1);
        stale.id = owner.id;
        let err = store.ensure_interface(&mut stale).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(store.interface(owner.id).unwrap(), owner);
        assert_eq!(peer_rows(&store, owner.id), 2);
    }

    #[test]
    fn test_interfaces_reports_latest_log() {
        let store = test_store();
        let mut a = interface("dev-1", "laptop", "home", 1);
        let mut b = interface("dev-2", "laptop", "work", 0);
        store.ensure_interface(&mut a).unwrap();
        store.ensure_interface(&mut b).unwrap();
        store
            .with_log(&a, |tx, _| {
                tx.append_log(a.id, Operation::Join, State::Joined, true, "joined")?;
                tx.append_log(a.id, Operation::Apply, State::Applied, false, "applied")
            })
            .unwrap();

        let all = store.interfaces().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].interface.id, a.id);
        assert_eq!(all[0].log.as_ref().map(|l| l.state), Some(State::Applied));
        assert!(all[1].log.is_none());
    }

    #[test]
    fn test_log_requires_existing_interface() {
        let store = test_store();
        let mut ghost = interface("dev-1", "laptop", "home", 0);
        ghost.id = 77;
        let result = store.with_log(&ghost, |tx, _| {
            tx.append_log(ghost.id, Operation::Apply, State::Applied, false, "")
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
