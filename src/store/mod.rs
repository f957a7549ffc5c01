//! SQLite-backed persistence.
//!
//! One file-backed connection behind a mutex; the engine enforces
//! single-writer semantics and all writes serialize. Startup creates the
//! schema and seeds the singleton rows; a periodic sync writes live egress
//! counters and a statistics snapshot back.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::egress::EgressSnapshot;
use crate::error::{Error, Result};
use crate::server::config::{GatewayConfig, Settings};

/// One egress row as persisted.
#[derive(Debug, Clone)]
pub struct EgressRow {
    pub id: i64,
    pub address: String,
    pub interface: String,
    pub weight: u32,
    pub enabled: bool,
    pub selections: u64,
    pub success: u64,
    pub failure: u64,
    pub bytes: u64,
}

/// One source rule row as persisted.
#[derive(Debug, Clone)]
pub struct RuleRow {
    pub egress_id: i64,
    pub source_ip: String,
    pub weight: u32,
    pub description: String,
}

/// One statistics snapshot row.
#[derive(Debug, Clone)]
pub struct StatisticsRow {
    pub total_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub uptime_seconds: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY,
    listen_host TEXT NOT NULL DEFAULT '127.0.0.1',
    listen_port INTEGER NOT NULL DEFAULT 8080,
    web_port INTEGER NOT NULL DEFAULT 8090,
    config_file TEXT NOT NULL DEFAULT 'source_ip_rules.json',
    tunnel_mode INTEGER NOT NULL DEFAULT 0,
    debug_mode INTEGER NOT NULL DEFAULT 0,
    quiet_mode INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS egress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL UNIQUE,
    interface TEXT NOT NULL DEFAULT '',
    weight INTEGER NOT NULL DEFAULT 1,
    enabled INTEGER NOT NULL DEFAULT 1,
    selections INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    failure INTEGER NOT NULL DEFAULT 0,
    bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    egress_id INTEGER NOT NULL REFERENCES egress(id) ON DELETE CASCADE,
    source_ip TEXT NOT NULL,
    weight INTEGER NOT NULL DEFAULT 1,
    description TEXT NOT NULL DEFAULT '',
    UNIQUE(egress_id, source_ip)
);

CREATE TABLE IF NOT EXISTS statistics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    total_connections INTEGER NOT NULL DEFAULT 0,
    total_bytes_in INTEGER NOT NULL DEFAULT 0,
    total_bytes_out INTEGER NOT NULL DEFAULT 0,
    uptime_seconds REAL NOT NULL DEFAULT 0,
    snapshot_time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS gateway (
    id INTEGER PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0,
    gateway_ip TEXT NOT NULL DEFAULT '192.168.100.1',
    subnet_cidr TEXT NOT NULL DEFAULT '192.168.100.0/24',
    transparent_port INTEGER NOT NULL DEFAULT 8888,
    dns_port INTEGER NOT NULL DEFAULT 5353,
    nat_interface TEXT NOT NULL DEFAULT '',
    auto_configure INTEGER NOT NULL DEFAULT 1,
    dhcp_range_start TEXT NOT NULL DEFAULT '192.168.100.10',
    dhcp_range_end TEXT NOT NULL DEFAULT '192.168.100.100',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

/// Handle to the SQLite store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the store at `path`, build the schema,
    /// and seed the singleton rows.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(Error::Io)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::initialize(conn)?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (id) VALUES (1)",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO gateway (id) VALUES (1)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn load_settings(&self) -> Result<Settings> {
        let conn = self.conn.lock();
        let settings = conn
            .query_row(
                "SELECT listen_host, listen_port, web_port, config_file,
                        tunnel_mode, debug_mode, quiet_mode
                 FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok(Settings {
                        listen_host: row.get(0)?,
                        listen_port: row.get(1)?,
                        web_port: row.get(2)?,
                        config_file: row.get(3)?,
                        tunnel_mode: row.get(4)?,
                        debug_mode: row.get(5)?,
                        quiet_mode: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(settings.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings
             (id, listen_host, listen_port, web_port, config_file,
              tunnel_mode, debug_mode, quiet_mode, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)",
            params![
                settings.listen_host,
                settings.listen_port,
                settings.web_port,
                settings.config_file,
                settings.tunnel_mode,
                settings.debug_mode,
                settings.quiet_mode,
            ],
        )?;
        Ok(())
    }

    pub fn load_gateway(&self) -> Result<GatewayConfig> {
        let conn = self.conn.lock();
        let gateway = conn
            .query_row(
                "SELECT enabled, gateway_ip, subnet_cidr, transparent_port,
                        dns_port, nat_interface, auto_configure,
                        dhcp_range_start, dhcp_range_end
                 FROM gateway WHERE id = 1",
                [],
                |row| {
                    Ok(GatewayConfig {
                        enabled: row.get(0)?,
                        gateway_ip: row.get(1)?,
                        subnet_cidr: row.get(2)?,
                        transparent_port: row.get(3)?,
                        dns_port: row.get(4)?,
                        nat_interface: row.get(5)?,
                        auto_configure: row.get(6)?,
                        dhcp_range_start: row.get(7)?,
                        dhcp_range_end: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(gateway.unwrap_or_default())
    }

    pub fn save_gateway(&self, gateway: &GatewayConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO gateway
             (id, enabled, gateway_ip, subnet_cidr, transparent_port, dns_port,
              nat_interface, auto_configure, dhcp_range_start, dhcp_range_end,
              updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)",
            params![
                gateway.enabled,
                gateway.gateway_ip,
                gateway.subnet_cidr,
                gateway.transparent_port,
                gateway.dns_port,
                gateway.nat_interface,
                gateway.auto_configure,
                gateway.dhcp_range_start,
                gateway.dhcp_range_end,
            ],
        )?;
        Ok(())
    }

    /// All egress rows in creation order.
    pub fn list_egresses(&self) -> Result<Vec<EgressRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, address, interface, weight, enabled,
                    selections, success, failure, bytes
             FROM egress ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EgressRow {
                    id: row.get(0)?,
                    address: row.get(1)?,
                    interface: row.get(2)?,
                    weight: row.get(3)?,
                    enabled: row.get(4)?,
                    selections: row.get(5)?,
                    success: row.get(6)?,
                    failure: row.get(7)?,
                    bytes: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert a new egress and return its assigned id.
    pub fn insert_egress(&self, address: &str, interface: &str, weight: u32) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO egress (address, interface, weight) VALUES (?1, ?2, ?3)",
            params![address, interface, weight],
        )
        .map_err(|e| {
            if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
                Error::Duplicate(address.to_string())
            } else {
                Error::Store(e)
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete an egress; rule rows cascade.
    pub fn delete_egress(&self, address: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM egress WHERE address = ?1", params![address])?;
        if rows == 0 {
            return Err(Error::NotFound(format!("egress {address}")));
        }
        Ok(())
    }

    pub fn set_egress_enabled(&self, address: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE egress SET enabled = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE address = ?2",
            params![enabled, address],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("egress {address}")));
        }
        Ok(())
    }

    pub fn set_egress_weight(&self, address: &str, weight: u32) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE egress SET weight = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE address = ?2",
            params![weight, address],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("egress {address}")));
        }
        Ok(())
    }

    /// Write live counters back to the egress rows.
    pub fn sync_counters(&self, snapshots: &[EgressSnapshot]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for snap in snapshots {
            tx.execute(
                "UPDATE egress
                 SET selections = ?1, success = ?2, failure = ?3, bytes = ?4,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?5",
                params![
                    snap.selections,
                    snap.success,
                    snap.failure,
                    snap.bytes_total,
                    snap.id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_rule(&self, egress_id: i64, source_ip: &str, weight: u32, description: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rules (egress_id, source_ip, weight, description)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (egress_id, source_ip)
             DO UPDATE SET weight = excluded.weight, description = excluded.description",
            params![egress_id, source_ip, weight, description],
        )?;
        Ok(())
    }

    pub fn delete_rule(&self, egress_id: i64, source_ip: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM rules WHERE egress_id = ?1 AND source_ip = ?2",
            params![egress_id, source_ip],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("rule for {source_ip}")));
        }
        Ok(())
    }

    pub fn list_rules(&self) -> Result<Vec<RuleRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT egress_id, source_ip, weight, description FROM rules ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RuleRow {
                    egress_id: row.get(0)?,
                    source_ip: row.get(1)?,
                    weight: row.get(2)?,
                    description: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Append a statistics snapshot row.
    pub fn append_statistics(&self, stats: &StatisticsRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO statistics
             (total_connections, total_bytes_in, total_bytes_out, uptime_seconds)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                stats.total_connections,
                stats.total_bytes_in,
                stats.total_bytes_out,
                stats.uptime_seconds,
            ],
        )?;
        Ok(())
    }

    /// Most recent statistics snapshot, if any.
    pub fn latest_statistics(&self) -> Result<Option<StatisticsRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT total_connections, total_bytes_in, total_bytes_out, uptime_seconds
                 FROM statistics ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(StatisticsRow {
                        total_connections: row.get(0)?,
                        total_bytes_in: row.get(1)?,
                        total_bytes_out: row.get(2)?,
                        uptime_seconds: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::registry::Egress;

    #[test]
    fn test_seeds_singleton_rows() {
        let store = Store::open_in_memory().unwrap();
        let settings = store.load_settings().unwrap();
        assert_eq!(settings.listen_port, 8080);
        assert_eq!(settings.web_port, 8090);

        let gateway = store.load_gateway().unwrap();
        assert!(!gateway.enabled);
        assert_eq!(gateway.transparent_port, 8888);
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut settings = store.load_settings().unwrap();
        settings.listen_port = 1080;
        settings.tunnel_mode = true;
        store.save_settings(&settings).unwrap();

        let reloaded = store.load_settings().unwrap();
        assert_eq!(reloaded.listen_port, 1080);
        assert!(reloaded.tunnel_mode);
    }

    #[test]
    fn test_gateway_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut gateway = store.load_gateway().unwrap();
        gateway.enabled = true;
        gateway.nat_interface = "eth0".into();
        store.save_gateway(&gateway).unwrap();

        let reloaded = store.load_gateway().unwrap();
        assert!(reloaded.enabled);
        assert_eq!(reloaded.nat_interface, "eth0");
    }

    #[test]
    fn test_egress_crud() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_egress("192.168.1.10", "eth0", 3).unwrap();
        assert!(id > 0);

        let err = store.insert_egress("192.168.1.10", "eth1", 1).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        store.set_egress_weight("192.168.1.10", 5).unwrap();
        store.set_egress_enabled("192.168.1.10", false).unwrap();

        let rows = store.list_egresses().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].weight, 5);
        assert!(!rows[0].enabled);

        store.delete_egress("192.168.1.10").unwrap();
        assert!(matches!(
            store.delete_egress("192.168.1.10"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rule_upsert_replaces() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_egress("192.168.1.10", "eth0", 1).unwrap();

        store.upsert_rule(id, "10.0.0.5", 2, "first").unwrap();
        store.upsert_rule(id, "10.0.0.5", 7, "second").unwrap();

        let rules = store.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].weight, 7);
        assert_eq!(rules[0].description, "second");
    }

    #[test]
    fn test_egress_delete_cascades_rules() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_egress("192.168.1.10", "eth0", 1).unwrap();
        store.upsert_rule(id, "10.0.0.5", 2, "").unwrap();
        store.upsert_rule(id, "10.0.0.6", 3, "").unwrap();

        store.delete_egress("192.168.1.10").unwrap();
        assert!(store.list_rules().unwrap().is_empty());
    }

    #[test]
    fn test_counter_sync_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_egress("192.168.1.10", "eth0", 1).unwrap();

        let mut egress = Egress::new(id, "192.168.1.10", "eth0", 1);
        egress.selections = 12;
        egress.success = 10;
        egress.failure = 2;
        egress.bytes_in = 4096;
        egress.bytes_out = 1024;
        store.sync_counters(&[egress.snapshot()]).unwrap();

        let rows = store.list_egresses().unwrap();
        assert_eq!(rows[0].selections, 12);
        assert_eq!(rows[0].success, 10);
        assert_eq!(rows[0].failure, 2);
        assert_eq!(rows[0].bytes, 5120);
    }

    #[test]
    fn test_statistics_append() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.latest_statistics().unwrap().is_none());

        store
            .append_statistics(&StatisticsRow {
                total_connections: 42,
                total_bytes_in: 1000,
                total_bytes_out: 2000,
                uptime_seconds: 3.5,
            })
            .unwrap();

        let latest = store.latest_statistics().unwrap().unwrap();
        assert_eq!(latest.total_connections, 42);
        assert_eq!(latest.total_bytes_in, 1000);
        assert!((latest.uptime_seconds - 3.5).abs() < f64::EPSILON);
    }
}
