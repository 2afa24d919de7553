//! Synchronous SQLite access layer behind a blocking-pool boundary.
//!
//! Grounded in `router-api/src/module/database.rs`'s `Database {
//! connection: Arc<Mutex<Connection>> }` wrapper (same ownership shape,
//! same bundled-`rusqlite` dependency); the upsert statements for traffic
//! logs and heartbeats are grounded in
//! `router-api/src/module/fs_watch/db_pool.rs`'s
//! `INSERT ... ON CONFLICT DO UPDATE` pattern. Every public method runs
//! its SQL on `tokio::task::spawn_blocking`, per spec.md §9's "never call
//! [blocking work] directly from the accept task" note.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

/// A user row as read by the credential cache / auth fallback path.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_bcrypt: String,
    pub status: String,
    pub bandwidth_limit: u64,
}

impl UserRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// A filter rule row as read by the policy cache.
#[derive(Debug, Clone)]
pub struct FilterRuleRow {
    pub id: String,
    pub pattern: String,
    pub rule_type: String,
    pub description: String,
    pub enabled: bool,
}

impl FilterRuleRow {
    pub fn is_block(&self) -> bool {
        self.enabled && self.rule_type == "block"
    }
}

/// One accumulated traffic record awaiting a batched flush.
#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub user_id: String,
    pub client_endpoint: String,
    pub target_host: String,
    pub target_port: u16,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub timestamp: String,
}

/// One heartbeat upsert.
#[derive(Debug, Clone)]
pub struct HeartbeatRow {
    pub proxy_id: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub status: &'static str,
    pub active_conns: u32,
    pub total_conns: u64,
    pub last_heartbeat: String,
}

/// Thread-safe SQLite handle. Cloning is cheap (shares the connection).
#[derive(Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the database at `path` and ensure the
    /// schema the data plane reads/writes exists (spec.md §6).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_bcrypt TEXT NOT NULL,
                status TEXT NOT NULL,
                bandwidth_limit INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS url_filters (
                id TEXT PRIMARY KEY,
                pattern TEXT NOT NULL,
                type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                description TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS bandwidth_limits (
                user_id TEXT PRIMARY KEY,
                limit_bytes INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS traffic_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                target_ip TEXT NOT NULL,
                target_port INTEGER NOT NULL,
                protocol TEXT NOT NULL DEFAULT 'tcp',
                bytes_sent INTEGER NOT NULL,
                bytes_recv INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS proxy_heartbeats (
                proxy_id TEXT PRIMARY KEY,
                proxy_host TEXT NOT NULL,
                proxy_port INTEGER NOT NULL,
                status TEXT NOT NULL,
                active_conns INTEGER NOT NULL,
                total_conns INTEGER NOT NULL,
                last_heartbeat TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, for tests only.
    #[cfg(test)]
    pub fn open_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id TEXT PRIMARY KEY, username TEXT UNIQUE, password_bcrypt TEXT, status TEXT, bandwidth_limit INTEGER);
             CREATE TABLE url_filters (id TEXT PRIMARY KEY, pattern TEXT, type TEXT, enabled INTEGER, description TEXT);
             CREATE TABLE bandwidth_limits (user_id TEXT PRIMARY KEY, limit_bytes INTEGER, enabled INTEGER);
             CREATE TABLE traffic_logs (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id TEXT, client_ip TEXT, target_ip TEXT, target_port INTEGER, protocol TEXT, bytes_sent INTEGER, bytes_recv INTEGER, timestamp TEXT);
             CREATE TABLE proxy_heartbeats (proxy_id TEXT PRIMARY KEY, proxy_host TEXT, proxy_port INTEGER, status TEXT, active_conns INTEGER, total_conns INTEGER, last_heartbeat TEXT);",
        )
        .unwrap();
        Self {
            connection: Arc::new(Mutex::new(conn)),
        }
    }

    #[cfg(test)]
    pub fn connection_for_test(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.connection.lock().unwrap()
    }

    pub async fn all_active_users(&self) -> Result<Vec<UserRow>, StoreError> {
        let conn = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, username, password_bcrypt, status,
                        COALESCE((SELECT limit_bytes FROM bandwidth_limits b
                                  WHERE b.user_id = users.id AND b.enabled = 1),
                                 bandwidth_limit)
                 FROM users WHERE status = 'active'",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_bcrypt: row.get(2)?,
                        status: row.get(3)?,
                        bandwidth_limit: row.get::<_, i64>(4)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Direct by-username lookup, used only as the §4.C step-6 fallback
    /// when the credential cache lacks the user.
    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        let conn = self.connection.clone();
        let username = username.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT id, username, password_bcrypt, status, bandwidth_limit
                 FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_bcrypt: row.get(2)?,
                        status: row.get(3)?,
                        bandwidth_limit: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await?
    }

    pub async fn all_enabled_filter_rules(&self) -> Result<Vec<FilterRuleRow>, StoreError> {
        let conn = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, pattern, type, description, enabled FROM url_filters WHERE enabled = 1",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(FilterRuleRow {
                        id: row.get(0)?,
                        pattern: row.get(1)?,
                        rule_type: row.get(2)?,
                        description: row.get(3)?,
                        enabled: row.get::<_, i64>(4)? != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Bulk-insert a batch of traffic records. On failure, the caller
    /// logs and drops the batch (spec.md §4.D) rather than retrying.
    pub async fn insert_traffic_batch(&self, records: Vec<TrafficRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO traffic_logs
                        (user_id, client_ip, target_ip, target_port, protocol, bytes_sent, bytes_recv, timestamp)
                     VALUES (?1, ?2, ?3, ?4, 'tcp', ?5, ?6, ?7)",
                )?;
                for record in &records {
                    stmt.execute(params![
                        record.user_id,
                        record.client_endpoint,
                        record.target_host,
                        record.target_port,
                        record.bytes_sent,
                        record.bytes_recv,
                        record.timestamp,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Upsert a heartbeat row, idempotent under repeated identical calls
    /// (spec.md §8: "N calls with identical counters yield one row with
    /// the last timestamp").
    pub async fn upsert_heartbeat(&self, row: HeartbeatRow) -> Result<(), StoreError> {
        let conn = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO proxy_heartbeats
                    (proxy_id, proxy_host, proxy_port, status, active_conns, total_conns, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(proxy_id) DO UPDATE SET
                    status = ?4,
                    active_conns = ?5,
                    total_conns = ?6,
                    last_heartbeat = ?7",
                params![
                    row.proxy_id,
                    row.proxy_host,
                    row.proxy_port,
                    row.status,
                    row.active_conns,
                    row.total_conns,
                    row.last_heartbeat,
                ],
            )?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_upsert_is_idempotent() {
        let store = Store::open_memory();
        let row = HeartbeatRow {
            proxy_id: "host:1080".into(),
            proxy_host: "host".into(),
            proxy_port: 1080,
            status: "online",
            active_conns: 3,
            total_conns: 42,
            last_heartbeat: "2026-01-01T00:00:00Z".into(),
        };
        store.upsert_heartbeat(row.clone()).await.unwrap();
        let mut second = row;
        second.last_heartbeat = "2026-01-01T00:00:05Z".into();
        store.upsert_heartbeat(second).await.unwrap();

        let conn = store.connection.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM proxy_heartbeats", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let last: String = conn
            .query_row("SELECT last_heartbeat FROM proxy_heartbeats", [], |r| r.get(0))
            .unwrap();
        assert_eq!(last, "2026-01-01T00:00:05Z");
    }

    #[tokio::test]
    async fn bandwidth_limit_override_takes_precedence() {
        let store = Store::open_memory();
        {
            let conn = store.connection.lock().unwrap();
            conn.execute(
                "INSERT INTO users (id, username, password_bcrypt, status, bandwidth_limit)
                 VALUES ('u1', 'alice', 'hash', 'active', 1000)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO bandwidth_limits (user_id, limit_bytes, enabled) VALUES ('u1', 5000, 1)",
                [],
            )
            .unwrap();
        }
        let users = store.all_active_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].bandwidth_limit, 5000);
    }
}
