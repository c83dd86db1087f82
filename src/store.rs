//! SQLite store for services, certificates and security rules
//!
//! Every record is kept as a JSON body next to the columns that carry
//! constraints (ids, unique names, the location → service foreign key).
//! After each write the in-memory [`Snapshot`] is rebuilt and swapped in, so
//! readers never wait on a writer.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{Certificate, Location, RateLimitRule, SecurityListEntry, ServiceInstance};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Immutable view of everything persisted
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub services: Vec<ServiceInstance>,
    pub certificates: Vec<Certificate>,
    pub security_lists: Vec<SecurityListEntry>,
    pub rate_limits: Vec<RateLimitRule>,
}

impl Snapshot {
    pub fn service(&self, id: &str) -> Option<&ServiceInstance> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn certificate(&self, id: &str) -> Option<&Certificate> {
        self.certificates.iter().find(|c| c.id == id)
    }

    pub fn security_list(&self, id: &str) -> Option<&SecurityListEntry> {
        self.security_lists.iter().find(|e| e.id == id)
    }

    pub fn rate_limit(&self, id: &str) -> Option<&RateLimitRule> {
        self.rate_limits.iter().find(|r| r.id == id)
    }
}

pub struct Store {
    conn: Mutex<Connection>,
    snapshot: ArcSwap<Snapshot>,
    #[cfg(test)]
    fail_next_delete: std::sync::atomic::AtomicBool,
}

impl Store {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self::from_connection(conn)?;
        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            #[cfg(test)]
            fail_next_delete: std::sync::atomic::AtomicBool::new(false),
        };
        store.run_migrations()?;
        store.refresh()?;
        Ok(store)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: services, locations and certificates
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                listen_port INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS locations (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                body TEXT NOT NULL,
                FOREIGN KEY (service_id) REFERENCES services(id)
            );

            CREATE TABLE IF NOT EXISTS certificates (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL UNIQUE,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_locations_service ON locations(service_id);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: security lists, rate limits and ACME accounts
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: security rules and ACME accounts");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS security_lists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rate_limits (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS acme_accounts (
                email TEXT PRIMARY KEY,
                credentials TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Re-read everything from the database and swap the snapshot
    pub fn refresh(&self) -> Result<Arc<Snapshot>> {
        let snapshot = Arc::new(self.load_all()?);
        self.snapshot.store(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Read every record straight from the database
    pub fn load_all(&self) -> Result<Snapshot> {
        let conn = self.conn.lock();

        let mut services: Vec<ServiceInstance> = {
            let mut stmt = conn.prepare("SELECT body FROM services ORDER BY created_at, name")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|body| serde_json::from_str(body).context("Corrupt service record"))
                .collect::<Result<_>>()?
        };

        {
            let mut stmt = conn.prepare(
                "SELECT service_id, body FROM locations ORDER BY service_id, position",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (service_id, body) in rows {
                let location: Location =
                    serde_json::from_str(&body).context("Corrupt location record")?;
                if let Some(service) = services.iter_mut().find(|s| s.id == service_id) {
                    service.locations.push(location);
                }
            }
        }

        let certificates = load_bodies(&conn, "SELECT body FROM certificates ORDER BY domain")?;
        let security_lists = load_bodies(&conn, "SELECT body FROM security_lists ORDER BY name")?;
        let rate_limits = load_bodies(&conn, "SELECT body FROM rate_limits ORDER BY rowid")?;

        Ok(Snapshot {
            services,
            certificates,
            security_lists,
            rate_limits,
        })
    }

    // ==================== Service Operations ====================

    /// Insert or replace a service together with its locations
    pub fn save_service(&self, service: &ServiceInstance) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let mut header = service.clone();
            header.locations.clear();
            let body = serde_json::to_string(&header)?;

            tx.execute(
                "INSERT INTO services (id, name, listen_port, enabled, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    listen_port = excluded.listen_port,
                    enabled = excluded.enabled,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![
                    service.id,
                    service.name,
                    service.listen_port,
                    service.enabled,
                    body,
                    service.created_at.to_rfc3339(),
                    service.updated_at.to_rfc3339(),
                ],
            )?;

            tx.execute("DELETE FROM locations WHERE service_id = ?1", params![service.id])?;
            for (position, location) in service.locations.iter().enumerate() {
                let mut location = location.clone();
                location.service_id = service.id.clone();
                tx.execute(
                    "INSERT INTO locations (id, service_id, position, body) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        location.id,
                        service.id,
                        position as i64,
                        serde_json::to_string(&location)?
                    ],
                )?;
            }

            tx.commit()?;
        }
        self.refresh()?;
        Ok(())
    }

    /// Delete a service and its locations in one transaction
    pub fn delete_service(&self, id: &str) -> Result<bool> {
        let deleted = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM locations WHERE service_id = ?1", params![id])?;

            #[cfg(test)]
            if self
                .fail_next_delete
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                anyhow::bail!("injected delete failure");
            }

            let rows = tx.execute("DELETE FROM services WHERE id = ?1", params![id])?;
            tx.commit()?;
            rows > 0
        };
        self.refresh()?;
        Ok(deleted)
    }

    #[cfg(test)]
    pub(crate) fn fail_next_delete(&self) {
        self.fail_next_delete
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    // ==================== Certificate Operations ====================

    pub fn save_certificate(&self, cert: &Certificate) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO certificates (id, domain, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET domain = excluded.domain, body = excluded.body",
                params![cert.id, cert.domain, serde_json::to_string(cert)?],
            )?;
        }
        self.refresh()?;
        Ok(())
    }

    /// Apply `update` to the stored certificate in one transaction
    ///
    /// Returns `None` without writing when the record no longer exists.
    pub fn update_certificate<F>(&self, id: &str, update: F) -> Result<Option<Certificate>>
    where
        F: FnOnce(&mut Certificate),
    {
        let updated = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let current: Option<Certificate> = tx
                .query_row(
                    "SELECT body FROM certificates WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(|body| serde_json::from_str(&body).context("Corrupt certificate record"))
                .transpose()?;

            match current {
                Some(mut cert) => {
                    update(&mut cert);
                    tx.execute(
                        "UPDATE certificates SET domain = ?2, body = ?3 WHERE id = ?1",
                        params![cert.id, cert.domain, serde_json::to_string(&cert)?],
                    )?;
                    tx.commit()?;
                    Some(cert)
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.refresh()?;
        }
        Ok(updated)
    }

    pub fn delete_certificate(&self, id: &str) -> Result<bool> {
        let rows = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM certificates WHERE id = ?1", params![id])?
        };
        self.refresh()?;
        Ok(rows > 0)
    }

    // ==================== Security List Operations ====================

    pub fn save_security_entry(&self, entry: &SecurityListEntry) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO security_lists (id, name, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, body = excluded.body",
                params![entry.id, entry.name, serde_json::to_string(entry)?],
            )?;
        }
        self.refresh()?;
        Ok(())
    }

    /// Read, modify and write the list called `name` in one transaction
    ///
    /// `modify` gets the stored entry, if any, and returns the entry plus
    /// whether it changed. Unchanged entries are not written.
    pub fn modify_security_entry_by_name<F>(
        &self,
        name: &str,
        modify: F,
    ) -> Result<(SecurityListEntry, bool)>
    where
        F: FnOnce(Option<SecurityListEntry>) -> (SecurityListEntry, bool),
    {
        let (entry, changed) = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let current: Option<SecurityListEntry> = tx
                .query_row(
                    "SELECT body FROM security_lists WHERE name = ?1",
                    params![name],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(|body| serde_json::from_str(&body).context("Corrupt security list record"))
                .transpose()?;

            let (entry, changed) = modify(current);
            if changed {
                tx.execute(
                    "INSERT INTO security_lists (id, name, body) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, body = excluded.body",
                    params![entry.id, entry.name, serde_json::to_string(&entry)?],
                )?;
                tx.commit()?;
            }
            (entry, changed)
        };
        if changed {
            self.refresh()?;
        }
        Ok((entry, changed))
    }

    pub fn delete_security_entry(&self, id: &str) -> Result<bool> {
        let rows = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM security_lists WHERE id = ?1", params![id])?
        };
        self.refresh()?;
        Ok(rows > 0)
    }

    // ==================== Rate Limit Operations ====================

    pub fn save_rate_limit(&self, rule: &RateLimitRule) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO rate_limits (id, body) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                params![rule.id, serde_json::to_string(rule)?],
            )?;
        }
        self.refresh()?;
        Ok(())
    }

    pub fn delete_rate_limit(&self, id: &str) -> Result<bool> {
        let rows = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM rate_limits WHERE id = ?1", params![id])?
        };
        self.refresh()?;
        Ok(rows > 0)
    }

    // ==================== ACME Account Operations ====================

    /// Serialized account credentials for `email`
    pub fn acme_account(&self, email: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT credentials FROM acme_accounts WHERE email = ?1",
            params![email.to_lowercase()],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get ACME account")
    }

    /// Persist account credentials; the first write for an email wins
    pub fn save_acme_account(&self, email: &str, credentials: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO acme_accounts (email, credentials) VALUES (?1, ?2)
             ON CONFLICT(email) DO NOTHING",
            params![email.to_lowercase(), credentials],
        )?;
        Ok(())
    }
}

fn load_bodies<T: serde::de::DeserializeOwned>(conn: &Connection, sql: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter()
        .map(|body| serde_json::from_str(body).context("Corrupt record"))
        .collect()
}
