use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use shared::types::{PersistedHost, PersistedService, ScanRecord};
use crate::store::merge::{self, MergePolicy};

const HOST_COLUMNS: &str = "id, workspace_id, address, mac, name, state, os_name, purpose, created_at, updated_at";
const SERVICE_COLUMNS: &str = "id, host_id, port, proto, state, name, info, created_at, updated_at";

/// SQLite-backed host/service store.
pub struct ScanDb {
    conn: Connection,
    path: PathBuf,
}

impl ScanDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to configure database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS hosts (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
                address      TEXT NOT NULL,
                mac          TEXT,
                name         TEXT,
                state        TEXT NOT NULL,
                os_name      TEXT NOT NULL,
                purpose      TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                UNIQUE (workspace_id, address)
            );

            CREATE TABLE IF NOT EXISTS services (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id    INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                port       INTEGER NOT NULL,
                proto      TEXT NOT NULL,
                state      TEXT NOT NULL,
                name       TEXT,
                info       TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (host_id, proto, port)
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lightweight liveness check
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Database ping failed")?;
        Ok(())
    }

    /// Close the connection, surfacing any error from finalisation
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context("Failed to close database")
    }

    /// Look up a workspace by name, creating it when absent
    pub fn workspace_id(&self, name: &str) -> Result<i64> {
        let existing = self
            .conn
            .query_row("SELECT id FROM workspaces WHERE name = ?1", params![name], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to query workspace {name:?}"))?;

        if let Some(id) = existing {
            return Ok(id);
        }

        self.conn
            .execute("INSERT INTO workspaces (name) VALUES (?1)", params![name])
            .with_context(|| format!("Failed to create workspace {name:?}"))?;
        tracing::info!(workspace = name, "Created workspace");
        Ok(self.conn.last_insert_rowid())
    }

    /// Reconcile one decoded host into the store.
    ///
    /// Returns the number of open services written. Hosts without open
    /// services are skipped without touching any row. The host row and all
    /// of its service rows are written in one transaction.
    pub fn upsert_host(&mut self, workspace_id: i64, record: &ScanRecord, policy: MergePolicy) -> Result<usize> {
        if !record.has_open_services() {
            tracing::debug!(host = %record, "Host does not have any open ports, skipping");
            return Ok(0);
        }

        let address = record
            .preferred_address()
            .ok_or_else(|| anyhow!("host {record} has no IPv4/IPv6 address"))?
            .to_string();

        let now = Utc::now();

        // IMMEDIATE takes the write lock up front, serialising concurrent upserts of the same host
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let existing = find_host(&tx, workspace_id, &address)
            .with_context(|| format!("Failed to query host {address}"))?;

        if existing.is_none() {
            tracing::debug!(host = %address, "Host not found in database");
        }

        let fields = merge::merge_host(existing.as_ref(), record, policy, now);

        let host_id: i64 = tx
            .query_row(
                r#"
                INSERT INTO hosts (
                    workspace_id, address, mac, name, state, os_name, purpose,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(workspace_id, address) DO UPDATE SET
                    mac = excluded.mac,
                    name = excluded.name,
                    state = excluded.state,
                    os_name = excluded.os_name,
                    purpose = excluded.purpose,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at
                RETURNING id
                "#,
                params![
                    workspace_id,
                    &address,
                    &fields.mac,
                    &fields.name,
                    &fields.state,
                    &fields.os_name,
                    &fields.purpose,
                    fields.created_at.to_rfc3339(),
                    fields.updated_at.to_rfc3339(),
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to upsert host {record}"))?;

        tracing::debug!(host = %record, host_id, "Inserted/updated host");

        let mut open = 0;
        for service in record.open_services() {
            let state = service.state.as_deref().unwrap_or_default();
            tx.execute(
                r#"
                INSERT INTO services (
                    host_id, port, proto, state, name, info, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(host_id, proto, port) DO UPDATE SET
                    state = excluded.state,
                    name = excluded.name,
                    info = excluded.info,
                    updated_at = excluded.updated_at
                "#,
                params![
                    host_id,
                    service.port,
                    &service.protocol,
                    state,
                    service.name_with_tunnel(),
                    service.info(),
                    now.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to upsert service {service} for host {record}"))?;

            tracing::debug!(host = %record, service = %service, "Inserted/updated service");
            open += 1;
        }

        tx.commit().context("Failed to commit transaction")?;
        Ok(open)
    }

    /// Get a single host by its identity
    pub fn get_host(&self, workspace_id: i64, address: &str) -> Result<Option<PersistedHost>> {
        find_host(&self.conn, workspace_id, address).context("Failed to query host")
    }

    /// Get all services of a host, ordered by protocol and port
    pub fn services_for_host(&self, host_id: i64) -> Result<Vec<PersistedService>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SERVICE_COLUMNS} FROM services WHERE host_id = ?1 ORDER BY proto, port"
            ))
            .context("Failed to prepare query")?;

        let services = stmt
            .query_map(params![host_id], row_to_service)
            .context("Failed to query services")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect services")?;

        Ok(services)
    }

    pub fn host_count(&self, workspace_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM hosts WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
            .context("Failed to count hosts")
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn find_host(conn: &Connection, workspace_id: i64, address: &str) -> rusqlite::Result<Option<PersistedHost>> {
    conn.query_row(
        &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE workspace_id = ?1 AND address = ?2"),
        params![workspace_id, address],
        row_to_host,
    )
    .optional()
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    chrono::DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_host(row: &rusqlite::Row) -> Result<PersistedHost, rusqlite::Error> {
    Ok(PersistedHost {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        address: row.get(2)?,
        mac: row.get(3)?,
        name: row.get(4)?,
        state: row.get(5)?,
        os_name: row.get(6)?,
        purpose: row.get(7)?,
        created_at: parse_timestamp(row, 8)?,
        updated_at: parse_timestamp(row, 9)?,
    })
}

fn row_to_service(row: &rusqlite::Row) -> Result<PersistedService, rusqlite::Error> {
    Ok(PersistedService {
        id: row.get(0)?,
        host_id: row.get(1)?,
        port: row.get(2)?,
        proto: row.get(3)?,
        state: row.get(4)?,
        name: row.get(5)?,
        info: row.get(6)?,
        created_at: parse_timestamp(row, 7)?,
        updated_at: parse_timestamp(row, 8)?,
    })
}
