//! SQLite-backed recovery storage (`<recovery dir>/recovery.db`).

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{ProcessRegistration, RecoveryStorage};
use crate::{AtelierError, Result};

pub struct SqliteRecoveryStorage {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteRecoveryStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let db_path = dir.as_ref().join("recovery.db");
        let conn = Connection::open(&db_path)?;

        let store = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<()> {
        self.lock().execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS registrations (
              group_id TEXT PRIMARY KEY,
              host TEXT NOT NULL,
              port INTEGER NOT NULL,
              last_busy_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecoveryStorage for SqliteRecoveryStorage {
    fn on_client_start(&self, registration: &ProcessRegistration) -> Result<()> {
        self.lock().execute(
            r#"
            INSERT INTO registrations (group_id, host, port, last_busy_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(group_id) DO UPDATE SET
              host = excluded.host,
              port = excluded.port,
              last_busy_at = excluded.last_busy_at
            "#,
            params![
                registration.group_id,
                registration.host,
                registration.port,
                registration.last_busy_at.to_rfc3339(),
            ],
        )?;
        tracing::debug!("Recorded {} at {}", registration.group_id, registration.endpoint());
        Ok(())
    }

    fn on_client_stop(&self, group_id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM registrations WHERE group_id = ?1", [group_id])?;
        Ok(())
    }

    fn touch(&self, group_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            "UPDATE registrations SET last_busy_at = ?1 WHERE group_id = ?2",
            params![at.to_rfc3339(), group_id],
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ProcessRegistration>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT group_id, host, port, last_busy_at
            FROM registrations
            ORDER BY group_id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let port: i64 = row.get(2)?;
            let last_busy_at: String = row.get(3)?;
            Ok(ProcessRegistration {
                group_id: row.get(0)?,
                host: row.get(1)?,
                port: u16::try_from(port)
                    .map_err(|_| to_sql_err(AtelierError::Recovery(format!("invalid port {}", port))))?,
                last_busy_at: parse_rfc3339(&last_busy_at).map_err(to_sql_err)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(registration) => out.push(registration),
                Err(e) => tracing::warn!("Skipping malformed registration: {}", e),
            }
        }
        Ok(out)
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AtelierError::Recovery(format!("invalid timestamp '{}': {}", value, e)))
}

fn to_sql_err(err: AtelierError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}
