// Keyfed — SQLite Database Management
//
// Opens the shared SQLite database that backs the partner registry, the
// lease table and the publishable key store. Several keyfed instances may
// open the same file; a busy timeout makes their writes queue instead of
// failing with SQLITE_BUSY.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

use super::StoreError;

/// How long a writer waits for another connection's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper around a SQLite connection.
///
/// The connection sits behind a mutex so a `Database` can be shared by the
/// tasks of one process via `Arc`; each process (or simulated instance in
/// tests) opens its own `Database`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        tracing::debug!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing only).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Lock and return the underlying connection.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Cheap round trip used by the liveness probe.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Run schema migrations to create or update tables.
    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS partners (
                name                TEXT PRIMARY KEY,
                export_root         TEXT NOT NULL,
                index_file          TEXT NOT NULL DEFAULT 'index.txt',
                credential_ref      TEXT,
                region              TEXT NOT NULL,
                cadence_secs        INTEGER NOT NULL CHECK (cadence_secs > 0),
                cursor              INTEGER NOT NULL DEFAULT 0 CHECK (cursor >= 0),
                last_success_ms     INTEGER,
                failure_count       INTEGER NOT NULL DEFAULT 0,
                enabled             INTEGER NOT NULL DEFAULT 1,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS partner_keys (
                partner             TEXT NOT NULL,
                key_id              TEXT NOT NULL,
                key_version         TEXT NOT NULL,
                public_key          TEXT NOT NULL,
                valid_from_ms       INTEGER NOT NULL,
                valid_until_ms      INTEGER,
                PRIMARY KEY (partner, key_id, key_version),
                FOREIGN KEY(partner) REFERENCES partners(name) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS leases (
                partner             TEXT PRIMARY KEY,
                holder              TEXT NOT NULL,
                expires_at_ms       INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS imported_keys (
                partner             TEXT NOT NULL,
                key_identity        TEXT NOT NULL,
                key_data            BLOB NOT NULL,
                rolling_start       INTEGER NOT NULL,
                rolling_period      INTEGER NOT NULL,
                transmission_risk   INTEGER NOT NULL,
                batch_position      INTEGER NOT NULL,
                region              TEXT NOT NULL,
                imported_at         TEXT NOT NULL,
                PRIMARY KEY (partner, key_identity)
            );

            CREATE TABLE IF NOT EXISTS imported_batches (
                partner             TEXT NOT NULL,
                position            INTEGER NOT NULL,
                digest              TEXT NOT NULL,
                key_count           INTEGER NOT NULL,
                inserted            INTEGER NOT NULL,
                duplicates          INTEGER NOT NULL,
                imported_at         TEXT NOT NULL,
                PRIMARY KEY (partner, position)
            );

            CREATE INDEX IF NOT EXISTS idx_imported_keys_batch
                ON imported_keys(partner, batch_position);
            ",
        )?;

        tracing::debug!("Database migrations completed successfully");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
