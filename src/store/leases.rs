// Keyfed — Lease Table
//
// Every mutation here is one conditional statement, so two instances
// racing on the same partner are serialized by SQLite's write lock and
// exactly one of them observes a changed row.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::models::Lease;
use super::repository::{from_millis, to_millis, SqliteStore};
use super::StoreError;

/// Durable, atomically updated lease rows.
pub trait LeaseStore {
    /// Insert or take over the partner's lease if none exists or the
    /// existing one expired at or before `now`. Returns true if acquired.
    fn try_acquire(
        &self,
        partner: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move the expiry of a lease the caller still holds unexpired.
    fn renew(
        &self,
        partner: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete the caller's lease. Returns true if it was still held.
    fn release(&self, partner: &str, holder: &str) -> Result<bool, StoreError>;

    /// Current lease row, expired or not.
    fn get_lease(&self, partner: &str) -> Result<Option<Lease>, StoreError>;
}

impl LeaseStore for SqliteStore {
    fn try_acquire(
        &self,
        partner: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let affected = self.db.conn()?.execute(
            "INSERT INTO leases (partner, holder, expires_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(partner) DO UPDATE SET
                holder = excluded.holder,
                expires_at_ms = excluded.expires_at_ms
             WHERE leases.expires_at_ms <= ?4",
            params![partner, holder, to_millis(expires_at), to_millis(now)],
        )?;
        Ok(affected == 1)
    }

    fn renew(
        &self,
        partner: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let affected = self.db.conn()?.execute(
            "UPDATE leases SET expires_at_ms = ?3
             WHERE partner = ?1 AND holder = ?2 AND expires_at_ms > ?4",
            params![partner, holder, to_millis(expires_at), to_millis(now)],
        )?;
        Ok(affected == 1)
    }

    fn release(&self, partner: &str, holder: &str) -> Result<bool, StoreError> {
        let affected = self.db.conn()?.execute(
            "DELETE FROM leases WHERE partner = ?1 AND holder = ?2",
            params![partner, holder],
        )?;
        Ok(affected == 1)
    }

    fn get_lease(&self, partner: &str) -> Result<Option<Lease>, StoreError> {
        let lease = self
            .db
            .conn()?
            .query_row(
                "SELECT partner, holder, expires_at_ms FROM leases WHERE partner = ?1",
                params![partner],
                |row| {
                    let expires_at_ms: i64 = row.get(2)?;
                    Ok(Lease {
                        partner: row.get(0)?,
                        holder: row.get(1)?,
                        expires_at: from_millis(expires_at_ms),
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
