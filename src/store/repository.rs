// Keyfed — Partner Registry Repository
//
// CRUD over the partners and partner_keys tables plus the bookkeeping the
// scheduler performs after each cycle (success time, failure streak,
// enable flag). The cursor is absent from this trait: it only
// moves inside the merge transaction (see `KeyStore::merge_batch`).

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use super::db::Database;
use super::models::{NewPartner, Partner, PartnerKey};
use super::StoreError;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the durable partner registry.
pub trait PartnerRegistry {
    /// All partners, enabled or not, ordered by name.
    fn list_partners(&self) -> Result<Vec<Partner>, StoreError>;

    /// A single partner with its trusted keys.
    fn get_partner(&self, name: &str) -> Result<Option<Partner>, StoreError>;

    /// Create a partner or update its configuration. Cursor, success time
    /// and failure streak of an existing partner are preserved.
    fn upsert_partner(&self, partner: &NewPartner) -> Result<(), StoreError>;

    /// Remove a partner and its keys. Returns true if it existed.
    fn remove_partner(&self, name: &str) -> Result<bool, StoreError>;

    /// Register (or replace) a trusted signing key for a partner.
    fn add_partner_key(&self, partner: &str, key: &PartnerKey) -> Result<(), StoreError>;

    /// Enable or disable a partner. Enabling also clears the failure streak.
    fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError>;

    /// Stamp a successful cycle.
    fn record_success(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Increment the failure streak and return its new value.
    fn record_failure(&self, name: &str) -> Result<u32, StoreError>;

    /// Clear the failure streak.
    fn reset_failures(&self, name: &str) -> Result<(), StoreError>;
}

// ─── SQLite Implementation ──────────────────────────────────────────────────

/// SQLite-backed implementation of every store trait in this module.
#[derive(Clone)]
pub struct SqliteStore {
    pub(super) db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Parse a partner row (without keys) from the database.
    fn row_to_partner(row: &rusqlite::Row<'_>) -> rusqlite::Result<Partner> {
        let cadence_secs: i64 = row.get(5)?;
        let cursor: i64 = row.get(6)?;
        let last_success_ms: Option<i64> = row.get(7)?;
        let failure_count: i64 = row.get(8)?;
        let enabled: bool = row.get(9)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;

        Ok(Partner {
            name: row.get(0)?,
            export_root: row.get(1)?,
            index_file: row.get(2)?,
            credential_ref: row.get(3)?,
            region: row.get(4)?,
            cadence: Duration::seconds(cadence_secs),
            cursor: cursor.max(0) as u64,
            last_success_at: last_success_ms.map(from_millis),
            failure_count: failure_count.clamp(0, u32::MAX as i64) as u32,
            enabled,
            keys: Vec::new(),
            created_at: parse_rfc3339(&created_at),
            updated_at: parse_rfc3339(&updated_at),
        })
    }

    fn keys_for(
        conn: &rusqlite::Connection,
        partner: &str,
    ) -> Result<Vec<PartnerKey>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT key_id, key_version, public_key, valid_from_ms, valid_until_ms
             FROM partner_keys WHERE partner = ?1
             ORDER BY valid_from_ms ASC",
        )?;

        let rows = stmt.query_map(params![partner], |row| {
            let valid_from_ms: i64 = row.get(3)?;
            let valid_until_ms: Option<i64> = row.get(4)?;
            Ok(PartnerKey {
                key_id: row.get(0)?,
                key_version: row.get(1)?,
                public_key: row.get(2)?,
                valid_from: from_millis(valid_from_ms),
                valid_until: valid_until_ms.map(from_millis),
            })
        })?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

const PARTNER_COLUMNS: &str = "name, export_root, index_file, credential_ref, region,
     cadence_secs, cursor, last_success_ms, failure_count, enabled,
     created_at, updated_at";

impl PartnerRegistry for SqliteStore {
    fn list_partners(&self) -> Result<Vec<Partner>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM partners ORDER BY name ASC",
            PARTNER_COLUMNS
        ))?;

        let rows = stmt.query_map([], Self::row_to_partner)?;

        let mut partners = Vec::new();
        for row in rows {
            let mut partner = row?;
            partner.keys = Self::keys_for(&conn, &partner.name)?;
            partners.push(partner);
        }

        Ok(partners)
    }

    fn get_partner(&self, name: &str) -> Result<Option<Partner>, StoreError> {
        let conn = self.db.conn()?;
        let partner = conn
            .query_row(
                &format!("SELECT {} FROM partners WHERE name = ?1", PARTNER_COLUMNS),
                params![name],
                Self::row_to_partner,
            )
            .optional()?;

        match partner {
            Some(mut p) => {
                p.keys = Self::keys_for(&conn, &p.name)?;
                Ok(Some(p))
            }
            None => Ok(None),
        }
    }

    fn upsert_partner(&self, partner: &NewPartner) -> Result<(), StoreError> {
        partner.validate()?;
        let now = Utc::now().to_rfc3339();

        self.db.conn()?.execute(
            "INSERT INTO partners
                (name, export_root, index_file, credential_ref, region,
                 cadence_secs, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(name) DO UPDATE SET
                export_root = excluded.export_root,
                index_file = excluded.index_file,
                credential_ref = excluded.credential_ref,
                region = excluded.region,
                cadence_secs = excluded.cadence_secs,
                updated_at = excluded.updated_at",
            params![
                partner.name,
                partner.export_root,
                partner.index_file,
                partner.credential_ref,
                partner.region,
                partner.cadence.num_seconds(),
                now,
            ],
        )?;

        tracing::info!(
            partner = %partner.name,
            export_root = %partner.export_root,
            cadence_secs = partner.cadence.num_seconds(),
            "Partner configuration stored"
        );
        Ok(())
    }

    fn remove_partner(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.db.conn()?;
        let affected = conn.execute("DELETE FROM partners WHERE name = ?1", params![name])?;
        conn.execute("DELETE FROM leases WHERE partner = ?1", params![name])?;

        if affected > 0 {
            tracing::info!(partner = %name, "Partner removed");
        }
        Ok(affected > 0)
    }

    fn add_partner_key(&self, partner: &str, key: &PartnerKey) -> Result<(), StoreError> {
        if let Some(until) = key.valid_until {
            if until <= key.valid_from {
                return Err(StoreError::InvalidPartner(format!(
                    "key {}/{} expires before it becomes valid",
                    key.key_id, key.key_version
                )));
            }
        }

        let conn = self.db.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM partners WHERE name = ?1",
                params![partner],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::PartnerNotFound(partner.to_string()));
        }

        conn.execute(
            "INSERT OR REPLACE INTO partner_keys
                (partner, key_id, key_version, public_key, valid_from_ms, valid_until_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                partner,
                key.key_id,
                key.key_version,
                key.public_key,
                to_millis(key.valid_from),
                key.valid_until.map(to_millis),
            ],
        )?;

        tracing::info!(
            partner = %partner,
            key_id = %key.key_id,
            key_version = %key.key_version,
            "Trusted partner key registered"
        );
        Ok(())
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError> {
        let affected = self.db.conn()?.execute(
            "UPDATE partners
             SET enabled = ?2,
                 failure_count = CASE WHEN ?2 THEN 0 ELSE failure_count END,
                 updated_at = ?3
             WHERE name = ?1",
            params![name, enabled, Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    fn record_success(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let affected = self.db.conn()?.execute(
            "UPDATE partners SET last_success_ms = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, to_millis(at), Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::PartnerNotFound(name.to_string()));
        }
        Ok(())
    }

    fn record_failure(&self, name: &str) -> Result<u32, StoreError> {
        let count: Option<i64> = self
            .db
            .conn()?
            .query_row(
                "UPDATE partners SET failure_count = failure_count + 1
                 WHERE name = ?1
                 RETURNING failure_count",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match count {
            Some(c) => Ok(c.clamp(0, u32::MAX as i64) as u32),
            None => Err(StoreError::PartnerNotFound(name.to_string())),
        }
    }

    fn reset_failures(&self, name: &str) -> Result<(), StoreError> {
        self.db.conn()?.execute(
            "UPDATE partners SET failure_count = 0 WHERE name = ?1 AND failure_count <> 0",
            params![name],
        )?;
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(super) fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
