// Keyfed — Publishable Key Store
//
// `merge_batch` is the only multi-statement transaction in the crate: the
// key inserts, the cursor advance and the batch ledger row commit together
// or not at all. Duplicates are resolved by the (partner, key_identity)
// primary key with INSERT OR IGNORE, so re-merging a batch is harmless.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

use super::models::{BatchRecord, BatchToMerge, MergeReport};
use super::repository::{parse_rfc3339, SqliteStore};
use super::StoreError;

/// Upper bound on rows per multi-row INSERT; keeps the bound parameter
/// count (9 per row) well under SQLite's variable limit.
pub const MAX_ROWS_PER_INSERT: usize = 1000;

/// Write side of the publishable key store.
pub trait KeyStore {
    /// Atomically insert the batch's keys and advance the partner's cursor
    /// to `max(cursor, batch.position)`. `chunk_size` bounds rows per INSERT.
    fn merge_batch(&self, batch: &BatchToMerge, chunk_size: usize)
        -> Result<MergeReport, StoreError>;

    /// Number of imported keys held for a partner.
    fn count_keys(&self, partner: &str) -> Result<u64, StoreError>;

    /// Ledger of merged batches for a partner, oldest first.
    fn list_batches(&self, partner: &str) -> Result<Vec<BatchRecord>, StoreError>;
}

impl KeyStore for SqliteStore {
    fn merge_batch(
        &self,
        batch: &BatchToMerge,
        chunk_size: usize,
    ) -> Result<MergeReport, StoreError> {
        let chunk_size = chunk_size.clamp(1, MAX_ROWS_PER_INSERT);
        let position = i64::try_from(batch.position).map_err(|_| StoreError::Corrupt {
            table: "imported_batches",
            detail: format!("position {} out of range", batch.position),
        })?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let mut inserted = 0usize;
        for chunk in batch.keys.chunks(chunk_size) {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO imported_keys
                    (partner, key_identity, key_data, rolling_start, rolling_period,
                     transmission_risk, batch_position, region, imported_at)
                 VALUES {}",
                placeholders
            );

            let mut values = Vec::with_capacity(chunk.len() * 9);
            for key in chunk {
                values.push(Value::Text(batch.partner.clone()));
                values.push(Value::Text(key.identity()));
                values.push(Value::Blob(key.key_data.to_vec()));
                values.push(Value::Integer(i64::from(key.rolling_start)));
                values.push(Value::Integer(i64::from(key.rolling_period)));
                values.push(Value::Integer(i64::from(key.transmission_risk)));
                values.push(Value::Integer(position));
                values.push(Value::Text(batch.region.clone()));
                values.push(Value::Text(now.clone()));
            }

            inserted += tx.execute(&sql, params_from_iter(values.iter()))?;
        }

        let updated = tx.execute(
            "UPDATE partners SET cursor = MAX(cursor, ?2), updated_at = ?3 WHERE name = ?1",
            params![batch.partner, position, now],
        )?;
        if updated == 0 {
            // Dropping the transaction rolls back the inserts above.
            return Err(StoreError::PartnerNotFound(batch.partner.clone()));
        }

        let report = MergeReport {
            inserted,
            duplicates: batch.keys.len() - inserted,
        };

        tx.execute(
            "INSERT INTO imported_batches
                (partner, position, digest, key_count, inserted, duplicates, imported_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(partner, position) DO NOTHING",
            params![
                batch.partner,
                position,
                batch.digest,
                batch.keys.len() as i64,
                report.inserted as i64,
                report.duplicates as i64,
                now,
            ],
        )?;

        tx.commit()?;

        tracing::debug!(
            partner = %batch.partner,
            position = batch.position,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "Batch merge committed"
        );

        Ok(report)
    }

    fn count_keys(&self, partner: &str) -> Result<u64, StoreError> {
        let count: i64 = self.db.conn()?.query_row(
            "SELECT count(*) FROM imported_keys WHERE partner = ?1",
            params![partner],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn list_batches(&self, partner: &str) -> Result<Vec<BatchRecord>, StoreError> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT partner, position, digest, key_count, inserted, duplicates, imported_at
             FROM imported_batches WHERE partner = ?1 ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![partner], |row| {
            let position: i64 = row.get(1)?;
            let key_count: i64 = row.get(3)?;
            let inserted: i64 = row.get(4)?;
            let duplicates: i64 = row.get(5)?;
            let imported_at: String = row.get(6)?;
            Ok(BatchRecord {
                partner: row.get(0)?,
                position: position.max(0) as u64,
                digest: row.get(2)?,
                key_count: key_count.max(0) as usize,
                inserted: inserted.max(0) as usize,
                duplicates: duplicates.max(0) as usize,
                imported_at: parse_rfc3339(&imported_at),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::models::DiagnosisKey;
    use crate::store::repository::tests::new_partner;
    use crate::store::{Database, PartnerRegistry};

    pub(crate) fn key(seed: u8) -> DiagnosisKey {
        DiagnosisKey {
            key_data: [seed; 16],
            rolling_start: 2_700_000 + u32::from(seed),
            rolling_period: 144,
            transmission_risk: 4,
        }
    }

    fn batch(position: u64, seeds: std::ops::Range<u8>) -> BatchToMerge {
        BatchToMerge {
            partner: "de".to_string(),
            position,
            digest: format!("digest-{}", position),
            region: "DE".to_string(),
            keys: seeds.map(key).collect(),
        }
    }

    fn setup_store() -> SqliteStore {
        let store = SqliteStore::new(Arc::new(Database::open_in_memory().unwrap()));
        store.upsert_partner(&new_partner("de")).unwrap();
        store
    }

    fn cursor(store: &SqliteStore) -> u64 {
        store.get_partner("de").unwrap().unwrap().cursor
    }

    #[test]
    fn test_merge_inserts_and_advances_cursor() {
        let store = setup_store();
        let report = store.merge_batch(&batch(1, 0..10), 4).unwrap();

        assert_eq!(report, MergeReport { inserted: 10, duplicates: 0 });
        assert_eq!(store.count_keys("de").unwrap(), 10);
        assert_eq!(cursor(&store), 1);
    }

    #[test]
    fn test_remerge_is_idempotent() {
        let store = setup_store();
        store.merge_batch(&batch(1, 0..10), 100).unwrap();
        let second = store.merge_batch(&batch(1, 0..10), 100).unwrap();

        assert_eq!(second, MergeReport { inserted: 0, duplicates: 10 });
        assert_eq!(store.count_keys("de").unwrap(), 10);
        assert_eq!(cursor(&store), 1);
        assert_eq!(store.list_batches("de").unwrap().len(), 1);
    }

    #[test]
    fn test_overlapping_batches_count_duplicates() {
        let store = setup_store();
        store.merge_batch(&batch(1, 0..6), 100).unwrap();
        let report = store.merge_batch(&batch(2, 4..10), 100).unwrap();

        assert_eq!(report, MergeReport { inserted: 4, duplicates: 2 });
        assert_eq!(store.count_keys("de").unwrap(), 10);
        assert_eq!(cursor(&store), 2);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let store = setup_store();
        store.merge_batch(&batch(5, 0..2), 100).unwrap();
        store.merge_batch(&batch(3, 2..4), 100).unwrap();
        assert_eq!(cursor(&store), 5);
    }

    #[test]
    fn test_failure_mid_batch_rolls_back_everything() {
        let store = setup_store();
        // Abort when the 7th key of the batch is inserted.
        store
            .database()
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER crash_mid_merge BEFORE INSERT ON imported_keys
                 WHEN NEW.rolling_start = 2700006
                 BEGIN SELECT RAISE(ABORT, 'simulated crash'); END;",
            )
            .unwrap();

        let result = store.merge_batch(&batch(1, 0..10), 3);
        assert!(result.is_err());
        assert_eq!(store.count_keys("de").unwrap(), 0, "no partial keys survive");
        assert_eq!(cursor(&store), 0, "cursor must not advance");
        assert!(store.list_batches("de").unwrap().is_empty());

        store
            .database()
            .conn()
            .unwrap()
            .execute_batch("DROP TRIGGER crash_mid_merge;")
            .unwrap();

        let report = store.merge_batch(&batch(1, 0..10), 3).unwrap();
        assert_eq!(report, MergeReport { inserted: 10, duplicates: 0 });
        assert_eq!(cursor(&store), 1);
    }

    #[test]
    fn test_merge_for_unknown_partner_rolls_back() {
        let store = setup_store();
        let mut b = batch(1, 0..3);
        b.partner = "ghost".to_string();

        assert!(matches!(
            store.merge_batch(&b, 100),
            Err(StoreError::PartnerNotFound(_))
        ));
        assert_eq!(store.count_keys("ghost").unwrap(), 0);
    }

    #[test]
    fn test_same_key_from_different_partners_is_not_a_duplicate() {
        let store = setup_store();
        store.upsert_partner(&new_partner("nl")).unwrap();
        store.merge_batch(&batch(1, 0..3), 100).unwrap();

        let mut other = batch(1, 0..3);
        other.partner = "nl".to_string();
        let report = store.merge_batch(&other, 100).unwrap();
        assert_eq!(report.inserted, 3);
    }

    #[test]
    fn test_batch_ledger_records_counts() {
        let store = setup_store();
        store.merge_batch(&batch(1, 0..4), 100).unwrap();
        store.merge_batch(&batch(2, 2..8), 100).unwrap();

        let ledger = store.list_batches("de").unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].position, 2);
        assert_eq!(ledger[1].key_count, 6);
        assert_eq!(ledger[1].inserted, 4);
        assert_eq!(ledger[1].duplicates, 2);
        assert_eq!(ledger[1].digest, "digest-2");
    }

    #[test]
    fn test_empty_batch_still_advances_cursor() {
        let store = setup_store();
        let report = store.merge_batch(&batch(1, 0..0), 100).unwrap();
        assert_eq!(report, MergeReport::default());
        assert_eq!(cursor(&store), 1);
    }
}
