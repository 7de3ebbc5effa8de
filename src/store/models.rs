// Keyfed — Federation data models
//
// Partners and their trusted signing keys are configuration; leases are
// coordination state; diagnosis keys and batch records are the merged
// output that the local export pipeline later publishes.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Length of a temporary exposure key.
pub const KEY_DATA_LEN: usize = 16;

/// A configured federation partner, as stored in the registry.
#[derive(Debug, Clone)]
pub struct Partner {
    pub name: String,
    /// Base URL that the index file and batch paths are resolved against.
    pub export_root: String,
    pub index_file: String,
    /// Name of the environment variable holding the bearer token, if any.
    /// The token itself is never persisted.
    pub credential_ref: Option<String>,
    /// Region label stamped onto every key imported from this partner.
    pub region: String,
    /// Minimum interval between two successful imports.
    pub cadence: Duration,
    /// Position of the last fully merged batch (0 = nothing merged yet).
    pub cursor: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Consecutive rejected or gapped cycles since the last clean import.
    pub failure_count: u32,
    pub enabled: bool,
    pub keys: Vec<PartnerKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Partner {
    /// Whether the configured cadence has elapsed since the last success.
    /// A partner that never succeeded is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_success_at {
            Some(last) => now - last >= self.cadence,
            None => true,
        }
    }

    /// Find the trusted key a batch declares it was signed with,
    /// provided that key is inside its validity window at `now`.
    pub fn trusted_key(
        &self,
        key_id: &str,
        key_version: &str,
        now: DateTime<Utc>,
    ) -> Option<&PartnerKey> {
        self.keys.iter().find(|k| {
            k.key_id == key_id && k.key_version == key_version && k.is_valid_at(now)
        })
    }
}

impl fmt::Display for Partner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) cursor={} every {}s{}",
            self.name,
            self.export_root,
            self.cursor,
            self.cadence.num_seconds(),
            if self.enabled { "" } else { " [disabled]" }
        )
    }
}

/// Input for creating or updating a partner.
#[derive(Debug, Clone)]
pub struct NewPartner {
    pub name: String,
    pub export_root: String,
    pub index_file: String,
    pub credential_ref: Option<String>,
    pub region: String,
    pub cadence: Duration,
}

impl NewPartner {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidPartner("name must not be empty".into()));
        }
        // Stored in whole seconds.
        if self.cadence.num_seconds() <= 0 {
            return Err(StoreError::InvalidPartner(format!(
                "cadence must be at least one second for partner {}",
                self.name
            )));
        }
        reqwest::Url::parse(&self.export_root).map_err(|e| {
            StoreError::InvalidPartner(format!("invalid export root {}: {}", self.export_root, e))
        })?;
        if self.index_file.trim().is_empty() {
            return Err(StoreError::InvalidPartner("index file must not be empty".into()));
        }
        Ok(())
    }
}

/// A public key a partner signs its batches with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerKey {
    pub key_id: String,
    pub key_version: String,
    /// Base64-encoded 32-byte Ed25519 public key.
    pub public_key: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PartnerKey {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && self.valid_until.map_or(true, |until| now < until)
    }
}

/// A time-bounded exclusive claim on processing one partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub partner: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease at or past its expiry is treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One temporary exposure key as carried in a partner batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisKey {
    pub key_data: [u8; KEY_DATA_LEN],
    /// ENIntervalNumber at which the key became valid.
    pub rolling_start: u32,
    /// Number of 10-minute intervals the key was valid for.
    pub rolling_period: u32,
    pub transmission_risk: u8,
}

impl DiagnosisKey {
    /// Identity used for deduplication across imports.
    pub fn identity(&self) -> String {
        BASE64.encode(self.key_data)
    }
}

/// A validated batch ready to be merged.
#[derive(Debug, Clone)]
pub struct BatchToMerge {
    pub partner: String,
    pub position: u64,
    /// Hex SHA-256 of the batch file as downloaded.
    pub digest: String,
    pub region: String,
    pub keys: Vec<DiagnosisKey>,
}

/// Outcome of merging one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Ledger row written for each merged batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub partner: String,
    pub position: u64,
    pub digest: String,
    pub key_count: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub imported_at: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn partner(last_success_at: Option<DateTime<Utc>>) -> Partner {
        Partner {
            name: "partner-a".to_string(),
            export_root: "https://exports.example.org/".to_string(),
            index_file: "index.txt".to_string(),
            credential_ref: None,
            region: "DE".to_string(),
            cadence: Duration::hours(1),
            cursor: 0,
            last_success_at,
            failure_count: 0,
            enabled: true,
            keys: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_partner_due_after_cadence() {
        let now = Utc::now();
        assert!(partner(Some(now - Duration::minutes(90))).is_due(now));
        assert!(!partner(Some(now - Duration::minutes(10))).is_due(now));
        assert!(partner(None).is_due(now), "never-imported partner is due");
    }

    #[test]
    fn test_partner_due_exactly_at_cadence() {
        let now = Utc::now();
        assert!(partner(Some(now - Duration::hours(1))).is_due(now));
    }

    #[test]
    fn test_trusted_key_respects_validity_window() {
        let now = Utc::now();
        let mut p = partner(None);
        p.keys = vec![
            PartnerKey {
                key_id: "310".to_string(),
                key_version: "v1".to_string(),
                public_key: "AAAA".to_string(),
                valid_from: now - Duration::days(30),
                valid_until: Some(now - Duration::days(1)),
            },
            PartnerKey {
                key_id: "310".to_string(),
                key_version: "v2".to_string(),
                public_key: "BBBB".to_string(),
                valid_from: now - Duration::days(1),
                valid_until: None,
            },
        ];

        assert!(p.trusted_key("310", "v1", now).is_none(), "retired key");
        assert_eq!(p.trusted_key("310", "v2", now).unwrap().public_key, "BBBB");
        assert!(p.trusted_key("311", "v2", now).is_none(), "unknown id");
    }

    #[test]
    fn test_new_partner_validation() {
        let ok = NewPartner {
            name: "nl".to_string(),
            export_root: "https://nl.example.org/exports/".to_string(),
            index_file: "index.txt".to_string(),
            credential_ref: None,
            region: "NL".to_string(),
            cadence: Duration::minutes(15),
        };
        assert!(ok.validate().is_ok());

        let mut zero = ok.clone();
        zero.cadence = Duration::zero();
        assert!(zero.validate().is_err());

        let mut sub_second = ok.clone();
        sub_second.cadence = Duration::milliseconds(999);
        assert!(sub_second.validate().is_err());

        let mut bad_url = ok.clone();
        bad_url.export_root = "not a url".to_string();
        assert!(bad_url.validate().is_err());

        let mut no_name = ok;
        no_name.name = "  ".to_string();
        assert!(no_name.validate().is_err());
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let now = Utc::now();
        let lease = Lease {
            partner: "p".to_string(),
            holder: "h".to_string(),
            expires_at: now,
        };
        assert!(lease.is_expired(now));
        assert!(!lease.is_expired(now - Duration::milliseconds(1)));
    }

    #[test]
    fn test_key_identity_is_base64_of_key_data() {
        let key = DiagnosisKey {
            key_data: [0u8; KEY_DATA_LEN],
            rolling_start: 2_650_000,
            rolling_period: 144,
            transmission_risk: 3,
        };
        assert_eq!(key.identity(), "AAAAAAAAAAAAAAAAAAAAAA==");
    }
}
