// Keyfed — Batch Validator
//
// Trust boundary for partner data. The envelope is parsed just far enough
// to find the signer; the payload is only interpreted after its Ed25519
// signature has been checked against a key registered for the partner.

use std::collections::HashSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::store::{DiagnosisKey, Partner};

use super::error::RejectReason;
use super::fetch::RawBatch;
use super::format::{ExportPayload, SignedEnvelope};

/// Longest validity of a single key, in 10-minute intervals (one day).
pub const MAX_ROLLING_PERIOD: u32 = 144;

/// Highest transmission risk level a key may carry.
pub const MAX_TRANSMISSION_RISK: u8 = 8;

/// Positions the partner advanced past without us seeing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    pub expected: u64,
    pub received: u64,
}

impl SequenceGap {
    pub fn skipped(&self) -> u64 {
        self.received - self.expected
    }
}

/// A batch that passed every check.
#[derive(Debug, Clone)]
pub struct VerifiedBatch {
    pub position: u64,
    pub keys: Vec<DiagnosisKey>,
    /// Hex SHA-256 of the downloaded file.
    pub digest: String,
    pub gap: Option<SequenceGap>,
}

pub struct Validator {
    clock: Arc<dyn Clock>,
}

impl Validator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Check `raw` for `partner`, whose last merged position is `cursor`.
    pub fn validate(
        &self,
        raw: &RawBatch,
        partner: &Partner,
        cursor: u64,
    ) -> Result<VerifiedBatch, RejectReason> {
        let envelope = SignedEnvelope::decode(raw.bytes.clone())?;
        self.verify_signature(&envelope, partner)?;

        let payload = ExportPayload::decode(&envelope.payload)?;
        if payload.position != raw.position {
            return Err(RejectReason::PositionMismatch {
                declared: payload.position,
                listed: raw.position,
            });
        }

        let expected = cursor + 1;
        let gap = match payload.position {
            p if p < expected => {
                return Err(RejectReason::Stale {
                    position: p,
                    cursor,
                })
            }
            p if p == expected => None,
            p => Some(SequenceGap {
                expected,
                received: p,
            }),
        };

        check_keys(&payload.keys)?;

        Ok(VerifiedBatch {
            position: payload.position,
            keys: payload.keys,
            digest: hex_digest(&raw.bytes),
            gap,
        })
    }

    fn verify_signature(
        &self,
        envelope: &SignedEnvelope,
        partner: &Partner,
    ) -> Result<(), RejectReason> {
        let trusted = partner
            .trusted_key(&envelope.key_id, &envelope.key_version, self.clock.now())
            .ok_or_else(|| RejectReason::UntrustedSigner {
                key_id: envelope.key_id.clone(),
                key_version: envelope.key_version.clone(),
            })?;

        let bad_key = || RejectReason::BadTrustedKey {
            key_id: trusted.key_id.clone(),
            key_version: trusted.key_version.clone(),
        };
        let key_bytes: [u8; 32] = BASE64
            .decode(trusted.public_key.trim())
            .map_err(|_| bad_key())?
            .try_into()
            .map_err(|_| bad_key())?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| bad_key())?;

        let signature = Signature::from_bytes(&envelope.signature);
        verifying_key
            .verify(&envelope.payload, &signature)
            .map_err(|_| RejectReason::BadSignature)
    }
}

fn check_keys(keys: &[DiagnosisKey]) -> Result<(), RejectReason> {
    let mut seen = HashSet::with_capacity(keys.len());
    for (index, key) in keys.iter().enumerate() {
        if key.rolling_period == 0 || key.rolling_period > MAX_ROLLING_PERIOD {
            return Err(RejectReason::InvalidKey {
                index,
                reason: format!("rolling period {} outside 1..={}", key.rolling_period, MAX_ROLLING_PERIOD),
            });
        }
        if key.transmission_risk > MAX_TRANSMISSION_RISK {
            return Err(RejectReason::InvalidKey {
                index,
                reason: format!("transmission risk {} above {}", key.transmission_risk, MAX_TRANSMISSION_RISK),
            });
        }
        if !seen.insert(key.key_data) {
            return Err(RejectReason::DuplicateKey { index });
        }
    }
    Ok(())
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ─── Test fixtures ───────────────────────────────────────────────────────────

/// Signing helpers shared by the federation tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use bytes::Bytes;
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;
    use crate::federation::format::SIGNATURE_LEN;
    use crate::store::PartnerKey;

    pub(crate) const KEY_ID: &str = "310";
    pub(crate) const KEY_VERSION: &str = "v1";

    pub(crate) fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    pub(crate) fn partner_key(signer: &SigningKey) -> PartnerKey {
        PartnerKey {
            key_id: KEY_ID.to_string(),
            key_version: KEY_VERSION.to_string(),
            public_key: BASE64.encode(signer.verifying_key().as_bytes()),
            valid_from: chrono::Utc::now() - chrono::Duration::days(365),
            valid_until: None,
        }
    }

    /// Encode and sign a batch file the way a partner would publish it.
    pub(crate) fn signed_batch(signer: &SigningKey, position: u64, keys: Vec<DiagnosisKey>) -> Bytes {
        let payload = ExportPayload { position, keys }.encode();
        let signature: [u8; SIGNATURE_LEN] = signer.sign(&payload).to_bytes();
        SignedEnvelope {
            key_id: KEY_ID.to_string(),
            key_version: KEY_VERSION.to_string(),
            signature,
            payload,
        }
        .encode()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
