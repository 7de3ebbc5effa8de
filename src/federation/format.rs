// Keyfed — Export Batch Format
//
// A batch file is a signed envelope around an export payload:
//
//   envelope: "EKSG" | u8 len | key id | u8 len | key version | sig[64] | payload
//   payload:  "EK Export v1    " | u64 position | u32 count | count × key
//   key:      key_data[16] | u32 rolling start | u32 rolling period | u8 risk
//
// All integers are big-endian. Decoding checks structure only; signature
// and semantic checks live in the validator.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::store::{DiagnosisKey, KEY_DATA_LEN};

use super::error::FormatError;

pub const ENVELOPE_MAGIC: &[u8; 4] = b"EKSG";
pub const PAYLOAD_MAGIC: &[u8; 16] = b"EK Export v1    ";
pub const SIGNATURE_LEN: usize = 64;

const KEY_RECORD_LEN: usize = KEY_DATA_LEN + 4 + 4 + 1;
const PAYLOAD_HEADER_LEN: usize = PAYLOAD_MAGIC.len() + 8 + 4;

/// The outer, signed layer of a batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub key_id: String,
    pub key_version: String,
    pub signature: [u8; SIGNATURE_LEN],
    /// Exactly the bytes the signature covers.
    pub payload: Bytes,
}

impl SignedEnvelope {
    pub fn decode(mut buf: Bytes) -> Result<Self, FormatError> {
        expect_magic(&mut buf, ENVELOPE_MAGIC, "envelope")?;
        let key_id = read_short_string(&mut buf, "key id")?;
        let key_version = read_short_string(&mut buf, "key version")?;

        ensure(&buf, SIGNATURE_LEN, "signature")?;
        let mut signature = [0u8; SIGNATURE_LEN];
        buf.copy_to_slice(&mut signature);

        Ok(Self {
            key_id,
            key_version,
            signature,
            payload: buf,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(
            ENVELOPE_MAGIC.len() + 2 + self.key_id.len() + self.key_version.len()
                + SIGNATURE_LEN
                + self.payload.len(),
        );
        out.put_slice(ENVELOPE_MAGIC);
        put_short_string(&mut out, &self.key_id);
        put_short_string(&mut out, &self.key_version);
        out.put_slice(&self.signature);
        out.put_slice(&self.payload);
        out.freeze()
    }
}

/// The exported keys and their position in the partner's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPayload {
    pub position: u64,
    pub keys: Vec<DiagnosisKey>,
}

impl ExportPayload {
    pub fn decode(mut buf: &[u8]) -> Result<Self, FormatError> {
        expect_magic(&mut buf, PAYLOAD_MAGIC, "payload")?;
        ensure(&buf, 12, "payload header")?;
        let position = buf.get_u64();
        if position > i64::MAX as u64 {
            return Err(FormatError::PositionOutOfRange(position));
        }
        let declared = buf.get_u32();

        if buf.remaining() % KEY_RECORD_LEN != 0
            || buf.remaining() / KEY_RECORD_LEN != declared as usize
        {
            return Err(FormatError::CountMismatch {
                declared,
                actual: buf.remaining() / KEY_RECORD_LEN,
            });
        }

        let mut keys = Vec::with_capacity(declared as usize);
        while buf.has_remaining() {
            let mut key_data = [0u8; KEY_DATA_LEN];
            buf.copy_to_slice(&mut key_data);
            keys.push(DiagnosisKey {
                key_data,
                rolling_start: buf.get_u32(),
                rolling_period: buf.get_u32(),
                transmission_risk: buf.get_u8(),
            });
        }

        Ok(Self { position, keys })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(PAYLOAD_HEADER_LEN + self.keys.len() * KEY_RECORD_LEN);
        out.put_slice(PAYLOAD_MAGIC);
        out.put_u64(self.position);
        out.put_u32(self.keys.len() as u32);
        for key in &self.keys {
            out.put_slice(&key.key_data);
            out.put_u32(key.rolling_start);
            out.put_u32(key.rolling_period);
            out.put_u8(key.transmission_risk);
        }
        out.freeze()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn ensure(buf: &impl Buf, need: usize, section: &'static str) -> Result<(), FormatError> {
    if buf.remaining() < need {
        return Err(FormatError::Truncated {
            section,
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn expect_magic(buf: &mut impl Buf, magic: &[u8], section: &'static str) -> Result<(), FormatError> {
    ensure(buf, magic.len(), section)?;
    let mut found = vec![0u8; magic.len()];
    buf.copy_to_slice(&mut found);
    if found != magic {
        return Err(FormatError::BadMagic { section });
    }
    Ok(())
}

fn read_short_string(buf: &mut impl Buf, section: &'static str) -> Result<String, FormatError> {
    ensure(buf, 1, section)?;
    let len = buf.get_u8() as usize;
    ensure(buf, len, section)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| FormatError::InvalidUtf8(section))
}

fn put_short_string(out: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u8::MAX as usize)];
    out.put_u8(bytes.len() as u8);
    out.put_slice(bytes);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
