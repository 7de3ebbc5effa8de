// Keyfed — Federation error types
//
// FetchError and RejectReason are produced by the fetcher and validator;
// ImportError is what a cycle fails with, and ErrorKind is the stable,
// serializable classification reported per partner.

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

use super::retry::Retryable;

/// Structural problems in a downloaded batch file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad {section} magic")]
    BadMagic { section: &'static str },

    #[error("truncated {section}: need {need} bytes, have {have}")]
    Truncated {
        section: &'static str,
        need: usize,
        have: usize,
    },

    #[error("declared key count {declared} does not match {actual} keys present")]
    CountMismatch { declared: u32, actual: usize },

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("position {0} is out of range")]
    PositionOutOfRange(u64),
}

/// Failures talking to a partner.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Rejected { url: String, status: u16 },

    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    #[error("gave up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    #[error("invalid index file: {0}")]
    InvalidIndex(String),

    #[error("invalid partner url: {0}")]
    InvalidUrl(String),

    #[error("credential variable {0} is not set")]
    MissingCredential(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Why the validator refused a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("malformed batch: {0}")]
    Malformed(#[from] FormatError),

    #[error("no trusted key {key_id}/{key_version} is valid now")]
    UntrustedSigner { key_id: String, key_version: String },

    #[error("trusted key {key_id}/{key_version} is not a usable Ed25519 key")]
    BadTrustedKey { key_id: String, key_version: String },

    #[error("signature verification failed")]
    BadSignature,

    #[error("batch declares position {declared} but the index listed {listed}")]
    PositionMismatch { declared: u64, listed: u64 },

    #[error("stale position {position}; cursor is already at {cursor}")]
    Stale { position: u64, cursor: u64 },

    #[error("key {index}: {reason}")]
    InvalidKey { index: usize, reason: String },

    #[error("key {index} repeats an earlier key in the same batch")]
    DuplicateKey { index: usize },
}

/// Stable classification of a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FetchFailed,
    PartnerUnreachable,
    ValidationRejected,
    MergeFailed,
    LeaseLost,
    DeadlineExceeded,
    PartnerNotFound,
    StoreFailed,
    TaskPanicked,
}

/// Why a partner cycle stopped early.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("batch {position} rejected: {reason}")]
    Rejected { position: u64, reason: RejectReason },

    #[error("merge of batch {position} failed: {source}")]
    Merge { position: u64, source: StoreError },

    #[error("lease for {0} was lost mid-cycle")]
    LeaseLost(String),

    #[error("cycle exceeded its deadline")]
    DeadlineExceeded,

    #[error("partner not found: {0}")]
    PartnerNotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::Fetch(e) => match e {
                FetchError::Transient { .. } | FetchError::Exhausted { .. } => {
                    ErrorKind::FetchFailed
                }
                FetchError::Rejected { .. }
                | FetchError::InvalidUrl(_)
                | FetchError::MissingCredential(_)
                | FetchError::Client(_) => ErrorKind::PartnerUnreachable,
                FetchError::InvalidIndex(_) | FetchError::TooLarge { .. } => {
                    ErrorKind::ValidationRejected
                }
            },
            ImportError::Rejected { .. } => ErrorKind::ValidationRejected,
            ImportError::Merge { .. } => ErrorKind::MergeFailed,
            ImportError::LeaseLost(_) => ErrorKind::LeaseLost,
            ImportError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ImportError::PartnerNotFound(_) => ErrorKind::PartnerNotFound,
            ImportError::Store(_) => ErrorKind::StoreFailed,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
