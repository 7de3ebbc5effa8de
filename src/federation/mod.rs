// Keyfed — Federation Module
//
// The import engine: lease coordination, partner fetching, batch
// verification, merging and the scheduling loop that ties them together.

mod coordinator;
mod error;
mod fetch;
mod format;
mod lease;
mod merge;
mod retry;
mod scheduler;
mod validate;

pub use coordinator::{Coordinator, PartnerResult, ScheduleSummary};
pub use error::{ErrorKind, FetchError, FormatError, ImportError, RejectReason};
pub use fetch::{parse_index, BatchSource, FetchConfig, Fetcher, HttpBatchSource, IndexEntry, RawBatch};
pub use format::{ExportPayload, SignedEnvelope, ENVELOPE_MAGIC, PAYLOAD_MAGIC, SIGNATURE_LEN};
pub use lease::LeaseManager;
pub use merge::MergeEngine;
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use scheduler::{CycleOutcome, ImportConfig, RunMode, Scheduler, SkipReason};
pub use validate::{SequenceGap, Validator, VerifiedBatch, MAX_ROLLING_PERIOD, MAX_TRANSMISSION_RISK};

#[cfg(test)]
pub(crate) use fetch::fake::FakeSource;
#[cfg(test)]
pub(crate) use validate::fixtures as signing_fixtures;
