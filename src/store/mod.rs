// Keyfed — Store Module
//
// Durable state shared by every keyfed instance: the partner registry, the
// lease table and the publishable key store, all in one SQLite database.

mod db;
mod error;
mod keys;
mod leases;
mod models;
mod repository;

pub use db::Database;
pub use error::StoreError;
pub use keys::{KeyStore, MAX_ROWS_PER_INSERT};
pub use leases::LeaseStore;
pub use models::{
    BatchRecord, BatchToMerge, DiagnosisKey, Lease, MergeReport, NewPartner, Partner, PartnerKey,
    KEY_DATA_LEN,
};
pub use repository::{PartnerRegistry, SqliteStore};

/// Everything a scheduler needs from durable state, shareable across tasks.
pub trait FederationStore: PartnerRegistry + LeaseStore + KeyStore + Send + Sync + 'static {
    /// Cheap round trip used by the liveness probe.
    fn ping(&self) -> Result<(), StoreError>;
}

impl FederationStore for SqliteStore {
    fn ping(&self) -> Result<(), StoreError> {
        self.database().ping()
    }
}

#[cfg(test)]
pub(crate) use keys::tests::key as test_key;
#[cfg(test)]
pub(crate) use repository::tests::new_partner as test_partner;
