// Keyfed — Library root
//
// Re-exports the store, federation, server, configuration and CLI modules.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod federation;
pub mod server;
pub mod store;

pub use error::{KeyfedError, Result};
