//! # Storage
//!
//! Per-resource persistence: the fragment bookkeeping kept in a JSON
//! configuration file and the data file holding the cached bytes.

mod configuration;
mod file;

pub use configuration::{Configuration, FragmentStore};
pub(crate) use configuration::write_json;
pub use file::{Action, CacheEvent, DEFAULT_PACKET_LIMIT, FileStore, StoreOptions};
