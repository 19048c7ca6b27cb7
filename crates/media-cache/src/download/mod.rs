//! # Download
//!
//! Per-resource request multiplexing over the file store and the network.

pub mod checksum;
mod coordinator;
mod fetcher;

pub use coordinator::{DownloadCoordinator, RangeEvent, RangeRequest, WriteGate};
pub use fetcher::{
    ByteStream, FetchRequest, FetchResponse, HttpRangeFetcher, RangeFetcher, create_client,
};
