//! Sampling sanity check for downloaded payloads.
//!
//! This is an anomaly detector for obviously broken payloads such as long runs
//! of zero bytes. It provides no integrity guarantee.

use tracing::trace;

/// Default slice size used when sampling a payload.
pub const DEFAULT_SLICE_SIZE: usize = 1024;

/// Samples roughly `sqrt(slices)` random slices of `data` and fails when any of
/// them sums to less than its own length. An empty payload fails.
pub fn verify(data: &[u8], slice_size: usize) -> bool {
    if data.is_empty() {
        return false;
    }

    let slice_size = slice_size.max(1);
    let slices: Vec<&[u8]> = data.chunks(slice_size).collect();
    let samples = (slices.len() as f64).sqrt().floor() as usize;

    let mut candidates: Vec<usize> = (0..slices.len()).collect();
    for _ in 0..samples.max(1) {
        let pick = rand::random_range(0..candidates.len());
        let index = candidates.swap_remove(pick);
        let slice = slices[index];

        let sum: u64 = slice.iter().map(|&b| u64::from(b)).sum();
        if sum < slice.len() as u64 {
            trace!(slice = index, sum, "Checksum slice rejected");
            return false;
        }
    }
    true
}
