use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::client::node_client::LoadSample;
use crate::error::{FleetError, Result};

/// Rule by which the pool selects a node for each spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// Uniform over the registered nodes.
    #[default]
    Random,
    /// Round-robin over registration order.
    Incremental,
    /// Round-robin over nodes with a known load sample, busiest mean
    /// utilization first. Falls back to the first registered node when no
    /// sample exists yet.
    Balancing,
}

/// Pick the index of the next node. `samples` is aligned with registration
/// order; `cursor` advances monotonically and wraps.
pub fn pick_index(
    policy: PlacementPolicy,
    cursor: &AtomicUsize,
    samples: &[Option<LoadSample>],
) -> Result<usize> {
    if samples.is_empty() {
        return Err(FleetError::NoNodeAvailable);
    }
    match policy {
        PlacementPolicy::Random => Ok(rand::thread_rng().gen_range(0..samples.len())),
        PlacementPolicy::Incremental => {
            Ok(cursor.fetch_add(1, Ordering::Relaxed) % samples.len())
        }
        PlacementPolicy::Balancing => {
            let mut known: Vec<(usize, f64)> = samples
                .iter()
                .enumerate()
                .filter_map(|(i, sample)| sample.as_ref().map(|s| (i, s.mean_utilization())))
                .collect();
            if known.is_empty() {
                return Ok(0);
            }
            // Descending mean; the stable sort keeps registration order on
            // ties to match the reference ordering.
            known.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let slot = cursor.fetch_add(1, Ordering::Relaxed) % known.len();
            Ok(known[slot].0)
        }
    }
}
