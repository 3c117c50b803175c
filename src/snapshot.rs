//! A portable (de)serializable snapshot of an engine's directory tree,
//! covering exactly the state needed to resume inserting or rebuild: the
//! dimensionality and tuning knobs, the cyclic split schedule, and the tree
//! itself as a pre-order walk of region payloads. Dendrogram order, cluster
//! cuts, density and sort position are build-time derived values and are
//! deliberately not part of the wire format; call `build()` again after
//! restoring if you need them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub code: u64,
    pub level: u32,
    pub tuples: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub region: Option<RegionSnapshot>,
    pub left: Option<Box<EntrySnapshot>>,
    pub right: Option<Box<EntrySnapshot>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub dimensions: u32,
    pub bucketsize: u32,
    pub neighbor_margin: u32,
    pub cluster_percent: u32,
    pub dimension_levels: Vec<u32>,
    pub tuples_count: u32,
    pub tree: EntrySnapshot,
}
