//! Builder-style engine configuration, in the same chained-setter idiom
//! used by `clam`'s `PartitionCriteria` builder: `EngineConfig::new(d).with_x(..)`.

use crate::engine::Engine;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) dimensions: u32,
    pub(crate) bucketsize: u32,
    pub(crate) neighbor_margin: u32,
    pub(crate) cluster_percent: u32,
}

impl EngineConfig {
    /// Starts from the default bucketsize (100), neighbor margin (1) and
    /// cluster percent (50) for a `dimensions`-dimensional engine.
    pub fn new(dimensions: u32) -> Self {
        EngineConfig {
            dimensions,
            bucketsize: 100,
            neighbor_margin: 1,
            cluster_percent: 50,
        }
    }

    pub fn with_bucketsize(mut self, bucketsize: u32) -> Self {
        self.bucketsize = bucketsize;
        self
    }

    pub fn with_neighbor_margin(mut self, neighbor_margin: u32) -> Self {
        self.neighbor_margin = neighbor_margin;
        self
    }

    pub fn with_cluster_percent(mut self, cluster_percent: u32) -> Self {
        self.cluster_percent = cluster_percent;
        self
    }

    pub fn build(self) -> Result<Engine> {
        Engine::from_config(self)
    }
}
