//! The BANG-file clustering engine: inserts tuples into a self-balancing
//! grid directory, then on `build` turns the directory into a density-
//! ordered dendrogram and cuts it into clusters.

use crate::cluster::Cluster;
use crate::config::EngineConfig;
use crate::directory::{Directory, EntryId};
use crate::error::{BangError, Result};
use crate::region::{self, GridRegion};
use crate::region_coder;
use crate::snapshot::EngineSnapshot;

#[derive(Debug)]
pub struct Engine {
    d: u32,
    bucketsize: u32,
    neighbor_margin: u32,
    neighbor_condition: u32,
    cluster_percent: u32,
    dimension_levels: Vec<u32>,
    directory: Directory,
    tuples_count: u32,
    dendrogram: Vec<EntryId>,
    clusters: Vec<Cluster>,
    built: bool,
}

impl Engine {
    /// Builds an engine with the given dimensionality, bucketsize, neighbor
    /// margin and cluster percent. Prefer [`EngineConfig`] when only some of
    /// these need overriding from their defaults.
    pub fn new(d: u32, bucketsize: u32, neighbor_margin: u32, cluster_percent: u32) -> Result<Self> {
        EngineConfig::new(d)
            .with_bucketsize(bucketsize)
            .with_neighbor_margin(neighbor_margin)
            .with_cluster_percent(cluster_percent)
            .build()
    }

    pub(crate) fn from_config(config: EngineConfig) -> Result<Self> {
        if config.dimensions == 0 {
            return Err(BangError::InvalidParameter {
                what: "dimensions must be at least 1".to_string(),
            });
        }
        if config.bucketsize < 4 {
            return Err(BangError::InvalidParameter {
                what: format!("bucketsize must be >= 4, got {}", config.bucketsize),
            });
        }
        if config.neighbor_margin < 1 || config.neighbor_margin > config.dimensions {
            return Err(BangError::InvalidParameter {
                what: format!(
                    "neighbor_margin must be in [1, {}], got {}",
                    config.dimensions, config.neighbor_margin
                ),
            });
        }
        if config.cluster_percent > 100 {
            return Err(BangError::InvalidParameter {
                what: format!("cluster_percent must be in [0, 100], got {}", config.cluster_percent),
            });
        }

        let d = config.dimensions;
        Ok(Engine {
            d,
            bucketsize: config.bucketsize,
            neighbor_margin: config.neighbor_margin,
            neighbor_condition: d - config.neighbor_margin,
            cluster_percent: config.cluster_percent,
            dimension_levels: vec![0; d as usize + 1],
            directory: Directory::new_root(GridRegion::new(0, 0)),
            tuples_count: 0,
            dendrogram: Vec::new(),
            clusters: Vec::new(),
            built: false,
        })
    }

    pub fn dimensions(&self) -> u32 {
        self.d
    }

    pub fn bucketsize(&self) -> u32 {
        self.bucketsize
    }

    fn validate_tuple(&self, tuple: &[f64]) -> Result<()> {
        if tuple.len() != self.d as usize {
            return Err(BangError::DimensionMismatch {
                expected: self.d as usize,
                found: tuple.len(),
            });
        }
        for (i, &v) in tuple.iter().enumerate() {
            if !(0.0..=1.0).contains(&v) {
                return Err(BangError::DomainViolation { dimension: i, value: v });
            }
        }
        Ok(())
    }

    /// Inserts a tuple, growing the directory as needed. Returns an error if
    /// `build` has already been called, the tuple's arity doesn't match the
    /// engine's dimensionality, or a coordinate falls outside `[0, 1]`.
    pub fn insert(&mut self, tuple: &[f64]) -> Result<()> {
        if self.built {
            return Err(BangError::UseAfterBuild);
        }
        self.validate_tuple(tuple)?;
        self.place_tuple(tuple.to_vec());
        self.tuples_count += 1;
        Ok(())
    }

    /// Core recursive placement, shared by top-level inserts and the
    /// internal re-distribution done by splitting/redistributing. Never
    /// touches `tuples_count`: callers that are moving an already-counted
    /// tuple must not double-count it.
    fn place_tuple(&mut self, tuple: Vec<f64>) {
        let code = region_coder::map_region(&tuple, &self.dimension_levels);
        let id = self.directory.find_region(code, self.dimension_levels[0]);
        let population = self.directory.get(id).region.as_ref()
            .expect("find_region must return a region-carrying entry")
            .population();

        if population < self.bucketsize {
            self.directory
                .get_mut(id)
                .region
                .as_mut()
                .unwrap()
                .insert_tuple(tuple);
            return;
        }

        match self.directory.nearest_nonempty_ancestor(id) {
            None => self.split_region(id),
            Some(enclosing_id) => {
                if !self.redistribute(id, enclosing_id) {
                    let code = region_coder::map_region(&tuple, &self.dimension_levels);
                    let id = self.directory.find_region(code, self.dimension_levels[0]);
                    self.split_region(id);
                }
            }
        }
        self.place_tuple(tuple);
    }

    /// Buddy-splits `id`, bumping `dimension_levels` if this is the deepest
    /// split seen so far, then re-inserts `id`'s old tuples into the fresh
    /// children. Returns the two children and whether `dimension_levels` was
    /// incremented.
    fn manage_buddy_split(&mut self, id: EntryId) -> (EntryId, EntryId, bool) {
        let (left_id, right_id) = self.directory.create_buddy_split(id);

        let region_level = self.directory.get(id).region.as_ref().unwrap().level();
        let mut incremented = false;
        if region_level == self.dimension_levels[0] {
            let dim = (self.dimension_levels[0] as usize % self.d as usize) + 1;
            self.dimension_levels[dim] += 1;
            self.dimension_levels[0] += 1;
            incremented = true;
        }

        let old_tuples = self.directory.get_mut(id).region.as_mut().unwrap().clear_tuples();
        for t in old_tuples {
            self.place_tuple(t);
        }

        (left_id, right_id, incremented)
    }

    fn split_region(&mut self, id: EntryId) {
        let (left_id, right_id, _inc) = self.manage_buddy_split(id);
        let (sparse_id, dense_id) = self.directory.sparse_and_dense(left_id, right_id);

        let sparse_tuples = self.directory.get_mut(sparse_id).region.take()
            .expect("sparse child must carry a region")
            .into_tuples();
        {
            let entry_region = self.directory.get_mut(id).region.as_mut()
                .expect("entry must still carry its region");
            for t in sparse_tuples {
                entry_region.insert_tuple(t);
            }
        }
        self.directory.prune_if_leaf(id, sparse_id);

        let dense_id = self.directory.check_tree(dense_id);
        self.redistribute(dense_id, id);
        self.directory.check_tree(id);
    }

    fn redistribute(&mut self, entry_id: EntryId, enclosing_id: EntryId) -> bool {
        let (left_id, right_id, inc) = self.manage_buddy_split(entry_id);
        let (sparse_id, dense_id) = self.directory.sparse_and_dense(left_id, right_id);

        let enclosing_pop = self.directory.get(enclosing_id).region.as_ref()
            .expect("enclosing entry must carry a region")
            .population();
        let dense_pop = self.directory.get(dense_id).region.as_ref()
            .expect("dense child must carry a region")
            .population();

        if enclosing_pop < dense_pop {
            self.directory.get_mut(entry_id).region = None;

            let sparse_tuples = self.directory.get_mut(sparse_id).region.take()
                .expect("sparse child must carry a region")
                .into_tuples();
            {
                let enclosing_region = self.directory.get_mut(enclosing_id).region.as_mut().unwrap();
                for t in sparse_tuples {
                    enclosing_region.insert_tuple(t);
                }
            }
            self.directory.prune_if_leaf(entry_id, sparse_id);

            let dense_id = self.directory.check_tree(dense_id);
            let dense_pop_after = self.directory.get(dense_id).region.as_ref().map_or(0, GridRegion::population);
            let enclosing_pop_after = self.directory.get(enclosing_id).region.as_ref().unwrap().population();
            if enclosing_pop_after < dense_pop_after {
                log::trace!("redistribute cascading: enclosing {enclosing_id} still outgrown by {dense_id}");
                self.redistribute(dense_id, enclosing_id);
            }
            true
        } else {
            if inc {
                let total = self.dimension_levels[0];
                let dim = ((total - 1) as usize % self.d as usize) + 1;
                self.dimension_levels[dim] -= 1;
                self.dimension_levels[0] -= 1;
            }
            self.directory.clear_buddy_split(entry_id);
            false
        }
    }

    /// Freezes the directory into a sorted region list, a dendrogram and a
    /// set of clusters. No further inserts are allowed afterwards.
    pub fn build(&mut self) {
        self.directory.calculate_density();

        let mut region_ids = Vec::new();
        self.directory.collect_region_ids(Directory::ROOT, &mut region_ids);
        region_ids.sort_by(|&a, &b| {
            let ra = self.directory.get(a).region.as_ref().unwrap();
            let rb = self.directory.get(b).region.as_ref().unwrap();
            region::density_order(ra, rb)
        });
        for (rank, &id) in region_ids.iter().enumerate() {
            self.directory.get_mut(id).region.as_mut().unwrap().set_position(rank as u32 + 1);
        }

        self.dendrogram = self.create_dendrogram(&region_ids);
        self.clusters = self.create_clusters(&region_ids);
        self.built = true;

        log::debug!(
            "build complete: {} tuples, {} regions, {} clusters",
            self.tuples_count,
            region_ids.len(),
            self.clusters.len()
        );
    }

    fn create_dendrogram(&self, sorted: &[EntryId]) -> Vec<EntryId> {
        if sorted.is_empty() {
            return Vec::new();
        }

        let mut dendrogram = vec![sorted[0]];
        let mut remaining: Vec<EntryId> = sorted[1..].to_vec();

        let mut dendo_pos = 0;
        while !remaining.is_empty() && dendo_pos < dendrogram.len() {
            let anchor = dendrogram[dendo_pos];
            let (anchor_code, anchor_level) = {
                let r = self.directory.get(anchor).region.as_ref().unwrap();
                (r.code(), r.level())
            };

            let mut start_search_pos = dendo_pos + 1;
            let mut i = 0;
            while i < remaining.len() {
                let candidate = remaining[i];
                let (cand_code, cand_level) = {
                    let r = self.directory.get(candidate).region.as_ref().unwrap();
                    (r.code(), r.level())
                };
                if region_coder::is_neighbor(
                    (anchor_code, anchor_level),
                    (cand_code, cand_level),
                    self.d,
                    self.neighbor_condition,
                ) {
                    let insert_at = self.find_insertion_index(&dendrogram, start_search_pos, candidate);
                    dendrogram.insert(insert_at, candidate);
                    remaining.remove(i);
                    start_search_pos += 1;
                } else {
                    i += 1;
                }
            }
            dendo_pos += 1;
        }

        if !remaining.is_empty() {
            log::warn!(
                "{} region(s) had no neighbor path into the dendrogram; appending in density order",
                remaining.len()
            );
            dendrogram.extend(remaining);
        }
        dendrogram
    }

    fn find_insertion_index(&self, dendrogram: &[EntryId], start: usize, candidate: EntryId) -> usize {
        let (cand_density, cand_position) = {
            let r = self.directory.get(candidate).region.as_ref().unwrap();
            (r.density(), r.position())
        };
        let mut idx = start;
        while idx < dendrogram.len() {
            let (density, position) = {
                let r = self.directory.get(dendrogram[idx]).region.as_ref().unwrap();
                (r.density(), r.position())
            };
            if density > cand_density || (density == cand_density && position < cand_position) {
                idx += 1;
            } else {
                break;
            }
        }
        idx
    }

    fn create_clusters(&self, sorted: &[EntryId]) -> Vec<Cluster> {
        let goal = ((self.cluster_percent as u64 * self.tuples_count as u64 + 50) / 100) as u32;

        let mut clustered_pop: u32 = 0;
        let mut clustered_regions = 0usize;
        for (i, &id) in sorted.iter().enumerate() {
            let remaining_need = goal.saturating_sub(clustered_pop);
            if remaining_need == 0 {
                break;
            }
            let pop = self.directory.get(id).region.as_ref().unwrap().population();
            if pop <= remaining_need {
                clustered_pop += pop;
                clustered_regions = i + 1;
            } else {
                if pop.saturating_sub(remaining_need) <= remaining_need {
                    clustered_pop += pop;
                    clustered_regions = i + 1;
                }
                break;
            }
        }

        let mut clusters = Vec::new();
        let mut current: Vec<EntryId> = Vec::new();
        let mut current_pop: u32 = 0;
        for &id in &self.dendrogram {
            let region = self.directory.get(id).region.as_ref().unwrap();
            if region.position() as usize <= clustered_regions {
                current_pop += region.population();
                current.push(id);
            } else if !current.is_empty() {
                clusters.push(Cluster::new(std::mem::take(&mut current), current_pop));
                current_pop = 0;
            }
        }
        if !current.is_empty() {
            clusters.push(Cluster::new(current, current_pop));
        }

        clusters.sort_by(|a, b| b.population().cmp(&a.population()));
        clusters
    }

    /// The index of the cluster containing `tuple`'s region, or `-1` if its
    /// region was never folded into a cluster cut.
    pub fn cluster_of(&self, tuple: &[f64]) -> Result<i32> {
        self.validate_tuple(tuple)?;
        let code = region_coder::map_region(tuple, &self.dimension_levels);
        let id = self.directory.find_region(code, self.dimension_levels[0]);
        for (idx, cluster) in self.clusters.iter().enumerate() {
            if cluster.regions().contains(&id) {
                return Ok(idx as i32);
            }
        }
        Ok(-1)
    }

    /// All tuples belonging to the regions of cluster `cluster_index`.
    pub fn tuples_of(&self, cluster_index: usize) -> Result<Vec<Vec<f64>>> {
        let cluster = self.clusters.get(cluster_index).ok_or_else(|| BangError::InvalidParameter {
            what: format!("cluster index {cluster_index} out of range (have {})", self.clusters.len()),
        })?;
        let mut out = Vec::new();
        for &id in cluster.regions() {
            if let Some(region) = self.directory.get(id).region.as_ref() {
                out.extend(region.tuples().iter().cloned());
            }
        }
        Ok(out)
    }

    pub fn number_of_tuples(&self) -> u32 {
        self.tuples_count
    }

    pub fn number_of_clusters(&self) -> u32 {
        self.clusters.len() as u32
    }

    /// A human-readable summary of the cluster cut, one line per cluster.
    pub fn render_report(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "BANG-file cluster report");
        let _ = writeln!(out, "dimensions:  {}", self.d);
        let _ = writeln!(out, "bucketsize:  {}", self.bucketsize);
        let _ = writeln!(out, "tuples:      {}", self.tuples_count);
        let _ = writeln!(out, "clusters:    {}", self.clusters.len());
        for (i, cluster) in self.clusters.iter().enumerate() {
            let pct = if self.tuples_count == 0 {
                0.0
            } else {
                100.0 * cluster.population() as f64 / self.tuples_count as f64
            };
            let _ = writeln!(out, "  cluster {i:>3}: {:>6} tuples ({pct:>5.1}%)", cluster.population());
        }
        out
    }

    /// Captures the directory tree and tuning knobs as a serializable
    /// snapshot. Build-time state (dendrogram, clusters, density, sort
    /// position) is not included; call `build()` again after restoring if
    /// you need it.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            dimensions: self.d,
            bucketsize: self.bucketsize,
            neighbor_margin: self.neighbor_margin,
            cluster_percent: self.cluster_percent,
            dimension_levels: self.dimension_levels.clone(),
            tuples_count: self.tuples_count,
            tree: self.directory.to_snapshot(Directory::ROOT),
        }
    }

    /// Rebuilds an engine from a snapshot taken by [`Engine::snapshot`].
    /// The restored engine has not been built; call `build()` if you need
    /// dendrogram or cluster output.
    pub fn from_snapshot(snapshot: &EngineSnapshot) -> Result<Self> {
        let config = EngineConfig::new(snapshot.dimensions)
            .with_bucketsize(snapshot.bucketsize)
            .with_neighbor_margin(snapshot.neighbor_margin)
            .with_cluster_percent(snapshot.cluster_percent);
        let mut engine = Engine::from_config(config)?;
        engine.dimension_levels = snapshot.dimension_levels.clone();
        engine.tuples_count = snapshot.tuples_count;
        engine.directory = Directory::from_snapshot(&snapshot.tree);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_configuration() {
        assert!(Engine::new(2, 3, 1, 50).is_err(), "bucketsize below 4 must be rejected");
        assert!(Engine::new(2, 10, 0, 50).is_err(), "neighbor_margin below 1 must be rejected");
        assert!(Engine::new(2, 10, 3, 50).is_err(), "neighbor_margin above d must be rejected");
        assert!(Engine::new(2, 10, 1, 101).is_err(), "cluster_percent above 100 must be rejected");
    }

    #[test]
    fn rejects_out_of_domain_tuples() {
        let mut engine = Engine::new(2, 10, 1, 50).unwrap();
        assert!(matches!(engine.insert(&[0.5]), Err(BangError::DimensionMismatch { .. })));
        assert!(matches!(engine.insert(&[1.5, 0.2]), Err(BangError::DomainViolation { .. })));
    }

    #[test]
    fn insert_after_build_is_rejected() {
        let mut engine = Engine::new(2, 10, 1, 50).unwrap();
        engine.insert(&[0.1, 0.1]).unwrap();
        engine.build();
        assert!(matches!(engine.insert(&[0.2, 0.2]), Err(BangError::UseAfterBuild)));
    }

    #[test]
    fn single_bucket_worth_of_tuples_stays_in_one_region() {
        let mut engine = Engine::new(2, 100, 1, 50).unwrap();
        for i in 0..50 {
            let x = (i as f64) / 1000.0;
            engine.insert(&[x, x]).unwrap();
        }
        engine.build();
        assert_eq!(engine.number_of_tuples(), 50);
        assert!(engine.number_of_clusters() >= 1);
    }

    #[test]
    fn overflowing_bucketsize_splits_the_root() {
        let mut engine = Engine::new(2, 10, 1, 50).unwrap();
        for i in 0..40 {
            let x = 0.01 + (i as f64) * 0.001;
            engine.insert(&[x, x]).unwrap();
        }
        engine.build();
        assert_eq!(engine.number_of_tuples(), 40);
        // The root alone could never have held 40 tuples at a bucketsize of
        // 10, so the directory must have grown beyond the single root entry.
        assert!(engine.dimension_levels[0] > 0);
    }

    #[test]
    fn low_cluster_percent_leaves_the_far_clump_unclustered() {
        // A tight cluster_percent only pulls in the densest clump's regions;
        // a point from a geometrically disjoint second clump should fall
        // outside every cluster cut.
        let mut engine = Engine::new(2, 8, 1, 20).unwrap();
        for i in 0..30 {
            let jitter = (i as f64) * 0.0005;
            engine.insert(&[0.05 + jitter, 0.05 + jitter]).unwrap();
        }
        for i in 0..30 {
            let jitter = (i as f64) * 0.0005;
            engine.insert(&[0.95 - jitter, 0.95 - jitter]).unwrap();
        }
        engine.build();

        let near_origin = engine.cluster_of(&[0.05, 0.05]).unwrap();
        let near_corner = engine.cluster_of(&[0.95, 0.95]).unwrap();
        assert_ne!(near_origin, -1, "the densest clump must end up in some cluster");
        assert_eq!(near_corner, -1, "a 20% cut should not reach the second clump at all");
    }

    #[test]
    fn tuples_of_out_of_range_cluster_is_an_error() {
        let mut engine = Engine::new(2, 10, 1, 50).unwrap();
        engine.insert(&[0.1, 0.1]).unwrap();
        engine.build();
        assert!(engine.tuples_of(engine.number_of_clusters() as usize + 5).is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_tuple_count_and_lookup() {
        let mut engine = Engine::new(2, 8, 1, 50).unwrap();
        for i in 0..25 {
            let x = 0.02 + (i as f64) * 0.003;
            engine.insert(&[x, 1.0 - x]).unwrap();
        }
        let snapshot = engine.snapshot();
        let mut restored = Engine::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.number_of_tuples(), engine.number_of_tuples());

        restored.build();
        assert!(restored.number_of_clusters() >= 1);
    }
}
