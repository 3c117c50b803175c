//! The directory: a binary tree of grid regions, stored as an arena so that
//! children can be reached from their parent and parents from their
//! children without any shared ownership. See the crate-level design notes
//! in `DESIGN.md` for why this replaces a `Rc<RefCell<Weak<...>>>` tree.

use crate::region::{self, GridRegion};
use crate::snapshot::{EntrySnapshot, RegionSnapshot};

pub(crate) type EntryId = usize;

#[derive(Debug)]
pub(crate) struct DirectoryEntry {
    pub(crate) region: Option<GridRegion>,
    pub(crate) left: Option<EntryId>,
    pub(crate) right: Option<EntryId>,
    pub(crate) back: Option<EntryId>,
}

impl DirectoryEntry {
    fn empty(back: Option<EntryId>) -> Self {
        DirectoryEntry {
            region: None,
            left: None,
            right: None,
            back,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub(crate) const ROOT: EntryId = 0;

    pub(crate) fn new_root(region: GridRegion) -> Self {
        Directory {
            entries: vec![DirectoryEntry {
                region: Some(region),
                left: None,
                right: None,
                back: None,
            }],
        }
    }

    pub(crate) fn get(&self, id: EntryId) -> &DirectoryEntry {
        &self.entries[id]
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> &mut DirectoryEntry {
        &mut self.entries[id]
    }

    fn alloc(&mut self, entry: DirectoryEntry) -> EntryId {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Descends from the root consuming one bit of `code` per step (the
    /// entry's own tree depth selects which bit: bit `k` chooses right on 1,
    /// left on 0 at depth `k`), stopping when the next child is absent or
    /// `max_level` bits have been consumed. Then walks back up via `back`
    /// until a region-carrying ancestor is found.
    pub(crate) fn find_region(&self, code: u64, max_level: u32) -> EntryId {
        let mut current = Directory::ROOT;
        let mut depth = 0u32;
        while depth < max_level {
            let bit = (code >> depth) & 1;
            let next = if bit == 1 {
                self.entries[current].right
            } else {
                self.entries[current].left
            };
            match next {
                Some(child) => {
                    current = child;
                    depth += 1;
                }
                None => break,
            }
        }

        let mut node = current;
        loop {
            if self.entries[node].region.is_some() {
                return node;
            }
            match self.entries[node].back {
                Some(parent) => node = parent,
                None => return node,
            }
        }
    }

    pub(crate) fn nearest_nonempty_ancestor(&self, id: EntryId) -> Option<EntryId> {
        let mut current = self.entries[id].back;
        while let Some(parent) = current {
            if self.entries[parent].region.is_some() {
                return Some(parent);
            }
            current = self.entries[parent].back;
        }
        None
    }

    /// Creates the buddy children of `id`'s region, leaving `id`'s own
    /// region (code, level and tuples) untouched. Returns `(left, right)`.
    pub(crate) fn create_buddy_split(&mut self, id: EntryId) -> (EntryId, EntryId) {
        let (code, level) = {
            let region = self.entries[id]
                .region
                .as_ref()
                .expect("buddy split requires a region");
            (region.code(), region.level())
        };
        let ((left_code, left_level), (right_code, right_level)) =
            region::buddy_children(code, level);

        let left_id = self.alloc(DirectoryEntry {
            region: Some(GridRegion::new(left_code, left_level)),
            left: None,
            right: None,
            back: Some(id),
        });
        let right_id = self.alloc(DirectoryEntry {
            region: Some(GridRegion::new(right_code, right_level)),
            left: None,
            right: None,
            back: Some(id),
        });
        self.entries[id].left = Some(left_id);
        self.entries[id].right = Some(right_id);
        (left_id, right_id)
    }

    pub(crate) fn clear_buddy_split(&mut self, id: EntryId) {
        self.entries[id].left = None;
        self.entries[id].right = None;
    }

    /// Picks the sparse (smaller population) and dense child out of a pair.
    /// Ties favor the left entry as dense.
    pub(crate) fn sparse_and_dense(&self, left_id: EntryId, right_id: EntryId) -> (EntryId, EntryId) {
        let left_pop = self.entries[left_id]
            .region
            .as_ref()
            .map_or(0, GridRegion::population);
        let right_pop = self.entries[right_id]
            .region
            .as_ref()
            .map_or(0, GridRegion::population);
        if right_pop > left_pop {
            (left_id, right_id)
        } else {
            (right_id, left_id)
        }
    }

    /// Detaches `child` from `parent` if `child` carries neither a region
    /// nor any children of its own.
    pub(crate) fn prune_if_leaf(&mut self, parent: EntryId, child: EntryId) {
        let childless = self.entries[child].region.is_none()
            && self.entries[child].left.is_none()
            && self.entries[child].right.is_none();
        if !childless {
            return;
        }
        if self.entries[parent].left == Some(child) {
            self.entries[parent].left = None;
        } else if self.entries[parent].right == Some(child) {
            self.entries[parent].right = None;
        }
    }

    fn move_to_right(&mut self, id: EntryId) -> EntryId {
        let region = self.entries[id]
            .region
            .take()
            .expect("moveToRight requires a region on the entry");
        let code = region.code();
        let level = region.level();
        let tuples = region.into_tuples();

        let right_id = match self.entries[id].right {
            Some(r) => r,
            None => {
                let new_id = self.alloc(DirectoryEntry::empty(Some(id)));
                self.entries[id].right = Some(new_id);
                new_id
            }
        };

        let right_region = self.entries[right_id]
            .region
            .get_or_insert_with(|| GridRegion::new(code | (1 << level), level + 1));
        for t in tuples {
            right_region.insert_tuple(t);
        }
        right_id
    }

    fn move_to_left(&mut self, id: EntryId) -> EntryId {
        let region = self.entries[id]
            .region
            .take()
            .expect("moveToLeft requires a region on the entry");
        let code = region.code();
        let level = region.level();
        let tuples = region.into_tuples();

        let left_id = match self.entries[id].left {
            Some(l) => l,
            None => {
                let new_id = self.alloc(DirectoryEntry::empty(Some(id)));
                self.entries[id].left = Some(new_id);
                new_id
            }
        };

        let left_region = self.entries[left_id]
            .region
            .get_or_insert_with(|| GridRegion::new(code, level + 1));
        for t in tuples {
            left_region.insert_tuple(t);
        }
        left_id
    }

    /// Resolves the "entry plus a direct child both carry a region"
    /// conflict by pushing the entry's own region down into whichever side
    /// is free, recursing until the conflict clears. Returns the id where
    /// the entry's content now lives.
    pub(crate) fn check_tree(&mut self, id: EntryId) -> EntryId {
        if self.entries[id].region.is_none() {
            return id;
        }
        let left = self.entries[id].left;
        let right = self.entries[id].right;
        let left_has_region = left.map_or(false, |l| self.entries[l].region.is_some());
        let right_has_region = right.map_or(false, |r| self.entries[r].region.is_some());

        match (left_has_region, right_has_region) {
            (true, true) => {
                log::warn!(
                    "directory entry {id} carries a region while both children also \
                     carry regions; leaving the tree unchanged"
                );
                id
            }
            (true, false) => {
                let moved = self.move_to_right(id);
                self.check_tree(moved)
            }
            (false, true) => {
                let moved = self.move_to_left(id);
                self.check_tree(moved)
            }
            (false, false) => id,
        }
    }

    /// Recomputes every region's density in one bottom-up pass: a node's
    /// effective geometric size is its nominal `2^-depth` minus the
    /// effective size already claimed by its children. Idempotent.
    pub(crate) fn calculate_density(&mut self) {
        self.density_pass(Directory::ROOT, 0);
    }

    fn density_pass(&mut self, id: EntryId, depth: u32) -> f64 {
        let (left, right) = (self.entries[id].left, self.entries[id].right);
        let mut child_sum = 0.0;
        if let Some(l) = left {
            child_sum += self.density_pass(l, depth + 1);
        }
        if let Some(r) = right {
            child_sum += self.density_pass(r, depth + 1);
        }
        let effective_size = 2f64.powi(-(depth as i32)) - child_sum;
        if let Some(region) = self.entries[id].region.as_mut() {
            region.set_density(region.population() as f64 / effective_size);
        }
        effective_size
    }

    pub(crate) fn collect_region_ids(&self, id: EntryId, out: &mut Vec<EntryId>) {
        if self.entries[id].region.is_some() {
            out.push(id);
        }
        if let Some(l) = self.entries[id].left {
            self.collect_region_ids(l, out);
        }
        if let Some(r) = self.entries[id].right {
            self.collect_region_ids(r, out);
        }
    }

    pub(crate) fn to_snapshot(&self, id: EntryId) -> EntrySnapshot {
        let entry = &self.entries[id];
        EntrySnapshot {
            region: entry.region.as_ref().map(|r| RegionSnapshot {
                code: r.code(),
                level: r.level(),
                tuples: r.tuples().to_vec(),
            }),
            left: entry.left.map(|l| Box::new(self.to_snapshot(l))),
            right: entry.right.map(|r| Box::new(self.to_snapshot(r))),
        }
    }

    pub(crate) fn from_snapshot(snapshot: &EntrySnapshot) -> Self {
        let mut directory = Directory { entries: Vec::new() };
        directory.build_from_snapshot(snapshot, None);
        directory
    }

    fn build_from_snapshot(&mut self, snapshot: &EntrySnapshot, back: Option<EntryId>) -> EntryId {
        let region = snapshot.region.as_ref().map(|r| {
            let mut region = GridRegion::new(r.code, r.level);
            for t in &r.tuples {
                region.insert_tuple(t.clone());
            }
            region
        });
        let id = self.alloc(DirectoryEntry {
            region,
            left: None,
            right: None,
            back,
        });
        if let Some(l) = &snapshot.left {
            let left_id = self.build_from_snapshot(l, Some(id));
            self.entries[id].left = Some(left_id);
        }
        if let Some(r) = &snapshot.right {
            let right_id = self.build_from_snapshot(r, Some(id));
            self.entries[id].right = Some(right_id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_region_on_singleton_tree() {
        let dir = Directory::new_root(GridRegion::new(0, 0));
        assert_eq!(dir.find_region(0, 0), Directory::ROOT);
    }

    #[test]
    fn buddy_split_and_reinsert_lands_in_correct_child() {
        let mut dir = Directory::new_root(GridRegion::new(0, 0));
        let (left, right) = dir.create_buddy_split(Directory::ROOT);
        assert_eq!(dir.find_region(0, 1), left);
        assert_eq!(dir.find_region(1, 1), right);
    }

    #[test]
    fn check_tree_pushes_conflicting_region_down() {
        let mut dir = Directory::new_root(GridRegion::new(0, 0));
        let (left, _right) = dir.create_buddy_split(Directory::ROOT);
        // Root regains a region (as split_region would after merging the
        // sparse half back in), conflicting with its left child.
        dir.get_mut(Directory::ROOT).region = Some(GridRegion::new(0, 0));
        dir.get_mut(left).region.as_mut().unwrap().insert_tuple(vec![0.1]);

        let moved = dir.check_tree(Directory::ROOT);
        assert!(dir.get(Directory::ROOT).region.is_none());
        assert!(dir.get(moved).region.is_some());
    }

    #[test]
    fn density_calculation_subtracts_descendant_area() {
        // root -> left (no region) -> left-left (region, population 2)
        let mut dir = Directory::new_root(GridRegion::new(0, 0));
        dir.get_mut(Directory::ROOT).region.as_mut().unwrap().insert_tuple(vec![0.9]);
        let left_id = {
            let id = {
                let new_id_left = dir.alloc(DirectoryEntry::empty(Some(Directory::ROOT)));
                dir.entries[Directory::ROOT].left = Some(new_id_left);
                new_id_left
            };
            id
        };
        let left_left_id = dir.alloc(DirectoryEntry {
            region: Some(GridRegion::new(0, 2)),
            left: None,
            right: None,
            back: Some(left_id),
        });
        dir.entries[left_id].left = Some(left_left_id);
        dir.get_mut(left_left_id).region.as_mut().unwrap().insert_tuple(vec![0.0]);
        dir.get_mut(left_left_id).region.as_mut().unwrap().insert_tuple(vec![0.05]);

        dir.calculate_density();

        let root_density = dir.get(Directory::ROOT).region.as_ref().unwrap().density();
        let grandchild_density = dir.get(left_left_id).region.as_ref().unwrap().density();
        assert!(float_cmp::approx_eq!(f64, root_density, 1.0 / 0.75, epsilon = 1e-9));
        assert!(float_cmp::approx_eq!(f64, grandchild_density, 2.0 / 0.25, epsilon = 1e-9));
    }
}
