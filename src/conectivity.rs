use crate::arrays::Array2D;
use crate::cluster::{Label, UNASSIGNED};
use crate::common::split_length_to_ranges;
use crate::simple_point::is_simple_label;
use crate::tiling::Direction;
use assume::assume;
use log::debug;
use multiversion::multiversion;
use rayon::current_num_threads;
use rayon::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

/// 8-connected components of equal labels.
#[derive(Debug)]
pub struct ComponentSet {
    pub num_components: u32,
    /// Component of every pixel.
    pub component_assignment: Vec<u32>,
    pub num_component_members: Vec<u32>,
    /// First pixel (raster order) of every component.
    pub component_leaders: Vec<u32>,
}

pub struct DisjointSet {
    parents: Vec<AtomicU32>,
}

impl DisjointSet {
    pub fn new(size: u32) -> Self {
        assert!(size > 0, "Size must be larger than zero.");
        assert!(size < u32::MAX, "Size must be smaller than {}", u32::MAX);
        DisjointSet {
            parents: (0..size).map(AtomicU32::new).collect(),
        }
    }

    /// Parents always point to lower indices, so the root of a set is its first element.
    #[inline]
    pub fn merge(&self, node_i: u32, node_j: u32) {
        // NOTE: Concurrent merges are only safe when the threads work on disjoint sets of nodes,
        //  which is the case for row bands in `assign_disjoint_set()`.
        let mut root_x = node_i as usize;
        let mut root_y = node_j as usize;
        let mut parent_x = self.parents[root_x].load(Ordering::Relaxed);
        let mut parent_y = self.parents[root_y].load(Ordering::Relaxed);
        while parent_x != parent_y {
            if parent_x > parent_y {
                assume!(unsafe: root_x < self.parents.len(), "root: {root_x} > {}", self.parents.len());
                if root_x as u32 == parent_x {
                    self.parents[root_x].store(parent_y, Ordering::Relaxed);
                    break;
                }
                let z = parent_x as usize;
                parent_x = self.parents[z].load(Ordering::Relaxed);
                assume!(unsafe: (parent_x as usize) < self.parents.len(), "root: {parent_x} > {}", self.parents.len());
                self.parents[root_x].store(parent_y, Ordering::Relaxed);
                root_x = z;
            } else {
                assume!(unsafe: root_y < self.parents.len(), "root: {root_y} > {}", self.parents.len());
                if root_y as u32 == parent_y {
                    self.parents[root_y].store(parent_x, Ordering::Relaxed);
                    break;
                }
                let z = parent_y as usize;
                parent_y = self.parents[z].load(Ordering::Relaxed);
                assume!(unsafe: (parent_y as usize) < self.parents.len(), "root: {parent_y} > {}", self.parents.len());
                self.parents[root_y].store(parent_x, Ordering::Relaxed);
                root_y = z;
            }
        }
    }

    /// Numbers the sets in order of their first element.
    pub fn flatten(&self) -> ComponentSet {
        let len = self.parents.len();
        let mut component_assignment = vec![u32::MAX; len];
        let mut num_component_members: Vec<u32> = Vec::new();
        let mut component_leaders: Vec<u32> = Vec::new();
        for i in 0..len {
            let parent = self.parents[i].load(Ordering::Relaxed) as usize;
            assume!(unsafe: parent <= i, "parent: {parent} > {i}");
            let component_no = if parent == i {
                component_leaders.push(i as u32);
                num_component_members.push(0);
                (component_leaders.len() - 1) as u32
            } else {
                // parent < i, so it's numbered already
                component_assignment[parent]
            };
            component_assignment[i] = component_no;
            num_component_members[component_no as usize] += 1;
        }
        ComponentSet {
            num_components: component_leaders.len() as u32,
            component_assignment,
            num_component_members,
            component_leaders,
        }
    }
}

/// Builds the disjoint set of 8-connected equal labels. Row bands are processed in parallel and
/// stitched together afterwards.
#[multiversion(targets = "simd")]
pub fn assign_disjoint_set(labels: &Array2D<Label>) -> DisjointSet {
    let num_threads: usize = current_num_threads();
    let cc_set = DisjointSet::new(labels.data.len() as u32);
    let vsplit_ranges = split_length_to_ranges(labels.height, num_threads);
    let mut seam_ys: Vec<usize> = vsplit_ranges.iter().map(|r| r.end).collect();
    seam_ys.pop(); // remove the end (bottom line of the image)

    fn merge_with_row_above(labels: &Array2D<Label>, cc_set: &DisjointSet, row: usize) {
        let width = labels.width;
        let current = labels.get_row(row);
        let above = labels.get_row(row - 1);
        let index = (row * width) as u32;
        let index_up = index - width as u32;
        for (x, label) in current.iter().enumerate() {
            let left = x.saturating_sub(1);
            let right = (x + 1).min(width - 1);
            for (ux, label_up) in above[left..=right].iter().enumerate() {
                if label_up == label {
                    cc_set.merge(index_up + (left + ux) as u32, index + x as u32);
                }
            }
        }
    }

    fn assign_disjoint_set_thread(labels: &Array2D<Label>, cc_set: &DisjointSet, range: Range<usize>) {
        let first_row = range.start;
        for row in range {
            let index = (row * labels.width) as u32;
            let current = labels.get_row(row);
            for x in 1..labels.width {
                if current[x] == current[x - 1] {
                    cc_set.merge(index + x as u32 - 1, index + x as u32);
                }
            }
            if row > first_row {
                merge_with_row_above(labels, cc_set, row);
            }
        }
    }

    vsplit_ranges
        .into_par_iter()
        .filter(|r| !r.is_empty())
        .for_each(|r| assign_disjoint_set_thread(labels, &cc_set, r));

    for y in seam_ys {
        merge_with_row_above(labels, &cc_set, y);
    }
    cc_set
}

/// Labels the 8-connected components of `labels`.
pub fn label_components(labels: &Array2D<Label>) -> ComponentSet {
    assign_disjoint_set(labels).flatten()
}

/// This function makes every label a single 8-connected region.
///
/// The largest component of every label keeps it (ties go to the component starting first).
/// The other components, and unassigned pixels, are absorbed pixel by pixel starting from the
/// pixels touching kept regions: each takes the most frequent label among its finalized
/// neighbors, preferring labels for which it's a simple point. Returns the number of relabeled
/// pixels.
pub fn enforce_connectivity(labels: &mut Array2D<Label>) -> usize {
    let cc_set = label_components(labels);

    let mut kept: HashMap<Label, u32> = HashMap::new();
    for component_no in 0..cc_set.num_components {
        let leader = cc_set.component_leaders[component_no as usize] as usize;
        let label = labels.data[leader];
        if label == UNASSIGNED {
            continue;
        }
        let members = cc_set.num_component_members[component_no as usize];
        kept.entry(label)
            .and_modify(|best| {
                // leaders grow with component_no, so `>` keeps the first on ties
                if members > cc_set.num_component_members[*best as usize] {
                    *best = component_no;
                }
            })
            .or_insert(component_no);
    }
    let mut finalized: Vec<bool> = vec![false; cc_set.num_components as usize];
    for component_no in kept.values() {
        finalized[*component_no as usize] = true;
    }
    let mut finalized: Vec<bool> = cc_set
        .component_assignment
        .iter()
        .map(|c| finalized[*c as usize])
        .collect();
    if finalized.iter().all(|f| *f) || !finalized.iter().any(|f| *f) {
        return 0;
    }

    let width = labels.width as isize;
    let height = labels.height as isize;
    let neighbors_of = |index: usize| {
        let x = index as isize % width;
        let y = index as isize / width;
        Direction::ALL.map(|direction| {
            let (dx, dy) = direction.offset();
            let (nx, ny) = (x + dx, y + dy);
            if nx >= 0 && ny >= 0 && nx < width && ny < height {
                Some((ny * width + nx) as usize)
            } else {
                None
            }
        })
    };

    let mut queued = finalized.clone();
    let mut queue: VecDeque<usize> = VecDeque::new();
    for index in 0..finalized.len() {
        if !finalized[index] && neighbors_of(index).iter().flatten().any(|n| finalized[*n]) {
            queued[index] = true;
            queue.push_back(index);
        }
    }

    let mut corrections = 0;
    while let Some(index) = queue.pop_front() {
        let neighbors = neighbors_of(index);
        let pattern: [Label; 8] = neighbors.map(|n| match n {
            Some(n) if finalized[n] => labels.data[n],
            _ => UNASSIGNED,
        });
        let mut votes: Vec<(Label, usize)> = Vec::with_capacity(8);
        for label in pattern.iter().filter(|l| **l != UNASSIGNED) {
            match votes.iter_mut().find(|(l, _)| l == label) {
                Some((_, count)) => *count += 1,
                None => votes.push((*label, 1)),
            }
        }
        votes.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        debug_assert!(!votes.is_empty(), "queued pixel {index} without finalized neighbors");
        let label = votes
            .iter()
            .map(|(label, _)| *label)
            .find(|label| is_simple_label(&pattern, *label))
            .unwrap_or(votes[0].0);
        if labels.data[index] != label {
            corrections += 1;
        }
        labels.data[index] = label;
        finalized[index] = true;
        for n in neighbors.into_iter().flatten() {
            if !queued[n] {
                queued[n] = true;
                queue.push_back(n);
            }
        }
    }
    if corrections > 0 {
        debug!("relabeled {corrections} pixels of disconnected fragments");
    }
    corrections
}
