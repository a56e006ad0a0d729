//! Split/merge resolution over a finished run (or interval).
//!
//! The matcher's output is strictly one-to-one, so merges and splits leave
//! their traces as dead ids and fresh ids. This pass walks the recorded
//! frames, links id lineages by an overlap-fraction criterion, rewrites
//! inherited ids in place, and keeps every event as a parent/child edge so
//! the full split-merge graph can be reconstructed downstream.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::grid::{self, Mask};
use crate::tracker::object_tracks::{Membership, ObjectOutput};

/// Terminal state of one id lineage branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFate {
    /// First seen in the final frame; nothing further is known.
    New,
    /// Alive at the end of the run.
    Tracked,
    /// Lineage ended by merging into another object.
    Merged,
    /// Lineage ended by splitting; successors carry it on.
    Split,
    /// Vanished with no linked successor.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageEventKind {
    Split,
    Merge,
}

/// One parent/child edge of the split-merge graph, recorded at the child's
/// first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineageEdge {
    pub parent: u32,
    pub child: u32,
    pub time: u64,
    pub kind: LineageEventKind,
}

/// The split-merge provenance graph for one object type.
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    pub edges: Vec<LineageEdge>,
}

impl LineageGraph {
    pub fn parents_of(&self, child: u32) -> Vec<u32> {
        let mut parents: Vec<u32> = self
            .edges
            .iter()
            .filter(|edge| edge.child == child)
            .map(|edge| edge.parent)
            .collect();
        parents.sort_unstable();
        parents.dedup();
        parents
    }

    pub fn children_of(&self, parent: u32) -> Vec<u32> {
        let mut children: Vec<u32> = self
            .edges
            .iter()
            .filter(|edge| edge.parent == parent)
            .map(|edge| edge.child)
            .collect();
        children.sort_unstable();
        children.dedup();
        children
    }

    /// Connected components of the undirected lineage graph: each component
    /// is one family of objects related through splits and merges.
    pub fn components(&self) -> Vec<Vec<u32>> {
        let mut parent: HashMap<u32, u32> = HashMap::new();
        fn find(parent: &mut HashMap<u32, u32>, id: u32) -> u32 {
            let next = *parent.entry(id).or_insert(id);
            if next == id {
                return id;
            }
            let root = find(parent, next);
            parent.insert(id, root);
            root
        }
        for edge in &self.edges {
            let a = find(&mut parent, edge.parent);
            let b = find(&mut parent, edge.child);
            if a != b {
                let (keep, drop) = if a < b { (a, b) } else { (b, a) };
                parent.insert(drop, keep);
            }
        }
        let mut components: HashMap<u32, Vec<u32>> = HashMap::new();
        let ids: Vec<u32> = parent.keys().copied().collect();
        for id in ids {
            let root = find(&mut parent, id);
            components.entry(root).or_default().push(id);
        }
        let mut out: Vec<Vec<u32>> = components.into_values().collect();
        for component in &mut out {
            component.sort_unstable();
        }
        out.sort();
        out
    }
}

/// Result of the relabeling pass.
#[derive(Debug, Clone, Default)]
pub struct RelabelOutcome {
    /// Rewrites applied: old id -> inherited id.
    pub id_map: HashMap<u32, u32>,
    pub lineage: LineageGraph,
    pub fates: HashMap<u32, ObjectFate>,
}

fn resolve(map: &HashMap<u32, u32>, mut id: u32) -> u32 {
    while let Some(&next) = map.get(&id) {
        if next == id {
            break;
        }
        id = next;
    }
    id
}

/// Areas per resolved id in one frame.
fn resolved_areas(mask: &Mask, map: &HashMap<u32, u32>) -> HashMap<u32, usize> {
    let mut areas = HashMap::new();
    for &value in mask.iter() {
        if value != 0 {
            *areas.entry(resolve(map, value)).or_default() += 1;
        }
    }
    areas
}

/// Overlap cells between every (previous id, current id) pair, resolved.
fn resolved_overlaps(
    previous: &Mask,
    current: &Mask,
    map: &HashMap<u32, u32>,
) -> HashMap<(u32, u32), usize> {
    let mut overlaps = HashMap::new();
    for (prev_value, cur_value) in previous.iter().zip(current.iter()) {
        if *prev_value != 0 && *cur_value != 0 {
            let key = (resolve(map, *prev_value), resolve(map, *cur_value));
            *overlaps.entry(key).or_default() += 1;
        }
    }
    overlaps
}

/// Walk the recorded frames of one object type and resolve splits and
/// merges, rewriting the output's masks, records, and attribute rows in
/// place.
///
/// `overlap_fraction` is the fraction of the predecessor's area above which
/// two lineages are linked. A split's largest-overlap successor inherits
/// the predecessor's id (when the predecessor has no continuation of its
/// own and the successor's id is fresh); the remaining overlapping fresh
/// successors are recorded as children.
pub fn relabel(output: &mut ObjectOutput, overlap_fraction: f64) -> RelabelOutcome {
    let mut map: HashMap<u32, u32> = HashMap::new();
    let mut edges: Vec<LineageEdge> = Vec::new();

    for step in 1..output.matched_masks.len() {
        let time = output.times[step];
        let (head, tail) = output.matched_masks.split_at(step);
        let previous = &head[step - 1];
        let current = &tail[0];

        let fresh: HashSet<u32> = output.records[step]
            .new_ids
            .iter()
            .map(|&id| resolve(&map, id))
            .collect();
        let previous_areas = resolved_areas(previous, &map);
        let current_areas = resolved_areas(current, &map);
        let overlaps = resolved_overlaps(previous, current, &map);

        let mut previous_ids: Vec<u32> = previous_areas.keys().copied().collect();
        previous_ids.sort_unstable();

        // Splits: one predecessor, several overlapping successors.
        for &a in &previous_ids {
            let area = previous_areas[&a] as f64;
            let mut successors: Vec<(u32, usize)> = overlaps
                .iter()
                .filter(|((p, _), _)| *p == a)
                .map(|((_, c), &cells)| (*c, cells))
                .collect();
            // Largest overlap first, lower id on ties, for determinism.
            successors.sort_by(|x, y| y.1.cmp(&x.1).then(x.0.cmp(&y.0)));
            if successors.is_empty() {
                continue;
            }
            let linked: Vec<(u32, usize)> = successors
                .iter()
                .copied()
                .filter(|&(_, cells)| cells as f64 > overlap_fraction * area)
                .collect();
            if linked.is_empty() {
                continue;
            }
            let continued = current_areas.contains_key(&a);
            let primary = linked[0].0;
            if !continued && primary != a && fresh.contains(&primary) {
                // The largest-overlap successor inherits the dead
                // predecessor's id.
                debug!(parent = a, heir = primary, time, "split heir inherits id");
                map.insert(primary, a);
            }
            let heir = if continued || fresh.contains(&primary) {
                a
            } else {
                primary
            };
            if successors.len() > 1 {
                for &(b, _) in &successors {
                    let b = resolve(&map, b);
                    if b == heir || (!fresh.contains(&b) && b != primary) {
                        continue;
                    }
                    if b != a {
                        edges.push(LineageEdge {
                            parent: a,
                            child: b,
                            time,
                            kind: LineageEventKind::Split,
                        });
                    }
                }
            }
        }

        // Merges: several linked predecessors, one successor.
        let mut current_ids: Vec<u32> = current_areas.keys().copied().collect();
        current_ids.sort_unstable();
        for &b in &current_ids {
            let b = resolve(&map, b);
            let mut linked_predecessors: Vec<u32> = previous_ids
                .iter()
                .copied()
                .filter(|&a| {
                    let cells = overlaps.get(&(a, b)).copied().unwrap_or(0) as f64;
                    cells > overlap_fraction * previous_areas[&a] as f64
                })
                .collect();
            linked_predecessors.sort_unstable();
            if linked_predecessors.len() > 1 {
                for a in linked_predecessors {
                    if a != b && !current_areas.contains_key(&a) {
                        debug!(parent = a, into = b, time, "merge recorded");
                        edges.push(LineageEdge {
                            parent: a,
                            child: b,
                            time,
                            kind: LineageEventKind::Merge,
                        });
                    }
                }
            }
        }
    }

    apply_rewrites(output, &map, &edges);

    let fates = assign_fates(output, &edges);
    let lineage = LineageGraph { edges };
    RelabelOutcome {
        id_map: map,
        lineage,
        fates,
    }
}

fn apply_rewrites(output: &mut ObjectOutput, map: &HashMap<u32, u32>, edges: &[LineageEdge]) {
    if map.is_empty() && edges.is_empty() {
        return;
    }
    for mask in &mut output.matched_masks {
        mask.mapv_inplace(|value| if value == 0 { 0 } else { resolve(map, value) });
    }
    for record in &mut output.records {
        for pair in &mut record.pairs {
            pair.universal_id = resolve(map, pair.universal_id);
        }
        let rewritten: HashMap<u32, u32> = record
            .current_to_universal
            .iter()
            .map(|(&label, &id)| (label, resolve(map, id)))
            .collect();
        record.current_to_universal = rewritten;
        for id in &mut record.new_ids {
            *id = resolve(map, *id);
        }
        for id in &mut record.dead_ids {
            *id = resolve(map, *id);
        }
        for (_, proposers) in &mut record.merger_candidates {
            for id in proposers.iter_mut() {
                *id = resolve(map, *id);
            }
            proposers.sort_unstable();
        }
    }
    for (_, membership) in &mut output.memberships {
        let translated: Membership = membership
            .iter()
            .map(|(&group_id, members)| (resolve(map, group_id), members.clone()))
            .collect();
        *membership = translated;
    }
    for row in &mut output.attributes {
        row.universal_id = resolve(map, row.universal_id);
        let mut parents: Vec<u32> = edges
            .iter()
            .filter(|edge| edge.child == row.universal_id && edge.time == row.time)
            .map(|edge| edge.parent)
            .collect();
        if !parents.is_empty() {
            parents.sort_unstable();
            parents.dedup();
            row.parents = parents;
        }
    }
}

/// Translate membership member ids through the relabel maps of the member
/// objects.
///
/// Each object is relabeled on its own, so a group's membership tables can
/// still reference member ids a member's relabel pass has since rewritten.
/// Runs once, after every object of a run has been relabeled.
pub fn apply_member_maps(outputs: &mut [ObjectOutput], relabels: &[(String, RelabelOutcome)]) {
    let maps: HashMap<&str, &HashMap<u32, u32>> = relabels
        .iter()
        .filter(|(_, outcome)| !outcome.id_map.is_empty())
        .map(|(name, outcome)| (name.as_str(), &outcome.id_map))
        .collect();
    if maps.is_empty() {
        return;
    }
    for output in outputs {
        for (_, membership) in &mut output.memberships {
            for members in membership.values_mut() {
                for (name, member_id) in members.iter_mut() {
                    if let Some(map) = maps.get(name.as_str()) {
                        *member_id = resolve(map, *member_id);
                    }
                }
                members.sort();
            }
        }
    }
}

fn assign_fates(output: &ObjectOutput, edges: &[LineageEdge]) -> HashMap<u32, ObjectFate> {
    let mut first_seen: HashMap<u32, usize> = HashMap::new();
    let mut last_seen: HashMap<u32, usize> = HashMap::new();
    for (step, mask) in output.matched_masks.iter().enumerate() {
        for id in grid::unique_labels(mask) {
            first_seen.entry(id).or_insert(step);
            last_seen.insert(id, step);
        }
    }
    let last_step = output.matched_masks.len().saturating_sub(1);

    let mut fates = HashMap::new();
    for (&id, &last) in &last_seen {
        let fate = if last == last_step {
            if first_seen[&id] == last_step && last_step > 0 {
                ObjectFate::New
            } else {
                ObjectFate::Tracked
            }
        } else {
            let end_time = output.times[last + 1];
            let merged = edges.iter().any(|edge| {
                edge.parent == id && edge.time == end_time && edge.kind == LineageEventKind::Merge
            });
            let split = edges.iter().any(|edge| {
                edge.parent == id && edge.time == end_time && edge.kind == LineageEventKind::Split
            });
            if merged {
                ObjectFate::Merged
            } else if split {
                ObjectFate::Split
            } else {
                ObjectFate::Dead
            }
        };
        fates.insert(id, fate);
    }
    fates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::record::MatchRecord;

    /// Build an output with the given mask frames and fresh-id bookkeeping
    /// reconstructed from first appearances.
    fn output_from_masks(masks: Vec<Mask>) -> ObjectOutput {
        let mut seen: HashSet<u32> = HashSet::new();
        let mut records = Vec::new();
        let mut times = Vec::new();
        let mut id_count = 0;
        for (step, mask) in masks.iter().enumerate() {
            let mut record = MatchRecord {
                time: step as u64 * 60,
                ..MatchRecord::default()
            };
            for id in grid::unique_labels(mask) {
                record.current_to_universal.insert(id, id);
                if seen.insert(id) {
                    record.new_ids.push(id);
                }
                id_count = id_count.max(id);
            }
            times.push(step as u64 * 60);
            records.push(record);
        }
        ObjectOutput {
            name: "cell".to_string(),
            tracked: true,
            times,
            matched_masks: masks,
            records,
            attributes: Vec::new(),
            memberships: Vec::new(),
            id_count,
        }
    }

    /// The canonical split case: A (area 100) overlaps B (60 cells) and C
    /// (40 cells) at the next step with threshold 50%. B inherits A's id,
    /// C becomes a child of A under a new id.
    #[test]
    fn split_heir_inherits_and_sibling_is_child() {
        let mut frame0 = Mask::zeros((10, 10));
        for row in 0..10 {
            for col in 0..10 {
                frame0[[row, col]] = 1;
            }
        }
        let mut frame1 = Mask::zeros((10, 10));
        for row in 0..6 {
            for col in 0..10 {
                frame1[[row, col]] = 2; // B, 60 cells
            }
        }
        for row in 6..10 {
            for col in 0..10 {
                frame1[[row, col]] = 3; // C, 40 cells
            }
        }

        let mut output = output_from_masks(vec![frame0, frame1]);
        let outcome = relabel(&mut output, 0.5);

        // B (id 2) inherited id 1.
        assert_eq!(outcome.id_map.get(&2), Some(&1));
        assert_eq!(grid::unique_labels(&output.matched_masks[1]), vec![1, 3]);
        // C (id 3) is a child of A.
        assert_eq!(outcome.lineage.parents_of(3), vec![1]);
        let edge = outcome
            .lineage
            .edges
            .iter()
            .find(|e| e.child == 3)
            .unwrap();
        assert_eq!(edge.kind, LineageEventKind::Split);
        assert_eq!(outcome.fates.get(&1), Some(&ObjectFate::Tracked));
    }

    #[test]
    fn membership_keys_follow_inherited_ids() {
        // Same geometry as the inheritance case, with membership tables
        // keyed by the pre-inheritance group ids.
        let mut frame0 = Mask::zeros((10, 10));
        for row in 0..10 {
            for col in 0..10 {
                frame0[[row, col]] = 1;
            }
        }
        let mut frame1 = Mask::zeros((10, 10));
        for row in 0..6 {
            for col in 0..10 {
                frame1[[row, col]] = 2;
            }
        }
        for row in 6..10 {
            for col in 0..10 {
                frame1[[row, col]] = 3;
            }
        }
        let mut output = output_from_masks(vec![frame0, frame1]);
        let mut membership = Membership::new();
        membership.insert(2, vec![("cell".to_string(), 9)]);
        membership.insert(3, vec![("cell".to_string(), 11)]);
        output.memberships.push((60, membership));

        let outcome = relabel(&mut output, 0.5);
        assert_eq!(outcome.id_map.get(&2), Some(&1));
        let (_, membership) = &output.memberships[0];
        // Group id 2 inherited id 1; id 3 is untouched.
        assert_eq!(
            membership.keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(membership[&1], vec![("cell".to_string(), 9)]);
    }

    #[test]
    fn member_ids_translate_through_member_maps() {
        let mut system = ObjectOutput {
            name: "system".to_string(),
            tracked: true,
            ..ObjectOutput::default()
        };
        let mut membership = Membership::new();
        membership.insert(1, vec![("cell".to_string(), 2), ("cell".to_string(), 4)]);
        system.memberships.push((60, membership));

        // The cell object's relabel pass rewrote 2 -> 1.
        let cell_outcome = RelabelOutcome {
            id_map: HashMap::from([(2, 1)]),
            ..RelabelOutcome::default()
        };
        let mut outputs = vec![system];
        apply_member_maps(&mut outputs, &[("cell".to_string(), cell_outcome)]);

        let (_, membership) = &outputs[0].memberships[0];
        assert_eq!(
            membership[&1],
            vec![("cell".to_string(), 1), ("cell".to_string(), 4)]
        );
    }

    #[test]
    fn merge_records_parents() {
        let mut frame0 = Mask::zeros((6, 10));
        for row in 0..6 {
            for col in 0..4 {
                frame0[[row, col]] = 1;
            }
            for col in 6..10 {
                frame0[[row, col]] = 2;
            }
        }
        let mut frame1 = Mask::zeros((6, 10));
        for row in 0..6 {
            for col in 0..10 {
                frame1[[row, col]] = 1; // matcher continued id 1; id 2 died
            }
        }
        let mut output = output_from_masks(vec![frame0, frame1]);
        let outcome = relabel(&mut output, 0.5);

        // Id 2 merged into id 1 and its lineage is terminal.
        assert_eq!(outcome.lineage.parents_of(1), vec![2]);
        assert_eq!(outcome.fates.get(&2), Some(&ObjectFate::Merged));
        assert_eq!(outcome.fates.get(&1), Some(&ObjectFate::Tracked));
    }

    #[test]
    fn plain_death_is_dead() {
        let mut frame0 = Mask::zeros((5, 5));
        frame0[[2, 2]] = 1;
        let frame1 = Mask::zeros((5, 5));
        let mut output = output_from_masks(vec![frame0, frame1]);
        let outcome = relabel(&mut output, 0.5);
        assert_eq!(outcome.fates.get(&1), Some(&ObjectFate::Dead));
        assert!(outcome.lineage.edges.is_empty());
    }

    #[test]
    fn components_group_related_lineages() {
        let graph = LineageGraph {
            edges: vec![
                LineageEdge {
                    parent: 1,
                    child: 3,
                    time: 60,
                    kind: LineageEventKind::Split,
                },
                LineageEdge {
                    parent: 2,
                    child: 3,
                    time: 60,
                    kind: LineageEventKind::Merge,
                },
                LineageEdge {
                    parent: 5,
                    child: 6,
                    time: 120,
                    kind: LineageEventKind::Split,
                },
            ],
        };
        let components = graph.components();
        assert_eq!(components, vec![vec![1, 2, 3], vec![5, 6]]);
    }
}
