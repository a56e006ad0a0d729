//! One hierarchy level of object tracks, and grouping of lower-level
//! objects into composite objects.

use std::collections::HashMap;

use ndarray::Array2;

use crate::grid::{self, Field, Mask};
use crate::options::LevelOptions;
use crate::tracker::object_tracks::{Membership, ObjectTracks};

/// The object tracks belonging to one hierarchy level, in declaration
/// order. A level is advanced as a unit: every object here is processed for
/// a timestep before the next level starts.
#[derive(Debug)]
pub struct LevelTracks {
    pub objects: Vec<ObjectTracks>,
}

impl LevelTracks {
    pub fn new(level_options: &LevelOptions) -> Self {
        let objects = level_options
            .objects
            .iter()
            .map(|object_options| ObjectTracks::new(object_options.clone()))
            .collect();
        Self { objects }
    }

    pub fn object_by_name(&self, name: &str) -> Option<&ObjectTracks> {
        self.objects.iter().find(|o| o.name() == name)
    }
}

/// Current-frame view of one member object of a grouped object.
pub struct MemberView<'a> {
    pub name: &'a str,
    /// Matched mask: labels are universal ids.
    pub matched_mask: &'a Mask,
    pub field: &'a Field,
}

/// Build a grouped object's frame from its members.
///
/// The grouped mask is the connected-component labeling of the union of
/// member footprints; components that do not touch every member object type
/// are dropped, since a composite object is only meaningful where all its
/// constituents appear. The grouped field is the cellwise maximum of member
/// fields, which is what the group's matcher correlates on.
pub fn compose_group(members: &[MemberView], shape: (usize, usize)) -> (Mask, Field) {
    let mut union = Array2::from_elem(shape, false);
    let mut field = Field::zeros(shape);
    for member in members {
        for ((row, col), &label) in member.matched_mask.indexed_iter() {
            if label != 0 {
                union[[row, col]] = true;
            }
            let value = member.field[[row, col]];
            if value > field[[row, col]] {
                field[[row, col]] = value;
            }
        }
    }
    let mut mask = grid::label_regions(&union);

    // Drop components that miss one of the member object types.
    let labels = grid::unique_labels(&mask);
    let mut dropped: Vec<u32> = Vec::new();
    for &label in &labels {
        let spans_all = members.iter().all(|member| {
            mask.indexed_iter().any(|((row, col), &value)| {
                value == label && member.matched_mask[[row, col]] != 0
            })
        });
        if !spans_all {
            dropped.push(label);
        }
    }
    if !dropped.is_empty() {
        mask.mapv_inplace(|value| if dropped.contains(&value) { 0 } else { value });
        // Relabel so group labels stay contiguous from 1.
        let remaining = grid::unique_labels(&mask);
        let relabel: HashMap<u32, u32> = remaining
            .iter()
            .enumerate()
            .map(|(index, &label)| (label, index as u32 + 1))
            .collect();
        mask = grid::apply_label_map(&mask, &relabel);
    }
    (mask, field)
}

/// Recompute group membership for the current timestep.
///
/// A member object belongs to a group when more than `min_overlap_fraction`
/// of its footprint lies inside the group's footprint. Membership is
/// recomputed from the current masks every timestep; it is never carried
/// forward, so it can change even when no id changes.
pub fn compute_membership(
    group_matched_mask: &Mask,
    members: &[MemberView],
    min_overlap_fraction: f64,
) -> Membership {
    let mut membership = Membership::new();
    for &group_id in &grid::unique_labels(group_matched_mask) {
        membership.entry(group_id).or_default();
    }
    for member in members {
        for member_id in grid::unique_labels(member.matched_mask) {
            let member_area = grid::object_cells(member.matched_mask, member_id);
            if member_area == 0 {
                continue;
            }
            let mut overlaps: HashMap<u32, usize> = HashMap::new();
            for ((row, col), &value) in member.matched_mask.indexed_iter() {
                if value != member_id {
                    continue;
                }
                let group_id = group_matched_mask[[row, col]];
                if group_id != 0 {
                    *overlaps.entry(group_id).or_default() += 1;
                }
            }
            for (group_id, overlap) in overlaps {
                if overlap as f64 / member_area as f64 > min_overlap_fraction {
                    membership
                        .entry(group_id)
                        .or_default()
                        .push((member.name.to_string(), member_id));
                }
            }
        }
    }
    for members in membership.values_mut() {
        members.sort();
    }
    membership
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn compose_unions_members_into_components() {
        let lower: Mask = array![
            [1, 1, 0, 0, 0],
            [0, 0, 0, 0, 2],
            [0, 0, 0, 0, 2],
        ];
        let upper: Mask = array![
            [0, 3, 3, 0, 0],
            [0, 0, 0, 0, 4],
            [0, 0, 0, 0, 0],
        ];
        let field_a = Field::zeros((3, 5));
        let field_b = Field::from_elem((3, 5), 1.0);
        let members = [
            MemberView {
                name: "core",
                matched_mask: &lower,
                field: &field_a,
            },
            MemberView {
                name: "anvil",
                matched_mask: &upper,
                field: &field_b,
            },
        ];
        let (mask, field) = compose_group(&members, (3, 5));
        // Two components, each touching both members, labeled from 1.
        assert_eq!(grid::unique_labels(&mask), vec![1, 2]);
        assert_eq!(mask[[0, 0]], 1);
        assert_eq!(mask[[1, 4]], 2);
        assert!((field[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn component_missing_a_member_is_dropped() {
        let lower: Mask = array![
            [1, 0, 0, 0, 2],
            [0, 0, 0, 0, 2],
        ];
        let upper: Mask = array![
            [3, 0, 0, 0, 0],
            [0, 0, 0, 0, 0],
        ];
        let field = Field::zeros((2, 5));
        let members = [
            MemberView {
                name: "core",
                matched_mask: &lower,
                field: &field,
            },
            MemberView {
                name: "anvil",
                matched_mask: &upper,
                field: &field,
            },
        ];
        let (mask, _) = compose_group(&members, (2, 5));
        // The right-hand component has no anvil cells and is dropped; the
        // survivor is relabeled to 1.
        assert_eq!(grid::unique_labels(&mask), vec![1]);
        assert_eq!(mask[[0, 4]], 0);
        assert_eq!(mask[[0, 0]], 1);
    }

    #[test]
    fn membership_respects_overlap_fraction() {
        let group: Mask = array![
            [5, 5, 5, 0],
            [5, 5, 5, 0],
        ];
        let member: Mask = array![
            [7, 7, 0, 0],
            [0, 0, 0, 8],
        ];
        let field = Field::zeros((2, 4));
        let members = [MemberView {
            name: "core",
            matched_mask: &member,
            field: &field,
        }];
        let membership = compute_membership(&group, &members, 0.5);
        // Member 7 lies fully inside group 5; member 8 not at all.
        assert_eq!(membership[&5], vec![("core".to_string(), 7)]);
    }
}
