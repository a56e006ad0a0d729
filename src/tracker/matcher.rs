//! TINT/MINT frame-to-frame correspondence.
//!
//! Each previous-frame object predicts its current position from its
//! corrected flow vector; candidate current-frame objects inside the search
//! margin are scored by predicted-position distance plus shifted-overlap,
//! and a one-to-one assignment is drawn from the resulting costs. The greedy
//! assignment in ascending previous-label order is the reference behavior;
//! a globally-optimal backend is available behind
//! [`AssignmentMethod::Optimal`].

use std::collections::HashMap;

use nalgebra::Vector2;
use ndarray::Array2;
use tracing::debug;

use crate::flow::{self, FlowCase, FlowResult};
use crate::grid::{self, Field, Mask};
use crate::options::{AssignmentMethod, GridOptions, TrackingOptions};

/// Matching outcome for one previous-frame object.
#[derive(Debug, Clone)]
pub struct ObjectMatch {
    pub previous_label: u32,
    pub current_label: Option<u32>,
    pub cost: Option<f64>,
    pub local_flow: Option<Vector2<f64>>,
    pub corrected_flow: Vector2<f64>,
    pub flow_case: FlowCase,
    pub previous_center: Option<(f64, f64)>,
    pub current_center: Option<(f64, f64)>,
}

/// Raw matcher output, before universal ids are threaded through.
#[derive(Debug, Clone, Default)]
pub struct MatchData {
    /// One entry per previous label, ascending.
    pub matches: Vec<ObjectMatch>,
    /// Current labels proposed by more than one previous label, with the
    /// proposing previous labels. Populated only for MINT.
    pub merger_candidates: Vec<(u32, Vec<u32>)>,
    pub global_flow: Option<Vector2<f64>>,
}

struct Candidate {
    current_label: u32,
    cost: f64,
}

/// Inputs for one matching step. Flow history is keyed by previous-frame
/// label and carries the smoothed corrected flow of that object's lineage.
pub struct MatcherInput<'a> {
    pub previous_mask: &'a Mask,
    pub previous_field: &'a Field,
    pub current_mask: &'a Mask,
    pub current_field: &'a Field,
    pub flow_history: &'a HashMap<u32, Vector2<f64>>,
}

/// Physical distance between two (row, col) points.
fn physical_distance(a: (f64, f64), b: (f64, f64), grid_options: &GridOptions) -> f64 {
    let dr = (a.0 - b.0) * grid_options.row_spacing;
    let dc = (a.1 - b.1) * grid_options.col_spacing;
    (dr * dr + dc * dc).sqrt()
}

/// Match all objects in the previous mask to those in the current mask.
pub fn match_masks(
    input: &MatcherInput,
    grid_options: &GridOptions,
    tracking: &TrackingOptions,
) -> MatchData {
    let options = tracking.tint();
    let previous_labels = grid::unique_labels(input.previous_mask);
    if previous_labels.is_empty() {
        return MatchData::default();
    }

    let shared_global = if options.unique_global_flow {
        flow::global_flow(
            input.previous_field,
            input.current_field,
            None,
            grid_options,
            options,
        )
    } else {
        None
    };

    let search_rows = grid_options.row_cells(options.search_margin);
    let search_cols = grid_options.col_cells(options.search_margin);
    // Weight converting missing overlap into the cost's distance units.
    let overlap_weight = 0.5 * options.search_margin;

    let mut matches = Vec::with_capacity(previous_labels.len());
    let mut candidates: Vec<Vec<Candidate>> = Vec::with_capacity(previous_labels.len());

    for &label in &previous_labels {
        let bbox = match grid::bounding_box(input.previous_mask, label) {
            Some(bbox) => bbox,
            None => continue,
        };
        let local = flow::local_flow(
            input.previous_field,
            input.current_field,
            &bbox,
            grid_options,
            options,
        );
        let global = match (&shared_global, options.unique_global_flow) {
            (Some(result), true) => Some(*result),
            _ => flow::global_flow(
                input.previous_field,
                input.current_field,
                Some(&bbox),
                grid_options,
                options,
            ),
        };
        let global_vector = global.map(|r| r.flow).unwrap_or_else(Vector2::zeros);
        let history = input.flow_history.get(&label).copied();
        let (corrected, case) = flow::correct_flow(local, global_vector, history, tracking);

        let previous_center = grid::object_center(input.previous_mask, label);
        let predicted = previous_center
            .map(|(row, col)| (row + corrected[0], col + corrected[1]))
            .unwrap_or((0.0, 0.0));

        let search_box = grid::BoundingBox::new(
            predicted.0.round() as i64 - search_rows,
            predicted.0.round() as i64 + search_rows,
            predicted.1.round() as i64 - search_cols,
            predicted.1.round() as i64 + search_cols,
        );
        let found = grid::labels_in_box(input.current_mask, &search_box);
        let previous_area = grid::object_cells(input.previous_mask, label) as f64;

        let mut object_candidates = Vec::with_capacity(found.len());
        for current_label in found {
            let current_center = match grid::object_center(input.current_mask, current_label) {
                Some(center) => center,
                None => continue,
            };
            let distance = physical_distance(predicted, current_center, grid_options);
            let overlap_cells = grid::shifted_overlap_cells(
                input.previous_mask,
                label,
                corrected[0].round() as i64,
                corrected[1].round() as i64,
                input.current_mask,
                current_label,
            );
            let overlap = overlap_cells as f64 / previous_area.max(1.0);
            let cost = distance + (1.0 - overlap.min(1.0)) * overlap_weight;
            if cost <= options.max_cost {
                object_candidates.push(Candidate {
                    current_label,
                    cost,
                });
            }
        }

        candidates.push(object_candidates);
        matches.push(ObjectMatch {
            previous_label: label,
            current_label: None,
            cost: None,
            local_flow: local.map(|r: FlowResult| r.flow),
            corrected_flow: corrected,
            flow_case: case,
            previous_center,
            current_center: None,
        });
    }

    let merger_candidates = if tracking.flag_mergers() {
        find_merger_candidates(&matches, &candidates)
    } else {
        Vec::new()
    };

    match options.assignment {
        AssignmentMethod::Greedy => assign_greedy(&mut matches, &candidates),
        AssignmentMethod::Optimal => assign_optimal(&mut matches, &candidates, options.max_cost),
    }

    for object_match in &mut matches {
        if let Some(current_label) = object_match.current_label {
            object_match.current_center = grid::object_center(input.current_mask, current_label);
        }
    }

    let matched = matches.iter().filter(|m| m.current_label.is_some()).count();
    debug!(
        previous = matches.len(),
        matched,
        mergers = merger_candidates.len(),
        "matched objects"
    );

    MatchData {
        matches,
        merger_candidates,
        global_flow: shared_global.map(|r| r.flow),
    }
}

/// Greedy one-to-one assignment.
///
/// Previous objects claim candidates in ascending previous-label order; a
/// claimed current label leaves the pool for everyone after it. Within one
/// object, cost ties break toward the lower current label, which makes the
/// assignment deterministic for identical inputs.
fn assign_greedy(matches: &mut [ObjectMatch], candidates: &[Vec<Candidate>]) {
    let mut claimed: Vec<u32> = Vec::new();
    for (object_match, object_candidates) in matches.iter_mut().zip(candidates) {
        let mut best: Option<&Candidate> = None;
        for candidate in object_candidates {
            if claimed.contains(&candidate.current_label) {
                continue;
            }
            best = match best {
                None => Some(candidate),
                Some(current_best) => {
                    if candidate.cost < current_best.cost
                        || (candidate.cost == current_best.cost
                            && candidate.current_label < current_best.current_label)
                    {
                        Some(candidate)
                    } else {
                        Some(current_best)
                    }
                }
            };
        }
        if let Some(candidate) = best {
            claimed.push(candidate.current_label);
            object_match.current_label = Some(candidate.current_label);
            object_match.cost = Some(candidate.cost);
        }
    }
}

/// Globally-optimal assignment via Jonker-Volgenant on a padded square cost
/// matrix. Matches above the cost bound are discarded afterwards, mirroring
/// the greedy acceptance rule.
fn assign_optimal(matches: &mut [ObjectMatch], candidates: &[Vec<Candidate>], max_cost: f64) {
    let mut current_labels: Vec<u32> = candidates
        .iter()
        .flat_map(|c| c.iter().map(|candidate| candidate.current_label))
        .collect();
    current_labels.sort_unstable();
    current_labels.dedup();
    if current_labels.is_empty() {
        return;
    }

    const UNREACHABLE: f64 = 1e6;
    let size = matches.len().max(current_labels.len());
    let mut cost_matrix = Array2::<f64>::from_elem((size, size), UNREACHABLE);
    for (row, object_candidates) in candidates.iter().enumerate() {
        for candidate in object_candidates {
            let col = current_labels
                .binary_search(&candidate.current_label)
                .expect("candidate label present");
            cost_matrix[[row, col]] = candidate.cost;
        }
    }

    if let Ok((row_to_col, _)) = lapjv::lapjv(&cost_matrix) {
        for (row, &col) in row_to_col.iter().enumerate() {
            if row >= matches.len() || col >= current_labels.len() {
                continue;
            }
            let cost = cost_matrix[[row, col]];
            if cost <= max_cost {
                matches[row].current_label = Some(current_labels[col]);
                matches[row].cost = Some(cost);
            }
        }
    }
}

/// Current labels with acceptable proposals from more than one previous
/// object. Advisory only: the one-to-one output is unaffected.
fn find_merger_candidates(
    matches: &[ObjectMatch],
    candidates: &[Vec<Candidate>],
) -> Vec<(u32, Vec<u32>)> {
    let mut proposals: HashMap<u32, Vec<u32>> = HashMap::new();
    for (object_match, object_candidates) in matches.iter().zip(candidates) {
        for candidate in object_candidates {
            proposals
                .entry(candidate.current_label)
                .or_default()
                .push(object_match.previous_label);
        }
    }
    let mut mergers: Vec<(u32, Vec<u32>)> = proposals
        .into_iter()
        .filter(|(_, proposers)| proposers.len() > 1)
        .collect();
    for (_, proposers) in &mut mergers {
        proposers.sort_unstable();
    }
    mergers.sort_unstable_by_key(|(label, _)| *label);
    mergers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{MintOptions, TintOptions};

    fn square(mask: &mut Mask, field: &mut Field, label: u32, row: usize, col: usize, size: usize) {
        for dr in 0..size {
            for dc in 0..size {
                mask[[row + dr, col + dc]] = label;
                field[[row + dr, col + dc]] = 10.0;
            }
        }
    }

    fn frame(shape: (usize, usize)) -> (Mask, Field) {
        (Mask::zeros(shape), Field::zeros(shape))
    }

    fn tint() -> TrackingOptions {
        TrackingOptions::Tint(TintOptions {
            search_margin: 6.0,
            flow_margin: 5.0,
            max_cost: 20.0,
            ..TintOptions::default()
        })
    }

    #[test]
    fn translating_object_matches() {
        let (mut prev_mask, mut prev_field) = frame((20, 20));
        let (mut cur_mask, mut cur_field) = frame((20, 20));
        square(&mut prev_mask, &mut prev_field, 1, 5, 5, 3);
        square(&mut cur_mask, &mut cur_field, 1, 7, 6, 3);

        let history = HashMap::new();
        let input = MatcherInput {
            previous_mask: &prev_mask,
            previous_field: &prev_field,
            current_mask: &cur_mask,
            current_field: &cur_field,
            flow_history: &history,
        };
        let data = match_masks(&input, &GridOptions::default(), &tint());
        assert_eq!(data.matches.len(), 1);
        assert_eq!(data.matches[0].current_label, Some(1));
    }

    #[test]
    fn matching_is_deterministic() {
        let (mut prev_mask, mut prev_field) = frame((30, 30));
        let (mut cur_mask, mut cur_field) = frame((30, 30));
        square(&mut prev_mask, &mut prev_field, 1, 5, 5, 3);
        square(&mut prev_mask, &mut prev_field, 2, 5, 15, 3);
        square(&mut cur_mask, &mut cur_field, 1, 6, 6, 3);
        square(&mut cur_mask, &mut cur_field, 2, 6, 16, 3);

        let history = HashMap::new();
        let input = MatcherInput {
            previous_mask: &prev_mask,
            previous_field: &prev_field,
            current_mask: &cur_mask,
            current_field: &cur_field,
            flow_history: &history,
        };
        let grid_options = GridOptions::default();
        let first = match_masks(&input, &grid_options, &tint());
        let second = match_masks(&input, &grid_options, &tint());
        for (a, b) in first.matches.iter().zip(&second.matches) {
            assert_eq!(a.current_label, b.current_label);
            assert_eq!(a.cost, b.cost);
        }
    }

    #[test]
    fn claimed_candidate_leaves_pool() {
        // Two previous objects converging on one current object: only the
        // cheaper (first in ascending label order on a tie) may claim it.
        let (mut prev_mask, mut prev_field) = frame((20, 20));
        let (mut cur_mask, mut cur_field) = frame((20, 20));
        square(&mut prev_mask, &mut prev_field, 1, 5, 4, 3);
        square(&mut prev_mask, &mut prev_field, 2, 5, 10, 3);
        square(&mut cur_mask, &mut cur_field, 1, 5, 7, 3);

        let history = HashMap::new();
        let input = MatcherInput {
            previous_mask: &prev_mask,
            previous_field: &prev_field,
            current_mask: &cur_mask,
            current_field: &cur_field,
            flow_history: &history,
        };
        let data = match_masks(&input, &GridOptions::default(), &tint());
        let matched: Vec<_> = data
            .matches
            .iter()
            .filter(|m| m.current_label.is_some())
            .collect();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn mint_flags_merger_candidates() {
        let (mut prev_mask, mut prev_field) = frame((20, 20));
        let (mut cur_mask, mut cur_field) = frame((20, 20));
        square(&mut prev_mask, &mut prev_field, 1, 5, 4, 3);
        square(&mut prev_mask, &mut prev_field, 2, 5, 10, 3);
        square(&mut cur_mask, &mut cur_field, 1, 5, 7, 3);

        let tracking = TrackingOptions::Mint(MintOptions {
            tint: TintOptions {
                search_margin: 8.0,
                flow_margin: 5.0,
                max_cost: 30.0,
                ..TintOptions::default()
            },
            max_shift_disparity_alt: 25.0,
        });
        let history = HashMap::new();
        let input = MatcherInput {
            previous_mask: &prev_mask,
            previous_field: &prev_field,
            current_mask: &cur_mask,
            current_field: &cur_field,
            flow_history: &history,
        };
        let data = match_masks(&input, &GridOptions::default(), &tracking);
        assert_eq!(data.merger_candidates.len(), 1);
        assert_eq!(data.merger_candidates[0].0, 1);
        assert_eq!(data.merger_candidates[0].1, vec![1, 2]);
        // One-to-one output contract still holds.
        let matched: Vec<_> = data
            .matches
            .iter()
            .filter_map(|m| m.current_label)
            .collect();
        assert_eq!(matched.len(), 1);
    }
}
