//! Per-timestep correspondence record between consecutive frames.

use std::collections::HashMap;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::flow::FlowCase;

/// One previous-frame object and what became of it this timestep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPair {
    /// Local label in the previous frame.
    pub previous_label: u32,
    /// Persistent identity of the object.
    pub universal_id: u32,
    /// Matched local label in the current frame, `None` when the object died.
    pub current_label: Option<u32>,
    /// Raw local flow (row, col cells), when a local estimate existed.
    pub local_flow: Option<[f64; 2]>,
    /// Flow after correction against the global vector and history. This is
    /// the displacement used for prediction and reported as velocity.
    pub corrected_flow: Option<[f64; 2]>,
    /// Which correction branch produced the corrected flow.
    #[serde(skip)]
    pub flow_case: Option<FlowCase>,
    /// Assignment cost of the selected match.
    pub cost: Option<f64>,
    /// Area-weighted centers in (row, col) cell units.
    pub previous_center: Option<[f64; 2]>,
    pub current_center: Option<[f64; 2]>,
}

impl MatchPair {
    pub fn corrected_flow_vector(&self) -> Option<Vector2<f64>> {
        self.corrected_flow.map(|f| Vector2::new(f[0], f[1]))
    }

    /// Centroid difference between matched centers. Diagnostic only; jumps
    /// discontinuously across merges and shape changes, so it is never used
    /// as the reported velocity.
    pub fn center_displacement(&self) -> Option<[f64; 2]> {
        match (self.previous_center, self.current_center) {
            (Some(p), Some(c)) => Some([c[0] - p[0], c[1] - p[1]]),
            _ => None,
        }
    }
}

/// The full correspondence between a previous and current mask for one
/// object type at one timestep.
///
/// Invariants: each current label maps to exactly one universal id, and no
/// current label is the match target of more than one previous label. Merges
/// and splits are not resolved here; the MINT variant only flags candidate
/// mergers for the relabeling pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRecord {
    pub time: u64,
    /// One entry per previous-frame label, ascending by label.
    pub pairs: Vec<MatchPair>,
    /// Current-frame label -> universal id, total over current labels.
    pub current_to_universal: HashMap<u32, u32>,
    /// Universal ids that appeared this frame.
    pub new_ids: Vec<u32>,
    /// Universal ids that vanished at the previous step.
    pub dead_ids: Vec<u32>,
    /// Current labels proposed as a match target by more than one previous
    /// object, with the proposing universal ids. MINT only.
    pub merger_candidates: Vec<(u32, Vec<u32>)>,
    /// Global (background advection) flow for this step.
    pub global_flow: Option<[f64; 2]>,
}

impl MatchRecord {
    /// Universal id assigned to a current-frame label.
    pub fn universal_id(&self, current_label: u32) -> Option<u32> {
        self.current_to_universal.get(&current_label).copied()
    }

    /// Check the one-to-one output contract. Used by tests.
    pub fn is_one_to_one(&self) -> bool {
        let mut targets: Vec<u32> = self
            .pairs
            .iter()
            .filter_map(|pair| pair.current_label)
            .collect();
        let before = targets.len();
        targets.sort_unstable();
        targets.dedup();
        let mut ids: Vec<u32> = self.current_to_universal.values().copied().collect();
        let id_count = ids.len();
        ids.sort_unstable();
        ids.dedup();
        targets.len() == before && ids.len() == id_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_to_one_detects_duplicates() {
        let mut record = MatchRecord::default();
        record.pairs.push(MatchPair {
            previous_label: 1,
            universal_id: 10,
            current_label: Some(3),
            local_flow: None,
            corrected_flow: None,
            flow_case: None,
            cost: None,
            previous_center: None,
            current_center: None,
        });
        record.current_to_universal.insert(3, 10);
        assert!(record.is_one_to_one());

        record.pairs.push(MatchPair {
            previous_label: 2,
            universal_id: 11,
            current_label: Some(3),
            local_flow: None,
            corrected_flow: None,
            flow_case: None,
            cost: None,
            previous_center: None,
            current_center: None,
        });
        assert!(!record.is_one_to_one());
    }
}
